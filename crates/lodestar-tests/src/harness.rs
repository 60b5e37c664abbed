//! In-memory connector, transport, and call fakes for channel tests.
//!
//! Connections complete inline, so everything up to the first transport batch
//! runs synchronously inside `start_batch`. Each created call is registered
//! with the connector and driven from the test through [`FakeCallControl`]:
//! the test plays the server role, delivering initial metadata, messages, and
//! a final status.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use lodestar_channel::bytestream::SliceBuffer;
use lodestar_channel::error::{ChannelError, Result, StatusCode};
use lodestar_channel::metadata::Metadata;
use lodestar_channel::resolver::Address;
use lodestar_channel::subchannel::{ConnectCallback, Connector};
use lodestar_channel::transport::{
    BatchResult, OnComplete, RecvInitialMetadata, RecvInitialMetadataReady, RecvMessageReady,
    SendInitialMetadata, StreamOpBatch, Transport, TransportCall, TransportCallArgs,
};

/// Tracks completion of one in-flight batch on a fake call.
struct BatchProgress {
    remaining: Mutex<usize>,
    on_complete: Mutex<Option<OnComplete>>,
    error: Mutex<Option<ChannelError>>,
    trailing: Mutex<Option<Metadata>>,
}

impl BatchProgress {
    fn new(remaining: usize, on_complete: Option<OnComplete>) -> Arc<BatchProgress> {
        Arc::new(BatchProgress {
            remaining: Mutex::new(remaining),
            on_complete: Mutex::new(on_complete),
            error: Mutex::new(None),
            trailing: Mutex::new(None),
        })
    }

    fn op_done(self: &Arc<Self>) {
        let fire = {
            let mut remaining = self.remaining.lock().unwrap();
            *remaining -= 1;
            *remaining == 0
        };
        if fire {
            if let Some(on_complete) = self.on_complete.lock().unwrap().take() {
                on_complete(BatchResult {
                    error: self.error.lock().unwrap().take(),
                    trailing_metadata: self.trailing.lock().unwrap().take(),
                });
            }
        }
    }

    fn fail_op(self: &Arc<Self>, error: ChannelError) {
        let mut stored = self.error.lock().unwrap();
        if stored.is_none() {
            *stored = Some(error);
        }
        drop(stored);
        self.op_done();
    }
}

struct CallState {
    sent_initial_metadata: Option<SendInitialMetadata>,
    sent_messages: Vec<Bytes>,
    half_closed: bool,
    cancelled: Option<ChannelError>,
    waiting_initial: Option<(RecvInitialMetadataReady, Arc<BatchProgress>)>,
    waiting_messages: VecDeque<(RecvMessageReady, Arc<BatchProgress>)>,
    waiting_status: Vec<Arc<BatchProgress>>,
    queued_initial: Option<RecvInitialMetadata>,
    queued_messages: VecDeque<Option<Bytes>>,
    finished: Option<Metadata>,
}

struct FakeCallShared {
    address: Address,
    path: String,
    state: Mutex<CallState>,
}

/// Test-side handle to one call created on a fake transport.
#[derive(Clone)]
pub struct FakeCallControl {
    shared: Arc<FakeCallShared>,
}

impl FakeCallControl {
    /// The backend address the call was created on.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// The request path.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Initial metadata the client sent, once it arrives.
    pub fn sent_initial_metadata(&self) -> Option<SendInitialMetadata> {
        self.shared.state.lock().unwrap().sent_initial_metadata.clone()
    }

    /// Messages the client sent so far, each fully assembled.
    pub fn sent_messages(&self) -> Vec<Bytes> {
        self.shared.state.lock().unwrap().sent_messages.clone()
    }

    /// Whether the client half-closed the send side.
    pub fn half_closed(&self) -> bool {
        self.shared.state.lock().unwrap().half_closed
    }

    /// The cancellation error, if the client cancelled the call.
    pub fn cancelled(&self) -> Option<ChannelError> {
        self.shared.state.lock().unwrap().cancelled.clone()
    }

    /// Delivers response initial metadata (not Trailers-Only).
    pub fn respond_initial(&self, metadata: Metadata) {
        let received = RecvInitialMetadata {
            metadata,
            trailers_only: false,
        };
        let waiting = {
            let mut state = self.shared.state.lock().unwrap();
            match state.waiting_initial.take() {
                Some(waiting) => Some(waiting),
                None => {
                    state.queued_initial = Some(received.clone());
                    None
                }
            }
        };
        if let Some((ready, progress)) = waiting {
            ready(Ok(received));
            progress.op_done();
        }
    }

    /// Delivers one response message.
    pub fn respond_message(&self, message: impl Into<Bytes>) {
        let message = message.into();
        let waiting = {
            let mut state = self.shared.state.lock().unwrap();
            match state.waiting_messages.pop_front() {
                Some(waiting) => Some(waiting),
                None => {
                    state.queued_messages.push_back(Some(message.clone()));
                    None
                }
            }
        };
        if let Some((ready, progress)) = waiting {
            ready(Ok(Some(message)));
            progress.op_done();
        }
    }

    /// Ends the stream with `status`: outstanding message reads see end of
    /// stream and the trailing metadata carries `grpc-status`.
    pub fn finish(&self, status: StatusCode, mut trailing: Metadata) {
        trailing.set_grpc_status(status);
        let (messages, statuses) = {
            let mut state = self.shared.state.lock().unwrap();
            state.finished = Some(trailing.clone());
            (
                std::mem::take(&mut state.waiting_messages),
                std::mem::take(&mut state.waiting_status),
            )
        };
        for (ready, progress) in messages {
            ready(Ok(None));
            progress.op_done();
        }
        for progress in statuses {
            *progress.trailing.lock().unwrap() = Some(trailing.clone());
            progress.op_done();
        }
    }

    /// Ends the stream Trailers-Only: headers and trailers arrive together
    /// with `status` and no message.
    pub fn finish_trailers_only(&self, status: StatusCode) {
        let mut trailing = Metadata::new();
        trailing.set_grpc_status(status);
        let received = RecvInitialMetadata {
            metadata: trailing.clone(),
            trailers_only: true,
        };
        let waiting_initial = {
            let mut state = self.shared.state.lock().unwrap();
            match state.waiting_initial.take() {
                Some(waiting) => Some(waiting),
                None => {
                    state.queued_initial = Some(received.clone());
                    None
                }
            }
        };
        if let Some((ready, progress)) = waiting_initial {
            ready(Ok(received));
            progress.op_done();
        }
        self.finish(status, Metadata::new());
    }
}

struct FakeCallEndpoint {
    shared: Arc<FakeCallShared>,
}

impl TransportCall for FakeCallEndpoint {
    fn start_batch(&self, mut batch: StreamOpBatch) {
        let ops = usize::from(batch.send_initial_metadata.is_some())
            + usize::from(batch.send_message.is_some())
            + usize::from(batch.send_trailing_metadata.is_some())
            + usize::from(batch.recv_initial_metadata.is_some())
            + usize::from(batch.recv_message.is_some())
            + usize::from(batch.recv_trailing_metadata)
            + usize::from(batch.cancel_stream.is_some());
        let progress = BatchProgress::new(ops, batch.on_complete.take());
        if let Some(error) = batch.cancel_stream.take() {
            let (initial, messages, statuses) = {
                let mut state = self.shared.state.lock().unwrap();
                state.cancelled = Some(error.clone());
                (
                    state.waiting_initial.take(),
                    std::mem::take(&mut state.waiting_messages),
                    std::mem::take(&mut state.waiting_status),
                )
            };
            if let Some((ready, waiting)) = initial {
                ready(Err(error.clone()));
                waiting.fail_op(error.clone());
            }
            for (ready, waiting) in messages {
                ready(Err(error.clone()));
                waiting.fail_op(error.clone());
            }
            for waiting in statuses {
                waiting.fail_op(error.clone());
            }
            progress.op_done();
            return;
        }
        // A batch arriving after cancellation fails outright.
        let already_cancelled = self.shared.state.lock().unwrap().cancelled.clone();
        if let Some(error) = already_cancelled {
            if let Some(ready) = batch.recv_initial_metadata.take() {
                ready(Err(error.clone()));
                progress.fail_op(error.clone());
            }
            if let Some(ready) = batch.recv_message.take() {
                ready(Err(error.clone()));
                progress.fail_op(error.clone());
            }
            let mut rest = usize::from(batch.send_initial_metadata.is_some())
                + usize::from(batch.send_message.is_some())
                + usize::from(batch.send_trailing_metadata.is_some())
                + usize::from(batch.recv_trailing_metadata);
            while rest > 0 {
                progress.fail_op(error.clone());
                rest -= 1;
            }
            return;
        }
        if let Some(send) = batch.send_initial_metadata.take() {
            self.shared.state.lock().unwrap().sent_initial_metadata = Some(send);
            progress.op_done();
        }
        if let Some(mut message) = batch.send_message.take() {
            let mut assembled = Vec::new();
            while let Ok(Some(slice)) = message.pull() {
                assembled.extend_from_slice(&slice);
            }
            self.shared
                .state
                .lock()
                .unwrap()
                .sent_messages
                .push(Bytes::from(assembled));
            progress.op_done();
        }
        if batch.send_trailing_metadata.take().is_some() {
            self.shared.state.lock().unwrap().half_closed = true;
            progress.op_done();
        }
        if let Some(ready) = batch.recv_initial_metadata.take() {
            let queued = self.shared.state.lock().unwrap().queued_initial.take();
            match queued {
                Some(received) => {
                    ready(Ok(received));
                    progress.op_done();
                }
                None => {
                    self.shared.state.lock().unwrap().waiting_initial =
                        Some((ready, Arc::clone(&progress)));
                }
            }
        }
        if let Some(ready) = batch.recv_message.take() {
            let queued = {
                let mut state = self.shared.state.lock().unwrap();
                match state.queued_messages.pop_front() {
                    Some(message) => Some(message),
                    None if state.finished.is_some() => Some(None),
                    None => None,
                }
            };
            match queued {
                Some(message) => {
                    ready(Ok(message));
                    progress.op_done();
                }
                None => {
                    self.shared
                        .state
                        .lock()
                        .unwrap()
                        .waiting_messages
                        .push_back((ready, Arc::clone(&progress)));
                }
            }
        }
        if batch.recv_trailing_metadata {
            let finished = self.shared.state.lock().unwrap().finished.clone();
            match finished {
                Some(trailing) => {
                    *progress.trailing.lock().unwrap() = Some(trailing);
                    progress.op_done();
                }
                None => {
                    self.shared
                        .state
                        .lock()
                        .unwrap()
                        .waiting_status
                        .push(Arc::clone(&progress));
                }
            }
        }
    }
}

struct FakeTransport {
    address: Address,
    registry: Arc<Mutex<ConnectorState>>,
}

impl Transport for FakeTransport {
    fn create_call(&self, args: &TransportCallArgs) -> Result<Box<dyn TransportCall>> {
        let shared = Arc::new(FakeCallShared {
            address: self.address.clone(),
            path: args.path.clone(),
            state: Mutex::new(CallState {
                sent_initial_metadata: None,
                sent_messages: Vec::new(),
                half_closed: false,
                cancelled: None,
                waiting_initial: None,
                waiting_messages: VecDeque::new(),
                waiting_status: Vec::new(),
                queued_initial: None,
                queued_messages: VecDeque::new(),
                finished: None,
            }),
        });
        self.registry.lock().unwrap().calls.push(FakeCallControl {
            shared: Arc::clone(&shared),
        });
        Ok(Box::new(FakeCallEndpoint { shared }))
    }
}

#[derive(Default)]
struct ConnectorState {
    refuse: HashSet<Address>,
    calls: Vec<FakeCallControl>,
    connects: HashMap<Address, usize>,
}

/// Connector whose connections complete inline and register their calls.
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    /// Creates a connector accepting every address.
    pub fn new() -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            state: Arc::new(Mutex::new(ConnectorState::default())),
        })
    }

    /// Makes connections to `address` fail until re-accepted.
    pub fn refuse(&self, address: &str) {
        self.state.lock().unwrap().refuse.insert(address.to_string());
    }

    /// Re-accepts connections to `address`.
    pub fn accept(&self, address: &str) {
        self.state.lock().unwrap().refuse.remove(address);
    }

    /// Number of connection attempts to `address`.
    pub fn connect_count(&self, address: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connects
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Every call created so far, in creation order.
    pub fn calls(&self) -> Vec<FakeCallControl> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls created for one request path.
    pub fn calls_for_path(&self, path: &str) -> Vec<FakeCallControl> {
        self.calls()
            .into_iter()
            .filter(|call| call.path() == path)
            .collect()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, address: &Address, on_done: ConnectCallback) {
        let refused = {
            let mut state = self.state.lock().unwrap();
            *state.connects.entry(address.clone()).or_insert(0) += 1;
            state.refuse.contains(address)
        };
        if refused {
            on_done(Err(ChannelError::Unavailable(format!(
                "connection refused to {address}"
            ))));
        } else {
            on_done(Ok(Arc::new(FakeTransport {
                address: address.clone(),
                registry: Arc::clone(&self.state),
            })));
        }
    }
}

/// Captures the surface-side callbacks of one call for assertions.
#[derive(Default)]
pub struct CallObserver {
    /// Results delivered to `recv_initial_metadata_ready`.
    pub recv_initial: Mutex<Vec<Result<RecvInitialMetadata>>>,
    /// Results delivered to `recv_message_ready`.
    pub recv_messages: Mutex<Vec<Result<Option<Bytes>>>>,
    /// Batch completions, with any trailing metadata.
    pub completions: Mutex<Vec<BatchResult>>,
}

impl CallObserver {
    /// Creates an empty observer.
    pub fn new() -> Arc<CallObserver> {
        Arc::new(CallObserver::default())
    }

    /// Builds a full unary batch (all five directional ops) recording its
    /// callbacks into this observer.
    pub fn unary_batch(
        self: &Arc<Self>,
        metadata: Metadata,
        flags: u32,
        message: &str,
    ) -> StreamOpBatch {
        let initial = Arc::clone(self);
        let messages = Arc::clone(self);
        let completions = Arc::clone(self);
        StreamOpBatch {
            send_initial_metadata: Some(SendInitialMetadata { metadata, flags }),
            send_message: Some(Box::new(SliceBuffer::from_bytes(message.to_string()))),
            send_trailing_metadata: Some(Metadata::new()),
            recv_initial_metadata: Some(Box::new(move |result| {
                initial.recv_initial.lock().unwrap().push(result);
            })),
            recv_message: Some(Box::new(move |result| {
                messages.recv_messages.lock().unwrap().push(result);
            })),
            recv_trailing_metadata: true,
            cancel_stream: None,
            on_complete: Some(Box::new(move |result| {
                completions.completions.lock().unwrap().push(result);
            })),
        }
    }

    /// The final status of the call, from the completion's trailing metadata
    /// or its error.
    pub fn final_status(&self) -> Option<StatusCode> {
        let completions = self.completions.lock().unwrap();
        let last = completions.last()?;
        match (&last.error, &last.trailing_metadata) {
            (Some(error), _) => Some(error.status_code()),
            (None, Some(trailing)) => trailing.grpc_status(),
            (None, None) => None,
        }
    }

    /// Number of batch completions observed.
    pub fn num_completions(&self) -> usize {
        self.completions.lock().unwrap().len()
    }
}
