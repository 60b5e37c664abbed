//! Per-subchannel health watching.
//!
//! Each connected subchannel may run a streaming health-watch call whose
//! responses gate whether the subchannel is considered READY. A `SERVING`
//! response publishes `Ready`; anything else publishes `TransientFailure`.
//! A server that does not implement the health service is assumed healthy.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backoff::{Backoff, BackoffConfig};
use crate::connectivity::{ConnectivityState, ConnectivityTracker, StateCallback};
use crate::error::{ChannelError, Result, StatusCode};
use crate::metadata::Metadata;
use crate::serializer::Serializer;
use crate::subchannel::{ConnectedSubchannel, SubchannelCall};
use crate::timer::TimerHandle;
use crate::transport::{
    BatchResult, SendInitialMetadata, StreamOpBatch, TransportCallArgs,
};

/// Request path of the health-watch streaming call.
pub const HEALTH_WATCH_PATH: &str = "/lodestar.health.v1.Health/Watch";

/// Health-watch request naming the service to watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    /// Configured service name; empty watches the server as a whole.
    pub service: String,
}

/// Serving verdict carried in each health-watch response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    /// The server cannot judge the service's health.
    Unknown,
    /// The service is serving.
    Serving,
    /// The service is not serving.
    NotServing,
    /// The server does not know the watched service.
    ServiceUnknown,
}

/// One health-watch response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// The serving verdict.
    pub status: ServingStatus,
}

/// Encodes a health-watch request for the wire.
pub fn encode_health_request(request: &HealthCheckRequest) -> Bytes {
    Bytes::from(serde_json::to_vec(request).expect("health request serializes"))
}

/// Decodes a health-watch response.
pub fn decode_health_response(bytes: &[u8]) -> Result<HealthCheckResponse> {
    serde_json::from_slice(bytes)
        .map_err(|err| ChannelError::Internal(format!("malformed health response: {err}")))
}

struct HealthInner {
    call: Option<Arc<SubchannelCall>>,
    backoff: Backoff,
    backoff_started: bool,
    retry_timer: Option<TimerHandle>,
    saw_serving_this_stream: bool,
    shut_down: bool,
}

/// Streaming health-watch client for one connected subchannel.
///
/// Publishes its verdicts through the standard connectivity-tracker contract;
/// the owning subchannel mirrors them into its own state.
pub struct HealthCheckClient {
    me: Weak<HealthCheckClient>,
    service_name: String,
    connected: Arc<ConnectedSubchannel>,
    serializer: Serializer,
    tracker: ConnectivityTracker,
    inner: Mutex<HealthInner>,
}

impl HealthCheckClient {
    /// Creates the client and starts the first watch call.
    pub fn new(
        service_name: String,
        connected: Arc<ConnectedSubchannel>,
        serializer: Serializer,
    ) -> Arc<HealthCheckClient> {
        let client = Arc::new_cyclic(|me| HealthCheckClient {
            me: me.clone(),
            service_name,
            connected,
            serializer: serializer.clone(),
            tracker: ConnectivityTracker::new("health", ConnectivityState::Connecting),
            inner: Mutex::new(HealthInner {
                call: None,
                backoff: Backoff::new(BackoffConfig::default()),
                backoff_started: false,
                retry_timer: None,
                saw_serving_this_stream: false,
                shut_down: false,
            }),
        });
        let starter = Arc::clone(&client);
        serializer.schedule(move || starter.start_call());
        client
    }

    /// Current verdict as a connectivity state.
    pub fn state(&self) -> ConnectivityState {
        self.tracker.current()
    }

    /// Registers a one-shot watcher on the verdict.
    pub fn notify_on_state_change(&self, last_seen: ConnectivityState, notify: StateCallback) {
        self.tracker.notify_on_state_change(last_seen, notify);
    }

    fn start_call(self: &Arc<Self>) {
        if self.inner.lock().unwrap().shut_down {
            return;
        }
        let args = TransportCallArgs {
            path: HEALTH_WATCH_PATH.to_string(),
            start_time: Instant::now(),
            deadline: None,
        };
        let call = match self.connected.create_call(&args, false) {
            Ok(call) => call,
            Err(error) => {
                self.on_stream_done(BatchResult::failed(error));
                return;
            }
        };
        {
            let mut inner = self.inner.lock().unwrap();
            inner.saw_serving_this_stream = false;
            inner.call = Some(Arc::clone(&call));
        }
        debug!(service = %self.service_name, "starting health watch");
        let request = HealthCheckRequest {
            service: self.service_name.clone(),
        };
        call.start_batch(StreamOpBatch {
            send_initial_metadata: Some(SendInitialMetadata {
                metadata: Metadata::new(),
                flags: 0,
            }),
            send_message: Some(Box::new(crate::bytestream::SliceBuffer::from_bytes(
                encode_health_request(&request),
            ))),
            on_complete: Some(Box::new(|_| {})),
            ..Default::default()
        });
        self.start_recv(&call);
        let me = self.me.clone();
        let serializer = self.serializer.clone();
        call.start_batch(StreamOpBatch {
            recv_trailing_metadata: true,
            on_complete: Some(Box::new(move |result| {
                serializer.schedule(move || {
                    if let Some(client) = me.upgrade() {
                        client.on_stream_done(result);
                    }
                });
            })),
            ..Default::default()
        });
    }

    fn start_recv(self: &Arc<Self>, call: &Arc<SubchannelCall>) {
        let me = self.me.clone();
        let serializer = self.serializer.clone();
        call.start_batch(StreamOpBatch {
            recv_initial_metadata: Some(Box::new(|_| {})),
            recv_message: Some(Box::new(move |message| {
                serializer.schedule(move || {
                    if let Some(client) = me.upgrade() {
                        client.on_message(message);
                    }
                });
            })),
            on_complete: Some(Box::new(|_| {})),
            ..Default::default()
        });
    }

    fn on_message(self: &Arc<Self>, message: Result<Option<Bytes>>) {
        let call = {
            let inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return;
            }
            inner.call.clone()
        };
        let Ok(Some(bytes)) = message else {
            // Stream errors and half-closes surface through the trailing
            // metadata batch.
            return;
        };
        match decode_health_response(&bytes) {
            Ok(response) if response.status == ServingStatus::Serving => {
                self.inner.lock().unwrap().saw_serving_this_stream = true;
                self.tracker
                    .set(ConnectivityState::Ready, None, "health_serving");
            }
            Ok(response) => {
                self.tracker.set(
                    ConnectivityState::TransientFailure,
                    Some(ChannelError::Unavailable(format!(
                        "health status {:?}",
                        response.status
                    ))),
                    "health_not_serving",
                );
            }
            Err(error) => {
                self.tracker.set(
                    ConnectivityState::TransientFailure,
                    Some(error),
                    "health_malformed",
                );
            }
        }
        if let Some(call) = call {
            // Keep decoding the response stream.
            let me = self.me.clone();
            let serializer = self.serializer.clone();
            call.start_batch(StreamOpBatch {
                recv_message: Some(Box::new(move |message| {
                    serializer.schedule(move || {
                        if let Some(client) = me.upgrade() {
                            client.on_message(message);
                        }
                    });
                })),
                on_complete: Some(Box::new(|_| {})),
                ..Default::default()
            });
        }
    }

    fn on_stream_done(self: &Arc<Self>, result: BatchResult) {
        let status = match (&result.error, &result.trailing_metadata) {
            (Some(error), _) => error.status_code(),
            (None, Some(trailing)) => trailing.grpc_status().unwrap_or(StatusCode::Unknown),
            (None, None) => StatusCode::Unknown,
        };
        let saw_serving = {
            let mut inner = self.inner.lock().unwrap();
            inner.call = None;
            if inner.shut_down {
                return;
            }
            inner.saw_serving_this_stream
        };
        if status == StatusCode::Unimplemented {
            // Server has no health service; assume always healthy and stop.
            info!(service = %self.service_name, "health checking unimplemented; assuming healthy");
            self.tracker
                .set(ConnectivityState::Ready, None, "health_unimplemented");
            return;
        }
        self.tracker.set(
            ConnectivityState::TransientFailure,
            Some(ChannelError::Unavailable(format!(
                "health watch ended with status {}",
                status.name()
            ))),
            "health_stream_ended",
        );
        if saw_serving {
            // Had a live verdict on this stream; restart without delay.
            let mut inner = self.inner.lock().unwrap();
            inner.backoff.reset();
            inner.backoff_started = false;
            drop(inner);
            let me = self.me.clone();
            self.serializer.schedule(move || {
                if let Some(client) = me.upgrade() {
                    client.start_call();
                }
            });
            return;
        }
        let deadline = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            if inner.backoff_started {
                inner.backoff.step(now)
            } else {
                inner.backoff_started = true;
                inner.backoff.begin(now)
            }
        };
        let me = self.me.clone();
        let timer = TimerHandle::at(&self.serializer, deadline, move || {
            if let Some(client) = me.upgrade() {
                client.inner.lock().unwrap().retry_timer = None;
                client.start_call();
            }
        });
        self.inner.lock().unwrap().retry_timer = Some(timer);
    }

    /// Cancels the outstanding call and any pending retry timer.
    pub fn orphan(&self) {
        let (call, timer) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            (inner.call.take(), inner.retry_timer.take())
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(call) = call {
            call.start_batch(StreamOpBatch {
                cancel_stream: Some(ChannelError::Cancelled("health watch orphaned".into())),
                ..Default::default()
            });
        }
        self.tracker.set(
            ConnectivityState::Shutdown,
            None,
            "health_orphaned",
        );
    }
}

impl std::fmt::Debug for HealthCheckClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckClient")
            .field("service", &self.service_name)
            .field("state", &self.tracker.current())
            .finish()
    }
}
