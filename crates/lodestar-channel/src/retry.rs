//! The retry orchestrator: transparent replay of op batches across attempts.
//!
//! While a call is not yet *committed*, send-side ops are cached so they can
//! be replayed on a fresh transport call after a retryable failure. Recv-side
//! callbacks are intercepted so the surface sees each callback exactly once,
//! regardless of how many attempts ran underneath.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::backoff::{Backoff, BackoffConfig};
use crate::bytestream::{ByteStream, ByteStreamCache};
use crate::call::{
    pending_batches_forward, start_pick, take_finished_stats, BatchOps, CallInner, CallShared,
    PendingBatch,
};
use crate::error::{Result, StatusCode};
use crate::metadata::Metadata;
use crate::subchannel::SubchannelCall;
use crate::timer::TimerHandle;
use crate::transport::{
    BatchResult, RecvInitialMetadata, SendInitialMetadata, StreamOpBatch, MAX_PENDING_BATCHES,
};

/// Jitter applied to the per-call retry back-off.
const RETRY_BACKOFF_JITTER: f64 = 0.2;

/// A recv-initial-metadata delivery deferred until the attempt's trailing
/// metadata arrives (Trailers-Only handling).
pub struct DeferredRecvInitialMetadata {
    batch_data: Arc<BatchData>,
    result: Result<RecvInitialMetadata>,
}

/// A null recv-message delivery deferred until the attempt's trailing
/// metadata arrives.
pub struct DeferredRecvMessage {
    batch_data: Arc<BatchData>,
    result: Result<Option<Bytes>>,
}

/// Per-attempt bookkeeping, attached to each transport call created while
/// retries are live.
#[derive(Default)]
pub struct RetryState {
    /// Whether send-initial-metadata was started on this attempt.
    pub started_send_initial_metadata: bool,
    /// Number of cached messages started on this attempt.
    pub started_send_message_count: usize,
    /// Whether send-trailing-metadata was started on this attempt.
    pub started_send_trailing_metadata: bool,
    /// Whether recv-initial-metadata was started on this attempt.
    pub started_recv_initial_metadata: bool,
    /// Whether recv-message was started on this attempt.
    pub started_recv_message: bool,
    /// Whether recv-trailing-metadata was started on this attempt.
    pub started_recv_trailing_metadata: bool,
    /// Whether send-initial-metadata completed on this attempt.
    pub completed_send_initial_metadata: bool,
    /// Number of messages completed on this attempt.
    pub completed_send_message_count: usize,
    /// Whether send-trailing-metadata completed on this attempt.
    pub completed_send_trailing_metadata: bool,
    /// Whether recv-initial-metadata completed on this attempt.
    pub completed_recv_initial_metadata: bool,
    /// Whether recv-message completed on this attempt.
    pub completed_recv_message: bool,
    /// Whether recv-trailing-metadata completed on this attempt.
    pub completed_recv_trailing_metadata: bool,
    /// At-most-one-retry-per-attempt guard.
    pub retry_dispatched: bool,
    deferred_recv_initial_metadata: Option<DeferredRecvInitialMetadata>,
    deferred_recv_message_null: Option<DeferredRecvMessage>,
}

impl std::fmt::Debug for RetryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryState")
            .field("started_send_message_count", &self.started_send_message_count)
            .field("completed_send_message_count", &self.completed_send_message_count)
            .field("retry_dispatched", &self.retry_dispatched)
            .finish()
    }
}

/// State for one batch dispatched to a transport call on one attempt. Holds
/// the intercepted callbacks' captured data.
pub(crate) struct BatchData {
    call: Arc<CallShared>,
    subchannel_call: Arc<SubchannelCall>,
    ops: BatchOps,
    trailing_metadata: Mutex<Option<Metadata>>,
}

impl BatchData {
    fn new(
        call: &Arc<CallShared>,
        subchannel_call: &Arc<SubchannelCall>,
        ops: BatchOps,
    ) -> Arc<BatchData> {
        Arc::new(BatchData {
            call: Arc::clone(call),
            subchannel_call: Arc::clone(subchannel_call),
            ops,
            trailing_metadata: Mutex::new(None),
        })
    }

    fn retry_state(&self) -> &Mutex<RetryState> {
        self.subchannel_call
            .retry_state()
            .expect("retriable batch on a call without retry state")
    }
}

/// Builds and dispatches the batches for the current attempt.
///
/// Constructs at most one send batch from the caches (initial metadata, the
/// next uncommitted message, trailing metadata once all messages have been
/// started) and one recv batch per pending surface batch with recv ops not
/// yet started on this attempt.
pub(crate) fn start_retriable_batches(call: &Arc<CallShared>) {
    let (subchannel_call, batches) = {
        let mut inner = call.inner.lock().unwrap();
        let Some(subchannel_call) = inner.subchannel_call.clone() else {
            return;
        };
        if !inner.retry_committed {
            for slot in 0..MAX_PENDING_BATCHES {
                retry_checks_for_new_batch(call, &mut inner, slot);
            }
            if inner.retry_committed {
                // A check committed the call (e.g. buffer overflow); route
                // whatever was not absorbed as-is.
                drop(inner);
                pending_batches_forward(call);
                return;
            }
        }
        let Some(retry_state) = subchannel_call.retry_state() else {
            drop(inner);
            pending_batches_forward(call);
            return;
        };
        let mut retry_state = retry_state.lock().unwrap();
        let mut batches: Vec<(Arc<BatchData>, StreamOpBatch)> = Vec::new();
        build_send_batch(call, &subchannel_call, &mut inner, &mut retry_state, &mut batches);
        build_recv_batches(call, &subchannel_call, &mut inner, &mut retry_state, &mut batches);
        drop(retry_state);
        (subchannel_call, batches)
    };
    debug!(path = %call.path, batches = batches.len(), "dispatching retriable batches");
    let mut batches = batches.into_iter();
    if let Some((_, first)) = batches.next() {
        subchannel_call.start_batch(first);
    }
    for (_, batch) in batches {
        let subchannel_call = Arc::clone(&subchannel_call);
        call.serializer
            .schedule(move || subchannel_call.start_batch(batch));
    }
}

/// Absorbs a newly seen surface batch into the retry caches, committing the
/// call instead if the batch takes the buffered bytes over the limit.
fn retry_checks_for_new_batch(call: &Arc<CallShared>, inner: &mut CallInner, slot: usize) {
    let Some(mut pending) = inner.pending_batches[slot].take() else {
        return;
    };
    if pending.retry_checks_done || pending.ops.cancel_stream {
        inner.pending_batches[slot] = Some(pending);
        return;
    }
    pending.retry_checks_done = true;
    // Buffer-limit check comes before any caching.
    if pending.ops.send_initial_metadata {
        if let Some(send) = &pending.batch.send_initial_metadata {
            inner.bytes_buffered_for_retry += send.metadata.byte_size();
        }
    }
    if pending.ops.send_message {
        if let Some(message) = &pending.batch.send_message {
            inner.bytes_buffered_for_retry += message.length();
        }
    }
    if inner.bytes_buffered_for_retry > call.channel.args.per_rpc_retry_buffer_size {
        debug!(
            path = %call.path,
            buffered = inner.bytes_buffered_for_retry,
            "retry buffer exceeded; committing call"
        );
        // Not absorbed: the pass-through path still owns this batch.
        pending.retry_checks_done = false;
        inner.pending_batches[slot] = Some(pending);
        retry_commit(call, inner);
        return;
    }
    if pending.ops.send_initial_metadata {
        if let Some(send) = &pending.batch.send_initial_metadata {
            inner.seen_send_initial_metadata = true;
            inner.send_initial_metadata = Some(send.metadata.clone());
            inner.send_initial_metadata_flags = send.flags;
        }
    }
    if pending.ops.send_message {
        // Tee the message into a cache the later attempts replay from.
        if let Some(message) = pending.batch.send_message.take() {
            let cache = ByteStreamCache::new(message);
            pending.batch.send_message = Some(Box::new(cache.reader()));
            inner.send_message_caches.push(cache);
            inner.num_send_message_ops += 1;
        }
    }
    if pending.ops.send_trailing_metadata {
        if let Some(trailing) = &pending.batch.send_trailing_metadata {
            inner.seen_send_trailing_metadata = true;
            inner.send_trailing_metadata = Some(trailing.clone());
        }
    }
    inner.pending_batches[slot] = Some(pending);
}

fn build_send_batch(
    call: &Arc<CallShared>,
    subchannel_call: &Arc<SubchannelCall>,
    inner: &mut CallInner,
    retry_state: &mut RetryState,
    batches: &mut Vec<(Arc<BatchData>, StreamOpBatch)>,
) {
    let mut ops = BatchOps::default();
    let mut batch = StreamOpBatch::default();
    if inner.seen_send_initial_metadata && !retry_state.started_send_initial_metadata {
        retry_state.started_send_initial_metadata = true;
        ops.send_initial_metadata = true;
        batch.send_initial_metadata = Some(SendInitialMetadata {
            metadata: inner.send_initial_metadata.clone().unwrap_or_default(),
            flags: inner.send_initial_metadata_flags,
        });
    }
    // Messages are ordered; at most one may be in flight per attempt.
    let have_pending_messages = retry_state.started_send_message_count < inner.num_send_message_ops;
    let message_in_flight =
        retry_state.started_send_message_count > retry_state.completed_send_message_count;
    if have_pending_messages && !message_in_flight {
        let cache = &inner.send_message_caches[retry_state.started_send_message_count];
        retry_state.started_send_message_count += 1;
        ops.send_message = true;
        batch.send_message = Some(Box::new(cache.reader()) as Box<dyn ByteStream>);
    }
    // Trailing metadata goes only after every cached message has started.
    if inner.seen_send_trailing_metadata
        && retry_state.started_send_message_count == inner.num_send_message_ops
        && !retry_state.started_send_trailing_metadata
    {
        retry_state.started_send_trailing_metadata = true;
        ops.send_trailing_metadata = true;
        batch.send_trailing_metadata =
            Some(inner.send_trailing_metadata.clone().unwrap_or_default());
    }
    if !ops.send_initial_metadata && !ops.send_message && !ops.send_trailing_metadata {
        return;
    }
    let batch_data = BatchData::new(call, subchannel_call, ops);
    batch.on_complete = Some(on_complete_callback(&batch_data));
    batches.push((batch_data, batch));
}

fn build_recv_batches(
    call: &Arc<CallShared>,
    subchannel_call: &Arc<SubchannelCall>,
    inner: &mut CallInner,
    retry_state: &mut RetryState,
    batches: &mut Vec<(Arc<BatchData>, StreamOpBatch)>,
) {
    for slot in 0..MAX_PENDING_BATCHES {
        let Some(pending) = inner.pending_batches[slot].as_ref() else {
            continue;
        };
        let start_recv_initial_metadata =
            pending.ops.recv_initial_metadata && !retry_state.started_recv_initial_metadata;
        let start_recv_message = pending.ops.recv_message && !retry_state.started_recv_message;
        let start_recv_trailing_metadata =
            pending.ops.recv_trailing_metadata && !retry_state.started_recv_trailing_metadata;
        if !start_recv_initial_metadata && !start_recv_message && !start_recv_trailing_metadata {
            continue;
        }
        let mut ops = BatchOps::default();
        ops.recv_initial_metadata = start_recv_initial_metadata;
        ops.recv_message = start_recv_message;
        ops.recv_trailing_metadata = start_recv_trailing_metadata;
        let batch_data = BatchData::new(call, subchannel_call, ops);
        let mut batch = StreamOpBatch::default();
        if start_recv_initial_metadata {
            retry_state.started_recv_initial_metadata = true;
            let bd = Arc::clone(&batch_data);
            let serializer = call.serializer.clone();
            batch.recv_initial_metadata = Some(Box::new(move |result| {
                serializer.schedule(move || handle_recv_initial_metadata_ready(bd, result));
            }));
        }
        if start_recv_message {
            retry_state.started_recv_message = true;
            let bd = Arc::clone(&batch_data);
            let serializer = call.serializer.clone();
            batch.recv_message = Some(Box::new(move |result| {
                serializer.schedule(move || handle_recv_message_ready(bd, result));
            }));
        }
        if start_recv_trailing_metadata {
            retry_state.started_recv_trailing_metadata = true;
            batch.recv_trailing_metadata = true;
        }
        batch.on_complete = Some(on_complete_callback(&batch_data));
        batches.push((batch_data, batch));
    }
}

fn on_complete_callback(batch_data: &Arc<BatchData>) -> crate::transport::OnComplete {
    let bd = Arc::clone(batch_data);
    let serializer = bd.call.serializer.clone();
    Box::new(move |result| {
        serializer.schedule(move || handle_on_complete(bd, result));
    })
}

/// Intercepted `recv_initial_metadata_ready` for one attempt.
fn handle_recv_initial_metadata_ready(
    batch_data: Arc<BatchData>,
    result: Result<RecvInitialMetadata>,
) {
    let call = Arc::clone(&batch_data.call);
    match result {
        Err(error) => {
            if maybe_retry(&call, Some(&batch_data), error.status_code()) {
                return;
            }
            invoke_recv_initial_metadata_callback(&call, Err(error));
        }
        Ok(received) => {
            // A Trailers-Only response may still be retried once the status
            // arrives; park the delivery until then.
            let deferred = {
                let mut retry_state = batch_data.retry_state().lock().unwrap();
                if received.trailers_only && !retry_state.completed_recv_trailing_metadata {
                    retry_state.deferred_recv_initial_metadata =
                        Some(DeferredRecvInitialMetadata {
                            batch_data: Arc::clone(&batch_data),
                            result: Ok(received.clone()),
                        });
                    true
                } else {
                    false
                }
            };
            if deferred {
                debug!(path = %call.path, "deferring recv_initial_metadata (Trailers-Only)");
                return;
            }
            // A real response commits the call.
            {
                let mut inner = call.inner.lock().unwrap();
                inner.observed_recv_initial_metadata = true;
                retry_commit(&call, &mut inner);
            }
            invoke_recv_initial_metadata_callback(&call, Ok(received));
        }
    }
}

/// Intercepted `recv_message_ready` for one attempt.
fn handle_recv_message_ready(batch_data: Arc<BatchData>, result: Result<Option<Bytes>>) {
    let call = Arc::clone(&batch_data.call);
    match result {
        Err(error) => {
            if maybe_retry(&call, Some(&batch_data), error.status_code()) {
                return;
            }
            invoke_recv_message_callback(&call, Err(error));
        }
        Ok(None) => {
            // End-of-stream before the status is known; park the delivery.
            let deferred = {
                let mut retry_state = batch_data.retry_state().lock().unwrap();
                if !retry_state.completed_recv_trailing_metadata {
                    retry_state.deferred_recv_message_null = Some(DeferredRecvMessage {
                        batch_data: Arc::clone(&batch_data),
                        result: Ok(None),
                    });
                    true
                } else {
                    false
                }
            };
            if deferred {
                debug!(path = %call.path, "deferring null recv_message");
                return;
            }
            invoke_recv_message_callback(&call, Ok(None));
        }
        Ok(Some(message)) => {
            // Response data commits the call.
            {
                let mut inner = call.inner.lock().unwrap();
                retry_commit(&call, &mut inner);
            }
            invoke_recv_message_callback(&call, Ok(Some(message)));
        }
    }
}

/// Delivers a recv-initial-metadata result to the surface batch that asked
/// for it, firing its callback exactly once.
fn invoke_recv_initial_metadata_callback(
    call: &Arc<CallShared>,
    result: Result<RecvInitialMetadata>,
) {
    let ready = {
        let mut inner = call.inner.lock().unwrap();
        if result.is_ok() {
            inner.observed_recv_initial_metadata = true;
        }
        let mut found = None;
        for slot in inner.pending_batches.iter_mut() {
            if let Some(pending) = slot {
                if let Some(ready) = pending.batch.recv_initial_metadata.take() {
                    found = Some(ready);
                    maybe_clear_pending_slot(slot);
                    break;
                }
            }
        }
        found
    };
    if let Some(ready) = ready {
        ready(result);
    }
}

/// Delivers a recv-message result to the surface.
fn invoke_recv_message_callback(call: &Arc<CallShared>, result: Result<Option<Bytes>>) {
    let ready = {
        let mut inner = call.inner.lock().unwrap();
        let mut found = None;
        for slot in inner.pending_batches.iter_mut() {
            if let Some(pending) = slot {
                if let Some(ready) = pending.batch.recv_message.take() {
                    found = Some(ready);
                    maybe_clear_pending_slot(slot);
                    break;
                }
            }
        }
        found
    };
    if let Some(ready) = ready {
        ready(result);
    }
}

/// Clears a pending slot once every callback it owed has been taken.
fn maybe_clear_pending_slot(slot: &mut Option<PendingBatch>) {
    let done = slot
        .as_ref()
        .map(|pending| {
            pending.batch.on_complete.is_none()
                && pending.batch.recv_initial_metadata.is_none()
                && pending.batch.recv_message.is_none()
        })
        .unwrap_or(false);
    if done {
        *slot = None;
    }
}

/// Intercepted batch `on_complete` for one attempt.
fn handle_on_complete(batch_data: Arc<BatchData>, result: BatchResult) {
    let call = Arc::clone(&batch_data.call);
    // Update per-op completion bookkeeping.
    {
        let mut retry_state = batch_data.retry_state().lock().unwrap();
        if batch_data.ops.send_initial_metadata {
            retry_state.completed_send_initial_metadata = true;
        }
        if batch_data.ops.send_message {
            retry_state.completed_send_message_count += 1;
        }
        if batch_data.ops.send_trailing_metadata {
            retry_state.completed_send_trailing_metadata = true;
        }
        if batch_data.ops.recv_initial_metadata {
            retry_state.completed_recv_initial_metadata = true;
        }
        if batch_data.ops.recv_message {
            retry_state.completed_recv_message = true;
        }
        if batch_data.ops.recv_trailing_metadata {
            retry_state.completed_recv_trailing_metadata = true;
        }
    }
    // Determine whether the call has reached a terminal status.
    let (call_finished, status) = match &result.error {
        Some(error) => (true, error.status_code()),
        None if batch_data.ops.recv_trailing_metadata => {
            let status = result
                .trailing_metadata
                .as_ref()
                .and_then(Metadata::grpc_status)
                .unwrap_or(StatusCode::Unknown);
            (true, status)
        }
        None => (false, StatusCode::Ok),
    };
    if let Some(trailing) = result.trailing_metadata {
        *batch_data.trailing_metadata.lock().unwrap() = Some(trailing);
    }
    if call_finished {
        if maybe_retry(&call, Some(&batch_data), status) {
            // The attempt is being replayed; the parked deliveries from this
            // attempt are dropped, each releasing its own reference.
            let mut retry_state = batch_data.retry_state().lock().unwrap();
            retry_state.deferred_recv_initial_metadata = None;
            retry_state.deferred_recv_message_null = None;
            return;
        }
        // Terminal: release parked deliveries to the surface in order.
        let (deferred_metadata, deferred_message) = {
            let mut retry_state = batch_data.retry_state().lock().unwrap();
            (
                retry_state.deferred_recv_initial_metadata.take(),
                retry_state.deferred_recv_message_null.take(),
            )
        };
        if let Some(deferred) = deferred_metadata {
            let call2 = Arc::clone(&deferred.batch_data.call);
            call.serializer.schedule(move || {
                invoke_recv_initial_metadata_callback(&call2, deferred.result);
            });
        }
        if let Some(deferred) = deferred_message {
            let call2 = Arc::clone(&deferred.batch_data.call);
            call.serializer.schedule(move || {
                invoke_recv_message_callback(&call2, deferred.result);
            });
        }
    } else {
        // Not finished: keep draining cached send ops for this attempt.
        let more_sends = {
            let inner = call.inner.lock().unwrap();
            let retry_state = batch_data.retry_state().lock().unwrap();
            retry_state.started_send_message_count < inner.num_send_message_ops
                || (inner.seen_send_trailing_metadata
                    && !retry_state.started_send_trailing_metadata)
        };
        if more_sends {
            let call2 = Arc::clone(&call);
            call.serializer.schedule(move || start_retriable_batches(&call2));
        }
    }
    // Deliver on_complete for each surface batch that is now fully satisfied.
    let (completions, stats) = {
        let mut inner = call.inner.lock().unwrap();
        let retry_state = batch_data.retry_state().lock().unwrap();
        let mut completions = Vec::new();
        let num_send_message_ops = inner.num_send_message_ops;
        for slot in inner.pending_batches.iter_mut() {
            let completed = slot
                .as_ref()
                .map(|pending| {
                    pending.batch.on_complete.is_some()
                        && pending_batch_is_completed(pending, num_send_message_ops, &retry_state)
                })
                .unwrap_or(false);
            if completed {
                let pending = slot.as_mut().unwrap();
                let on_complete = pending.batch.on_complete.take().unwrap();
                let trailing = if pending.ops.recv_trailing_metadata {
                    batch_data.trailing_metadata.lock().unwrap().take()
                } else {
                    None
                };
                maybe_clear_pending_slot(slot);
                completions.push((on_complete, trailing));
            }
        }
        drop(retry_state);
        let stats = if call_finished {
            release_send_caches(&mut inner);
            take_finished_stats(&mut inner, result.error.is_some() || status != StatusCode::Ok)
        } else {
            None
        };
        (completions, stats)
    };
    if let Some((stats, failed_to_send, known_received)) = stats {
        stats.record_call_finished(failed_to_send, known_received);
    }
    for (on_complete, trailing) in completions {
        on_complete(BatchResult {
            error: result.error.clone(),
            trailing_metadata: trailing,
        });
    }
}

/// Whether every op of `pending` has completed on the current attempt.
fn pending_batch_is_completed(
    pending: &PendingBatch,
    num_send_message_ops: usize,
    retry_state: &RetryState,
) -> bool {
    if pending.ops.send_initial_metadata && !retry_state.completed_send_initial_metadata {
        return false;
    }
    if pending.ops.send_message
        && retry_state.completed_send_message_count < num_send_message_ops
    {
        return false;
    }
    if pending.ops.send_trailing_metadata && !retry_state.completed_send_trailing_metadata {
        return false;
    }
    if pending.ops.recv_initial_metadata && !retry_state.completed_recv_initial_metadata {
        return false;
    }
    if pending.ops.recv_message && !retry_state.completed_recv_message {
        return false;
    }
    if pending.ops.recv_trailing_metadata && !retry_state.completed_recv_trailing_metadata {
        return false;
    }
    true
}

/// Commits the call: no further retries.
///
/// The send-side caches stay alive because the in-flight attempt may still
/// have cached sends to dispatch; they are released when the call reaches a
/// terminal state.
pub(crate) fn retry_commit(call: &Arc<CallShared>, inner: &mut CallInner) {
    if inner.retry_committed {
        return;
    }
    debug!(path = %call.path, attempts = inner.num_retry_attempts, "retry committed");
    inner.retry_committed = true;
}

/// Releases the send-side caches once no attempt can need them again.
fn release_send_caches(inner: &mut CallInner) {
    inner.send_initial_metadata = None;
    inner.send_message_caches.clear();
    inner.send_trailing_metadata = None;
}

/// Decides whether to retry after `status`, and if so schedules the next
/// attempt. Returns `true` when a retry is underway (or already dispatched
/// for this attempt).
pub(crate) fn maybe_retry(
    call: &Arc<CallShared>,
    batch_data: Option<&Arc<BatchData>>,
    status: StatusCode,
) -> bool {
    let mut inner = call.inner.lock().unwrap();
    let Some(retry_policy) = inner
        .method_params
        .as_ref()
        .and_then(|params| params.retry_policy.clone())
    else {
        return false;
    };
    // One retry per attempt: a batch with several callbacks may consult us
    // more than once.
    if let Some(batch_data) = batch_data {
        if batch_data.retry_state().lock().unwrap().retry_dispatched {
            return true;
        }
    }
    if status == StatusCode::Ok {
        if let Some(throttle) = &inner.retry_throttle {
            throttle.record_success();
        }
        return false;
    }
    if !retry_policy.retryable_status_codes.contains(&status) {
        debug!(path = %call.path, status = status.name(), "status not retryable");
        return false;
    }
    // Record the failure only for retryable statuses, and before the
    // remaining checks so those don't mask it.
    if let Some(throttle) = &inner.retry_throttle {
        if !throttle.record_failure() {
            debug!(path = %call.path, "retries throttled");
            return false;
        }
    }
    if inner.retry_committed {
        return false;
    }
    if inner.num_retry_attempts >= retry_policy.max_retry_attempts {
        debug!(
            path = %call.path,
            attempts = inner.num_retry_attempts,
            "retry attempts exhausted"
        );
        return false;
    }
    if inner.cancel_error.is_some() {
        return false;
    }
    // Retrying: release the attempt and schedule a fresh pick after back-off.
    inner.subchannel_call = None;
    let now = Instant::now();
    let deadline = if inner.num_retry_attempts == 0 {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: retry_policy.initial_backoff,
            multiplier: retry_policy.backoff_multiplier,
            jitter: RETRY_BACKOFF_JITTER,
            max: retry_policy.max_backoff,
            min_connect_timeout: retry_policy.initial_backoff.min(retry_policy.max_backoff),
        });
        let deadline = backoff.begin(now);
        inner.retry_backoff = Some(backoff);
        deadline
    } else {
        inner
            .retry_backoff
            .as_mut()
            .expect("retry backoff initialized on first retry")
            .step(now)
    };
    inner.num_retry_attempts += 1;
    debug!(
        path = %call.path,
        attempt = inner.num_retry_attempts,
        status = status.name(),
        delay_ms = deadline.saturating_duration_since(now).as_millis() as u64,
        "retrying call"
    );
    let call2 = Arc::clone(call);
    let timer = TimerHandle::at(&call.channel.serializer, deadline, move || {
        start_pick(&call2);
    });
    inner.retry_timer = Some(timer);
    if let Some(batch_data) = batch_data {
        batch_data.retry_state().lock().unwrap().retry_dispatched = true;
    }
    true
}
