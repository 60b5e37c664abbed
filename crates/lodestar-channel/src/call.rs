//! Per-call machinery: pending batches, pick dispatch, and transport-call
//! creation.
//!
//! Ops submitted by the surface are parked in a fixed-size pending-batches
//! array until an LB pick produces a transport call. A batch containing
//! `send_initial_metadata` triggers the pick; cancellation stashes its error
//! on the call and fails everything that has not reached the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use crate::backoff::Backoff;
use crate::balancer::ClientStats;
use crate::channel::{ChannelShared, WaitingPick};
use crate::error::{ChannelError, Result};
use crate::lb_policy::{LbPolicy, PickState};
use crate::metadata::Metadata;
use crate::retry;
use crate::serializer::Serializer;
use crate::service_config::{MethodParams, WaitForReady};
use crate::subchannel::{ConnectedSubchannel, SubchannelCall};
use crate::throttle::RetryThrottle;
use crate::timer::TimerHandle;
use crate::transport::{
    StreamOpBatch, TransportCallArgs, MAX_PENDING_BATCHES, WAIT_FOR_READY,
    WAIT_FOR_READY_EXPLICITLY_SET,
};

/// Options for creating a call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Full request path, `/Service/Method`.
    pub path: String,
    /// Absolute deadline from the surface, if any.
    pub deadline: Option<Instant>,
}

/// Which ops a batch carried when it was submitted.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BatchOps {
    pub send_initial_metadata: bool,
    pub send_message: bool,
    pub send_trailing_metadata: bool,
    pub recv_initial_metadata: bool,
    pub recv_message: bool,
    pub recv_trailing_metadata: bool,
    pub cancel_stream: bool,
}

impl BatchOps {
    pub(crate) fn of(batch: &StreamOpBatch) -> BatchOps {
        BatchOps {
            send_initial_metadata: batch.send_initial_metadata.is_some(),
            send_message: batch.send_message.is_some(),
            send_trailing_metadata: batch.send_trailing_metadata.is_some(),
            recv_initial_metadata: batch.recv_initial_metadata.is_some(),
            recv_message: batch.recv_message.is_some(),
            recv_trailing_metadata: batch.recv_trailing_metadata,
            cancel_stream: batch.cancel_stream.is_some(),
        }
    }
}

/// A surface batch parked on the call.
pub(crate) struct PendingBatch {
    pub(crate) batch: StreamOpBatch,
    pub(crate) ops: BatchOps,
    pub(crate) retry_checks_done: bool,
}

pub(crate) struct CallInner {
    pub(crate) deadline: Option<Instant>,
    pub(crate) cancel_error: Option<ChannelError>,
    pub(crate) method_params: Option<Arc<MethodParams>>,
    pub(crate) retry_throttle: Option<Arc<RetryThrottle>>,
    pub(crate) service_config_applied: bool,
    pub(crate) subchannel_call: Option<Arc<SubchannelCall>>,
    pub(crate) pick: Option<Arc<PickState>>,
    pub(crate) pick_pending: bool,
    pub(crate) lb_policy: Option<Arc<dyn LbPolicy>>,
    pub(crate) deferred_pick_cancelled: Option<Arc<AtomicBool>>,
    pub(crate) pending_batches: [Option<PendingBatch>; MAX_PENDING_BATCHES],
    // Retry bookkeeping (see `retry`).
    pub(crate) retry_committed: bool,
    pub(crate) num_retry_attempts: u32,
    pub(crate) bytes_buffered_for_retry: usize,
    pub(crate) retry_backoff: Option<Backoff>,
    pub(crate) retry_timer: Option<TimerHandle>,
    pub(crate) seen_send_initial_metadata: bool,
    pub(crate) send_initial_metadata: Option<Metadata>,
    pub(crate) send_initial_metadata_flags: u32,
    pub(crate) send_message_caches: Vec<crate::bytestream::ByteStreamCache>,
    pub(crate) num_send_message_ops: usize,
    pub(crate) seen_send_trailing_metadata: bool,
    pub(crate) send_trailing_metadata: Option<Metadata>,
    // Client-load-reporting context from a grpclb pick.
    pub(crate) client_stats: Option<Arc<ClientStats>>,
    pub(crate) observed_recv_initial_metadata: bool,
    pub(crate) stats_recorded_finished: bool,
}

pub(crate) struct CallShared {
    pub(crate) channel: Arc<ChannelShared>,
    pub(crate) serializer: Serializer,
    pub(crate) path: String,
    pub(crate) start_time: Instant,
    pub(crate) inner: Mutex<CallInner>,
}

/// One logical RPC on a channel.
#[derive(Clone)]
pub struct Call {
    shared: Arc<CallShared>,
}

impl Call {
    pub(crate) fn new(channel: Arc<ChannelShared>, options: CallOptions) -> Call {
        Call {
            shared: Arc::new(CallShared {
                channel,
                serializer: Serializer::new(),
                path: options.path,
                start_time: Instant::now(),
                inner: Mutex::new(CallInner {
                    deadline: options.deadline,
                    cancel_error: None,
                    method_params: None,
                    retry_throttle: None,
                    service_config_applied: false,
                    subchannel_call: None,
                    pick: None,
                    pick_pending: false,
                    lb_policy: None,
                    deferred_pick_cancelled: None,
                    pending_batches: Default::default(),
                    retry_committed: false,
                    num_retry_attempts: 0,
                    bytes_buffered_for_retry: 0,
                    retry_backoff: None,
                    retry_timer: None,
                    seen_send_initial_metadata: false,
                    send_initial_metadata: None,
                    send_initial_metadata_flags: 0,
                    send_message_caches: Vec::new(),
                    num_send_message_ops: 0,
                    seen_send_trailing_metadata: false,
                    send_trailing_metadata: None,
                    client_stats: None,
                    observed_recv_initial_metadata: false,
                    stats_recorded_finished: false,
                }),
            }),
        }
    }

    /// Submits an op batch. Processing happens on the call serializer.
    pub fn start_batch(&self, batch: StreamOpBatch) {
        let shared = Arc::clone(&self.shared);
        self.shared
            .serializer
            .schedule(move || handle_batch(&shared, batch));
    }

    /// Cancels the call with `error`.
    pub fn cancel(&self, error: ChannelError) {
        self.start_batch(StreamOpBatch {
            cancel_stream: Some(error),
            ..Default::default()
        });
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("path", &self.shared.path).finish()
    }
}

/// Entry point for each submitted batch; runs on the call serializer.
fn handle_batch(call: &Arc<CallShared>, batch: StreamOpBatch) {
    enum Action {
        FailAllPending(ChannelError),
        Resume,
        StartPick,
        Park,
    }
    let cancel_in_batch = batch.cancel_stream.clone();
    let has_send_initial_metadata = batch.send_initial_metadata.is_some();
    let action = {
        let mut inner = call.inner.lock().unwrap();
        // Previously cancelled: fail new batches immediately.
        if let Some(error) = inner.cancel_error.clone() {
            drop(inner);
            debug!(path = %call.path, "failing batch on cancelled call");
            batch.finish_with_failure(error);
            return;
        }
        pending_batches_add(&mut inner, batch);
        if let Some(error) = cancel_in_batch {
            inner.cancel_error = Some(error.clone());
            if let Some(timer) = inner.retry_timer.take() {
                timer.cancel();
            }
            if inner.subchannel_call.is_none() {
                Action::FailAllPending(error)
            } else {
                Action::Resume
            }
        } else if inner.subchannel_call.is_some() {
            Action::Resume
        } else if has_send_initial_metadata {
            Action::StartPick
        } else {
            Action::Park
        }
    };
    match action {
        Action::FailAllPending(error) => {
            cancel_outstanding_pick(call, &error);
            pending_batches_fail(call, error);
        }
        Action::Resume => pending_batches_resume(call),
        Action::StartPick => {
            let call2 = Arc::clone(call);
            call.channel.serializer.schedule(move || start_pick(&call2));
        }
        Action::Park => {
            debug!(path = %call.path, "parked batch awaiting pick");
        }
    }
}

fn pending_batches_add(inner: &mut CallInner, batch: StreamOpBatch) {
    let ops = BatchOps::of(&batch);
    let slot = batch.slot();
    debug_assert!(
        inner.pending_batches[slot].is_none(),
        "two batches of the same kind pending concurrently"
    );
    inner.pending_batches[slot] = Some(PendingBatch {
        batch,
        ops,
        retry_checks_done: false,
    });
}

/// Fails every parked batch with `error`, firing each callback exactly once.
pub(crate) fn pending_batches_fail(call: &Arc<CallShared>, error: ChannelError) {
    let (batches, stats) = {
        let mut inner = call.inner.lock().unwrap();
        let mut batches = Vec::new();
        for slot in inner.pending_batches.iter_mut() {
            if let Some(pending) = slot.take() {
                batches.push(pending.batch);
            }
        }
        let stats = take_finished_stats(&mut inner, true);
        (batches, stats)
    };
    if let Some((stats, failed_to_send, known_received)) = stats {
        stats.record_call_finished(failed_to_send, known_received);
    }
    debug!(path = %call.path, batches = batches.len(), %error, "failing pending batches");
    for batch in batches {
        batch.finish_with_failure(error.clone());
    }
}

/// Records the call-finished counters at most once per call.
pub(crate) fn take_finished_stats(
    inner: &mut CallInner,
    failed: bool,
) -> Option<(Arc<ClientStats>, bool, bool)> {
    if inner.stats_recorded_finished {
        return None;
    }
    let stats = inner.client_stats.clone()?;
    inner.stats_recorded_finished = true;
    let failed_to_send = failed && !inner.observed_recv_initial_metadata;
    let known_received = inner.observed_recv_initial_metadata;
    Some((stats, failed_to_send, known_received))
}

/// Routes parked batches once a transport call exists: through the retry
/// orchestrator while retries are live, as-is otherwise.
pub(crate) fn pending_batches_resume(call: &Arc<CallShared>) {
    // Cancellation is routed straight to the transport, never through the
    // retriable batch builder.
    let cancel = {
        let mut inner = call.inner.lock().unwrap();
        let subchannel_call = inner.subchannel_call.clone();
        match subchannel_call {
            Some(subchannel_call) if inner.pending_batches[6].is_some() => inner.pending_batches
                [6]
                .take()
                .map(|pending| (subchannel_call, pending.batch)),
            _ => None,
        }
    };
    if let Some((subchannel_call, batch)) = cancel {
        debug!(path = %call.path, "forwarding cancel_stream to transport");
        subchannel_call.start_batch(batch);
        return;
    }
    let retriable = {
        let inner = call.inner.lock().unwrap();
        let retries_configured = inner
            .method_params
            .as_ref()
            .is_some_and(|params| params.retry_policy.is_some());
        retries_configured && !inner.retry_committed
    };
    if retriable {
        retry::start_retriable_batches(call);
        return;
    }
    pending_batches_forward(call);
}

/// Pass-through routing: forwards parked batches the retry machinery does
/// not own straight to the transport call.
pub(crate) fn pending_batches_forward(call: &Arc<CallShared>) {
    let (subchannel_call, batches) = {
        let mut inner = call.inner.lock().unwrap();
        let Some(subchannel_call) = inner.subchannel_call.clone() else {
            return;
        };
        let mut batches = Vec::new();
        for slot in inner.pending_batches.iter_mut() {
            let owned_by_retry = slot
                .as_ref()
                .map(|pending| pending.retry_checks_done)
                .unwrap_or(false);
            if owned_by_retry {
                // Completion happens through the intercepted callbacks of the
                // attempt that already started these ops.
                continue;
            }
            if let Some(pending) = slot.take() {
                batches.push(pending.batch);
            }
        }
        (subchannel_call, batches)
    };
    debug!(path = %call.path, batches = batches.len(), "forwarding batches to transport");
    for batch in batches {
        subchannel_call.start_batch(batch);
    }
}

/// Cancels whatever stage of pick the call is in.
fn cancel_outstanding_pick(call: &Arc<CallShared>, error: &ChannelError) {
    let (pick, policy, deferred) = {
        let mut inner = call.inner.lock().unwrap();
        (
            inner.pick.clone(),
            inner.lb_policy.clone(),
            inner.deferred_pick_cancelled.take(),
        )
    };
    if let Some(deferred) = deferred {
        deferred.store(true, Ordering::Release);
    }
    if let (Some(pick), Some(policy)) = (pick, policy) {
        let error = error.clone();
        call.channel.serializer.schedule(move || {
            policy.cancel_pick(&pick, error);
        });
    }
}

/// Begins LB for the call; runs on the channel serializer.
pub(crate) fn start_pick(call: &Arc<CallShared>) {
    let channel = Arc::clone(&call.channel);
    let policy = channel.inner.lock().unwrap().lb_policy.clone();
    if let Some(policy) = policy {
        continue_pick_with_policy(call, &policy);
        return;
    }
    // No policy yet: either the channel is gone, or we park the pick until
    // the resolver produces one.
    let parked = {
        let mut channel_inner = channel.inner.lock().unwrap();
        if channel_inner.resolver.is_none() {
            None
        } else {
            ChannelShared::start_resolving(&channel, &mut channel_inner);
            let cancelled = Arc::new(AtomicBool::new(false));
            channel_inner.waiting_for_resolver.push(WaitingPick {
                call: Arc::clone(call),
                cancelled: Arc::clone(&cancelled),
            });
            Some(cancelled)
        }
    };
    match parked {
        Some(cancelled) => {
            debug!(path = %call.path, "deferring pick until resolver result");
            call.inner.lock().unwrap().deferred_pick_cancelled = Some(cancelled);
        }
        None => {
            let call2 = Arc::clone(call);
            call.serializer.schedule(move || {
                pick_done(&call2, Err(ChannelError::Unavailable("disconnected".into())));
            });
        }
    }
}

/// Fails a pick that was parked on the resolver; used at channel shutdown.
pub(crate) fn fail_deferred_pick(call: &Arc<CallShared>, error: ChannelError) {
    let call2 = Arc::clone(call);
    call.serializer
        .schedule(move || pick_done(&call2, Err(error)));
}

/// Runs one pick against `policy`; on the channel serializer.
pub(crate) fn continue_pick_with_policy(call: &Arc<CallShared>, policy: &Arc<dyn LbPolicy>) {
    let pick = {
        let mut inner = call.inner.lock().unwrap();
        inner.deferred_pick_cancelled = None;
        if let Some(error) = inner.cancel_error.clone() {
            drop(inner);
            let call2 = Arc::clone(call);
            call.serializer
                .schedule(move || pick_done(&call2, Err(error)));
            return;
        }
        // Service config data is applied on the first attempt only.
        if !inner.service_config_applied {
            inner.service_config_applied = true;
            apply_service_config(call, &mut inner);
        }
        let (metadata, flags) = take_pick_metadata(&mut inner);
        let call2 = Arc::clone(call);
        let pick = PickState::new(
            metadata,
            flags,
            Box::new(move |outcome| {
                let call3 = Arc::clone(&call2);
                call2.serializer.schedule(move || pick_done(&call3, outcome));
            }),
        );
        inner.pick = Some(Arc::clone(&pick));
        inner.pick_pending = true;
        inner.lb_policy = Some(Arc::clone(policy));
        pick
    };
    debug!(path = %call.path, policy = policy.name(), "starting pick");
    if policy.pick(&pick) {
        debug!(path = %call.path, "pick completed synchronously");
        {
            let mut inner = call.inner.lock().unwrap();
            inner.pick_pending = false;
            inner.lb_policy = None;
        }
        let call2 = Arc::clone(call);
        call.serializer.schedule(move || pick_done(&call2, Ok(())));
    }
}

/// Lends the call's initial metadata to the pick: from the retry cache when
/// populated, otherwise from the parked send-initial-metadata batch.
fn take_pick_metadata(inner: &mut CallInner) -> (Metadata, u32) {
    let (metadata, mut flags) = if inner.seen_send_initial_metadata {
        (
            inner.send_initial_metadata.take().unwrap_or_default(),
            inner.send_initial_metadata_flags,
        )
    } else {
        match inner.pending_batches[0]
            .as_mut()
            .and_then(|pending| pending.batch.send_initial_metadata.as_mut())
        {
            Some(send) => (std::mem::take(&mut send.metadata), send.flags),
            None => (Metadata::new(), 0),
        }
    };
    // Resolve wait-for-ready: an explicit caller setting wins; otherwise the
    // method config may force it either way.
    if flags & WAIT_FOR_READY_EXPLICITLY_SET == 0 {
        match inner
            .method_params
            .as_ref()
            .map(|params| params.wait_for_ready)
            .unwrap_or(WaitForReady::Unset)
        {
            WaitForReady::True => flags |= WAIT_FOR_READY,
            WaitForReady::False => flags &= !WAIT_FOR_READY,
            WaitForReady::Unset => {}
        }
    }
    inner.send_initial_metadata_flags = flags;
    (metadata, flags)
}

/// Returns pick-lent metadata to its home.
fn restore_pick_metadata(inner: &mut CallInner, metadata: Metadata) {
    if inner.seen_send_initial_metadata {
        inner.send_initial_metadata = Some(metadata);
    } else if let Some(send) = inner.pending_batches[0]
        .as_mut()
        .and_then(|pending| pending.batch.send_initial_metadata.as_mut())
    {
        send.metadata = metadata;
        send.flags = inner.send_initial_metadata_flags;
    }
}

/// Applies method params and retry throttle from the channel's current
/// service config; intersects the per-method timeout with the deadline.
fn apply_service_config(call: &Arc<CallShared>, inner: &mut CallInner) {
    let (config, throttle) = {
        let channel_inner = call.channel.inner.lock().unwrap();
        (
            channel_inner.service_config.clone(),
            channel_inner.retry_throttle.clone(),
        )
    };
    inner.retry_throttle = throttle;
    if let Some(config) = config {
        inner.method_params = config.method_params(&call.path);
        if let Some(timeout) = inner.method_params.as_ref().and_then(|params| params.timeout) {
            let per_method_deadline = call.start_time + timeout;
            let shorter = inner
                .deadline
                .map(|deadline| per_method_deadline < deadline)
                .unwrap_or(true);
            if shorter {
                debug!(path = %call.path, ?timeout, "service config shortened deadline");
                inner.deadline = Some(per_method_deadline);
            }
        }
    }
}

/// Completes a pick on the call serializer: creates the transport call or
/// fails the parked batches.
pub(crate) fn pick_done(call: &Arc<CallShared>, outcome: Result<()>) {
    let (result, cancel_error) = {
        let mut inner = call.inner.lock().unwrap();
        inner.pick_pending = false;
        inner.lb_policy = None;
        let pick = inner.pick.take();
        let result = pick.as_ref().map(|p| p.result()).unwrap_or_default();
        if let Some(pick) = &pick {
            if let Some(metadata) = pick.take_metadata() {
                restore_pick_metadata(&mut inner, metadata);
            }
        }
        (result, inner.cancel_error.clone())
    };
    if let Some(error) = cancel_error {
        pending_batches_fail(call, error);
        return;
    }
    match outcome {
        Err(error) => {
            // A failed pick may still be retryable (e.g. wait-for-ready
            // cancellation on transient failure).
            if !retry::maybe_retry(call, None, error.status_code()) {
                pending_batches_fail(
                    call,
                    ChannelError::wrap("failed to pick subchannel", error),
                );
            }
        }
        Ok(()) => match result.connected_subchannel {
            None => {
                // An errorless pick without a subchannel is a server-directed
                // drop; it is never retried.
                pending_batches_fail(
                    call,
                    ChannelError::Unavailable("call dropped by load balancing policy".into()),
                );
            }
            Some(connected) => {
                call.inner.lock().unwrap().client_stats = result.client_stats.clone();
                create_subchannel_call(call, connected);
            }
        },
    }
}

fn create_subchannel_call(call: &Arc<CallShared>, connected: Arc<ConnectedSubchannel>) {
    let (retries_enabled, deadline) = {
        let inner = call.inner.lock().unwrap();
        let retries_enabled = inner
            .method_params
            .as_ref()
            .is_some_and(|params| params.retry_policy.is_some())
            && !inner.retry_committed;
        (retries_enabled, inner.deadline)
    };
    let args = TransportCallArgs {
        path: call.path.clone(),
        start_time: call.start_time,
        deadline,
    };
    match connected.create_call(&args, retries_enabled) {
        Ok(subchannel_call) => {
            debug!(path = %call.path, retries_enabled, "created transport call");
            call.inner.lock().unwrap().subchannel_call = Some(subchannel_call);
            pending_batches_resume(call);
        }
        Err(error) => {
            pending_batches_fail(
                call,
                ChannelError::wrap("failed to create subchannel call", error),
            );
        }
    }
}
