//! The grpclb LB policy: balancer-directed backend selection.
//!
//! The policy stands up an inner channel to the balancer addresses (resolution
//! injected through a fake-resolver generator), keeps a streaming balancer
//! call alive with retry back-off, and delegates picks to an inner
//! round-robin policy over the balancer-supplied serverlist. While the
//! balancer has not produced a serverlist, a fallback timer can switch the
//! inner policy onto the resolver-provided backend addresses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::balancer::{
    decode_balance_response, encode_balance_request, BalanceRequest, ClientStats,
    InitialBalanceRequest, ServerList, BALANCE_LOAD_PATH,
};
use crate::bytestream::SliceBuffer;
use crate::call::{Call, CallOptions};
use crate::channel::{Channel, ChannelArgs};
use crate::connectivity::{ConnectivityState, ConnectivityTracker, StateCallback};
use crate::error::{ChannelError, Result};
use crate::lb_policy::{
    AckCallback, LbPolicy, LbPolicyBuildArgs, LbPolicyUpdate, PickResult, PickState,
    ReresolutionHook,
};
use crate::metadata::{Metadata, LB_TOKEN};
use crate::resolver::{FakeResolverGenerator, ResolvedAddress, ResolverResult};
use crate::round_robin::RoundRobin;
use crate::serializer::Serializer;
use crate::subchannel::Connector;
use crate::timer::TimerHandle;
use crate::transport::{BatchResult, SendInitialMetadata, StreamOpBatch};

/// State of one streaming call to the balancer.
pub struct BalancerCallState {
    glb: Weak<GrpcLb>,
    call: Call,
    client_stats: Mutex<Option<Arc<ClientStats>>>,
    report_interval: Mutex<Option<std::time::Duration>>,
    report_timer: Mutex<Option<TimerHandle>>,
    seen_initial_response: AtomicBool,
    last_report_zero: AtomicBool,
}

impl BalancerCallState {
    /// The stats accumulator, present once load reporting is active.
    pub fn client_stats(&self) -> Option<Arc<ClientStats>> {
        self.client_stats.lock().unwrap().clone()
    }

    fn orphan(&self) {
        if let Some(timer) = self.report_timer.lock().unwrap().take() {
            timer.cancel();
        }
        self.call
            .cancel(ChannelError::Cancelled("balancer call superseded".into()));
    }
}

struct GlbInner {
    shutting_down: bool,
    balancer_generator: Option<FakeResolverGenerator>,
    balancer_channel: Option<Channel>,
    lb_calld: Option<Arc<BalancerCallState>>,
    lb_call_backoff: Backoff,
    backoff_started: bool,
    retry_timer: Option<TimerHandle>,
    retry_timer_pending: bool,
    fallback_timer: Option<TimerHandle>,
    fallback_timer_pending: bool,
    fallback_in_use: bool,
    fallback_backend_addresses: Vec<ResolvedAddress>,
    serverlist: Option<ServerList>,
    serverlist_index: usize,
    rr: Option<Arc<RoundRobin>>,
    rr_generation: u64,
    pending_picks: Vec<Arc<PickState>>,
}

/// Balancer-directed policy delegating backend picks to an inner round-robin.
pub struct GrpcLb {
    me: Weak<GrpcLb>,
    server_name: String,
    serializer: Serializer,
    connector: Arc<dyn Connector>,
    channel_args: ChannelArgs,
    tracker: ConnectivityTracker,
    reresolution: Mutex<Option<ReresolutionHook>>,
    inner: Mutex<GlbInner>,
}

impl GrpcLb {
    /// Builds the policy and applies the initial address set.
    pub fn create(args: LbPolicyBuildArgs) -> Arc<GrpcLb> {
        let backoff = Backoff::new(args.channel_args.balancer_call_backoff.clone());
        let policy = Arc::new_cyclic(|me| GrpcLb {
            me: me.clone(),
            server_name: args.server_name.clone(),
            serializer: args.serializer.clone(),
            connector: Arc::clone(&args.connector),
            channel_args: args.channel_args.clone(),
            tracker: ConnectivityTracker::new("grpclb", ConnectivityState::Idle),
            reresolution: Mutex::new(None),
            inner: Mutex::new(GlbInner {
                shutting_down: false,
                balancer_generator: None,
                balancer_channel: None,
                lb_calld: None,
                lb_call_backoff: backoff,
                backoff_started: false,
                retry_timer: None,
                retry_timer_pending: false,
                fallback_timer: None,
                fallback_timer_pending: false,
                fallback_in_use: false,
                fallback_backend_addresses: Vec::new(),
                serverlist: None,
                serverlist_index: 0,
                rr: None,
                rr_generation: 0,
                pending_picks: Vec::new(),
            }),
        });
        policy.update(LbPolicyUpdate {
            addresses: args.addresses,
        });
        policy
    }

    fn upgrade(&self) -> Option<Arc<GrpcLb>> {
        self.me.upgrade()
    }

    // Balancer channel and call lifecycle.

    fn ensure_balancer_channel(self: &Arc<Self>, balancers: Vec<ResolvedAddress>) {
        let result = ResolverResult {
            // The inner channel treats the balancers as ordinary backends and
            // reaches them via pick_first.
            addresses: balancers
                .into_iter()
                .map(|a| ResolvedAddress::backend(a.address))
                .collect(),
            lb_policy_name: Some("pick_first".to_string()),
            service_config_json: None,
        };
        let (generator, channel, need_call, need_fallback_timer) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            match inner.balancer_generator.clone() {
                // Re-point the existing channel at the new balancer set.
                Some(generator) => (generator, None, false, false),
                None => {
                    let generator = FakeResolverGenerator::new();
                    let channel = Channel::new(
                        self.server_name.clone(),
                        ChannelArgs {
                            // Balancer connections are not health-checked.
                            health_check_service: None,
                            ..self.channel_args.clone()
                        },
                        generator.resolver(),
                        Arc::clone(&self.connector),
                    );
                    inner.balancer_generator = Some(generator.clone());
                    inner.balancer_channel = Some(channel.clone());
                    (generator, Some(channel), true, true)
                }
            }
        };
        generator.set_result(result);
        if let Some(channel) = &channel {
            self.watch_balancer_channel(channel, ConnectivityState::Idle);
        }
        if need_fallback_timer {
            self.arm_fallback_timer();
        }
        if need_call {
            self.start_lb_call();
        }
    }

    fn watch_balancer_channel(self: &Arc<Self>, channel: &Channel, last_seen: ConnectivityState) {
        let me = self.me.clone();
        let serializer = self.serializer.clone();
        channel.watch_connectivity_state(
            last_seen,
            Box::new(move |state, _| {
                serializer.schedule(move || {
                    if let Some(glb) = me.upgrade() {
                        glb.on_balancer_channel_state(state);
                    }
                });
            }),
        );
    }

    fn on_balancer_channel_state(self: &Arc<Self>, state: ConnectivityState) {
        let (rewatch, start_call) = {
            let inner = self.inner.lock().unwrap();
            if inner.shutting_down || state == ConnectivityState::Shutdown {
                (None, false)
            } else {
                let start = state == ConnectivityState::Ready
                    && inner.lb_calld.is_none()
                    && !inner.retry_timer_pending;
                (inner.balancer_channel.clone(), start)
            }
        };
        if start_call {
            self.start_lb_call();
        }
        if let Some(channel) = rewatch {
            self.watch_balancer_channel(&channel, state);
        }
    }

    fn start_lb_call(self: &Arc<Self>) {
        let (channel, deadline) = {
            let inner = self.inner.lock().unwrap();
            if inner.shutting_down || inner.lb_calld.is_some() {
                return;
            }
            let Some(channel) = inner.balancer_channel.clone() else {
                return;
            };
            let deadline = self
                .channel_args
                .lb_call_timeout
                .map(|timeout| Instant::now() + timeout);
            (channel, deadline)
        };
        debug!(server = %self.server_name, "starting balancer call");
        let call = channel.create_call(CallOptions {
            path: BALANCE_LOAD_PATH.to_string(),
            deadline,
        });
        let calld = Arc::new(BalancerCallState {
            glb: self.me.clone(),
            call: call.clone(),
            client_stats: Mutex::new(None),
            report_interval: Mutex::new(None),
            report_timer: Mutex::new(None),
            seen_initial_response: AtomicBool::new(false),
            last_report_zero: AtomicBool::new(false),
        });
        self.inner.lock().unwrap().lb_calld = Some(Arc::clone(&calld));
        let request = BalanceRequest {
            initial: Some(InitialBalanceRequest {
                name: self.server_name.clone(),
            }),
            client_stats: None,
        };
        call.start_batch(StreamOpBatch {
            send_initial_metadata: Some(SendInitialMetadata {
                metadata: Metadata::new(),
                flags: 0,
            }),
            send_message: Some(Box::new(SliceBuffer::from_bytes(encode_balance_request(
                &request,
            )))),
            on_complete: Some(Box::new(|_| {})),
            ..Default::default()
        });
        self.start_balancer_recv(&calld, true);
        let me = self.me.clone();
        let serializer = self.serializer.clone();
        let status_calld = Arc::clone(&calld);
        call.start_batch(StreamOpBatch {
            recv_trailing_metadata: true,
            on_complete: Some(Box::new(move |result| {
                serializer.schedule(move || {
                    if let Some(glb) = me.upgrade() {
                        glb.on_balancer_status(status_calld, result);
                    }
                });
            })),
            ..Default::default()
        });
    }

    fn start_balancer_recv(self: &Arc<Self>, calld: &Arc<BalancerCallState>, first: bool) {
        let me = self.me.clone();
        let serializer = self.serializer.clone();
        let message_calld = Arc::clone(calld);
        let recv_message: crate::transport::RecvMessageReady = Box::new(move |message| {
            serializer.schedule(move || {
                if let Some(glb) = me.upgrade() {
                    glb.on_balancer_message(message_calld, message);
                }
            });
        });
        calld.call.start_batch(StreamOpBatch {
            recv_initial_metadata: first.then(|| {
                Box::new(|_| {}) as crate::transport::RecvInitialMetadataReady
            }),
            recv_message: Some(recv_message),
            on_complete: Some(Box::new(|_| {})),
            ..Default::default()
        });
    }

    fn on_balancer_message(
        self: &Arc<Self>,
        calld: Arc<BalancerCallState>,
        message: Result<Option<Bytes>>,
    ) {
        {
            let inner = self.inner.lock().unwrap();
            if inner.shutting_down
                || !inner
                    .lb_calld
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &calld))
            {
                return;
            }
        }
        let Ok(Some(bytes)) = message else {
            // Errors and half-closes surface through the status batch.
            return;
        };
        match decode_balance_response(&bytes) {
            Ok(response) => {
                if let Some(initial) = response.initial {
                    calld.seen_initial_response.store(true, Ordering::Release);
                    if initial.client_stats_report_interval_ms > 0 {
                        *calld.report_interval.lock().unwrap() = Some(
                            std::time::Duration::from_millis(
                                initial.client_stats_report_interval_ms,
                            ),
                        );
                        debug!(
                            interval_ms = initial.client_stats_report_interval_ms,
                            "balancer requested client load reports"
                        );
                    }
                }
                if let Some(server_list) = response.server_list {
                    calld.seen_initial_response.store(true, Ordering::Release);
                    self.on_serverlist(&calld, server_list);
                }
            }
            Err(error) => {
                warn!(%error, "ignoring malformed balancer response");
            }
        }
        // Keep listening for serverlist updates.
        self.start_balancer_recv(&calld, false);
    }

    fn on_serverlist(self: &Arc<Self>, calld: &Arc<BalancerCallState>, server_list: ServerList) {
        if server_list.servers.is_empty() {
            debug!("received empty serverlist, ignoring");
            return;
        }
        let (fallback_timer, arm_report) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.serverlist.as_ref() == Some(&server_list) {
                debug!("serverlist unchanged");
                return;
            }
            let first_serverlist = inner.serverlist.is_none();
            let fallback_timer = if first_serverlist {
                inner.fallback_timer_pending = false;
                inner.fallback_timer.take()
            } else {
                None
            };
            if inner.fallback_in_use {
                info!("exiting fallback mode; balancer serverlist received");
                inner.fallback_in_use = false;
            }
            inner.serverlist = Some(server_list);
            inner.serverlist_index = 0;
            // Client load reporting starts with the first serverlist.
            let arm_report = calld.client_stats().is_none()
                && calld.report_interval.lock().unwrap().is_some();
            (fallback_timer, arm_report)
        };
        if let Some(timer) = fallback_timer {
            timer.cancel();
        }
        if arm_report {
            *calld.client_stats.lock().unwrap() = Some(Arc::new(ClientStats::new()));
            self.arm_report_timer(Arc::clone(calld));
        }
        self.rr_handover();
    }

    fn on_balancer_status(self: &Arc<Self>, calld: Arc<BalancerCallState>, result: BatchResult) {
        debug!(error = ?result.error, "balancer call ended");
        let retained = {
            let mut inner = self.inner.lock().unwrap();
            let retained = inner
                .lb_calld
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &calld));
            if retained {
                inner.lb_calld = None;
            }
            retained
        };
        if let Some(timer) = calld.report_timer.lock().unwrap().take() {
            timer.cancel();
        }
        if !retained {
            // Deliberately superseded; nothing to restart.
            return;
        }
        if self.inner.lock().unwrap().shutting_down {
            return;
        }
        if calld.seen_initial_response.load(Ordering::Acquire) {
            // Lost an established balancer stream: reset back-off and
            // reconnect immediately.
            {
                let mut inner = self.inner.lock().unwrap();
                inner.lb_call_backoff.reset();
                inner.backoff_started = false;
            }
            self.start_lb_call();
        } else {
            self.start_retry_timer();
        }
    }

    fn start_retry_timer(self: &Arc<Self>) {
        let deadline = {
            let mut inner = self.inner.lock().unwrap();
            if inner.retry_timer_pending {
                return;
            }
            inner.retry_timer_pending = true;
            let now = Instant::now();
            if inner.backoff_started {
                inner.lb_call_backoff.step(now)
            } else {
                inner.backoff_started = true;
                inner.lb_call_backoff.begin(now)
            }
        };
        debug!("arming balancer call retry timer");
        let me = self.me.clone();
        let timer = TimerHandle::at(&self.serializer, deadline, move || {
            if let Some(glb) = me.upgrade() {
                {
                    let mut inner = glb.inner.lock().unwrap();
                    inner.retry_timer_pending = false;
                    inner.retry_timer = None;
                    if inner.shutting_down {
                        return;
                    }
                }
                glb.start_lb_call();
            }
        });
        self.inner.lock().unwrap().retry_timer = Some(timer);
    }

    fn arm_fallback_timer(self: &Arc<Self>) {
        let me = self.me.clone();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.fallback_timer_pending {
                return;
            }
            inner.fallback_timer_pending = true;
        }
        let timer = TimerHandle::after(
            &self.serializer,
            self.channel_args.fallback_timeout,
            move || {
                if let Some(glb) = me.upgrade() {
                    glb.on_fallback_timer();
                }
            },
        );
        self.inner.lock().unwrap().fallback_timer = Some(timer);
    }

    fn on_fallback_timer(self: &Arc<Self>) {
        let entered_fallback = {
            let mut inner = self.inner.lock().unwrap();
            inner.fallback_timer_pending = false;
            inner.fallback_timer = None;
            if inner.shutting_down || inner.serverlist.is_some() {
                false
            } else {
                info!(
                    backends = inner.fallback_backend_addresses.len(),
                    "no serverlist from balancer; entering fallback mode"
                );
                inner.fallback_in_use = true;
                true
            }
        };
        if entered_fallback {
            self.rr_handover();
        }
    }

    // Inner round-robin management.

    fn backend_addresses(inner: &GlbInner) -> Vec<ResolvedAddress> {
        if inner.fallback_in_use || inner.serverlist.is_none() {
            inner.fallback_backend_addresses.clone()
        } else {
            inner
                .serverlist
                .as_ref()
                .unwrap()
                .servers
                .iter()
                .filter(|server| !server.drop)
                .map(|server| {
                    ResolvedAddress::backend(server.address.clone())
                        .with_token(server.load_balance_token.clone())
                })
                .collect()
        }
    }

    fn rr_handover(self: &Arc<Self>) {
        enum Action {
            Update(Arc<RoundRobin>, Vec<ResolvedAddress>),
            Create(Vec<ResolvedAddress>, u64),
        }
        let action = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            let addresses = Self::backend_addresses(&inner);
            match inner.rr.clone() {
                Some(rr) => Action::Update(rr, addresses),
                None => {
                    inner.rr_generation += 1;
                    Action::Create(addresses, inner.rr_generation)
                }
            }
        };
        match action {
            Action::Update(rr, addresses) => {
                debug!(backends = addresses.len(), "updating inner round-robin");
                rr.update(LbPolicyUpdate { addresses });
            }
            Action::Create(addresses, generation) => {
                info!(backends = addresses.len(), "creating inner round-robin");
                let rr = RoundRobin::create(LbPolicyBuildArgs {
                    server_name: self.server_name.clone(),
                    connector: Arc::clone(&self.connector),
                    // The inner policy runs on its own serializer.
                    serializer: Serializer::new(),
                    channel_args: self.channel_args.clone(),
                    addresses,
                });
                if let Some(hook) = self.reresolution.lock().unwrap().clone() {
                    let me = self.me.clone();
                    rr.set_reresolution_hook(Arc::new(move || {
                        // Balancer-fed policies get fresh addresses from the
                        // balancer itself; forward only when it is absent.
                        if let Some(glb) = me.upgrade() {
                            let forward = {
                                let inner = glb.inner.lock().unwrap();
                                inner
                                    .lb_calld
                                    .as_ref()
                                    .map(|calld| {
                                        !calld.seen_initial_response.load(Ordering::Acquire)
                                    })
                                    .unwrap_or(true)
                            };
                            if forward {
                                hook();
                            }
                        }
                    }));
                }
                let drained = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.rr = Some(Arc::clone(&rr));
                    std::mem::take(&mut inner.pending_picks)
                };
                self.watch_rr(&rr, generation, ConnectivityState::Idle);
                for pick in drained {
                    self.pick_from_internal_rr(true, &pick);
                }
            }
        }
    }

    fn watch_rr(self: &Arc<Self>, rr: &Arc<RoundRobin>, generation: u64, last_seen: ConnectivityState) {
        let me = self.me.clone();
        let serializer = self.serializer.clone();
        rr.notify_on_state_change(
            last_seen,
            Box::new(move |state, error| {
                serializer.schedule(move || {
                    if let Some(glb) = me.upgrade() {
                        glb.on_rr_state(generation, state, error);
                    }
                });
            }),
        );
    }

    fn on_rr_state(
        self: &Arc<Self>,
        generation: u64,
        state: ConnectivityState,
        error: Option<ChannelError>,
    ) {
        let rr = {
            let inner = self.inner.lock().unwrap();
            if inner.shutting_down || generation != inner.rr_generation {
                return;
            }
            inner.rr.clone()
        };
        // The outer policy mirrors the inner one, with SHUTDOWN collapsed to
        // TRANSIENT_FAILURE while grpclb itself is alive.
        let published = if state == ConnectivityState::Shutdown {
            ConnectivityState::TransientFailure
        } else {
            state
        };
        self.tracker.set(published, error, "inner_rr_state");
        if state != ConnectivityState::Shutdown {
            if let Some(rr) = rr {
                self.watch_rr(&rr, generation, state);
            }
        }
    }

    // Pick plumbing.

    fn attach_pick_outputs(pick: &Arc<PickState>, stats: Option<Arc<ClientStats>>) {
        let result = pick.result();
        if result.connected_subchannel.is_none() {
            return;
        }
        if let Some(token) = &result.user_data {
            let token = token.clone();
            pick.with_metadata(|metadata| {
                if metadata.get(LB_TOKEN).is_none() {
                    metadata.add(LB_TOKEN, token.clone());
                }
            });
        }
        if result.client_stats.is_none() {
            if let Some(stats) = stats {
                stats.record_call_started();
                let mut updated = result;
                updated.client_stats = Some(stats);
                pick.set_result(updated);
            }
        }
    }

    /// Delegates one pick to the inner round-robin, honoring server-directed
    /// drops. Returns `true` when the pick completed synchronously (never
    /// when `force_async` is set).
    fn pick_from_internal_rr(self: &Arc<Self>, force_async: bool, pick: &Arc<PickState>) -> bool {
        let (drop_token, stats, rr) = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let stats = inner
                .lb_calld
                .as_ref()
                .and_then(|calld| calld.client_stats());
            // Check for drops only when serving from a balancer serverlist.
            let drop_token = match (&inner.serverlist, inner.fallback_in_use) {
                (Some(list), false) if !list.servers.is_empty() => {
                    let index = inner.serverlist_index;
                    inner.serverlist_index = (index + 1) % list.servers.len();
                    let server = &list.servers[index];
                    server.drop.then(|| server.load_balance_token.clone())
                }
                _ => None,
            };
            (drop_token, stats, inner.rr.clone())
        };
        if let Some(token) = drop_token {
            debug!(token = %token, "pick dropped by balancer directive");
            if let Some(stats) = &stats {
                stats.record_call_dropped(&token);
            }
            pick.set_result(PickResult::default());
            if force_async {
                pick.complete(Ok(()));
                return false;
            }
            return true;
        }
        let Some(rr) = rr else {
            self.inner.lock().unwrap().pending_picks.push(Arc::clone(pick));
            return false;
        };
        // Interpose on completion so async picks get the LB token and stats
        // attached before the call proceeds.
        if let Some(original) = pick.swap_on_complete(Box::new(|_| {})) {
            let wrapped_pick = Arc::clone(pick);
            let wrapped_stats = stats.clone();
            pick.swap_on_complete(Box::new(move |outcome| {
                Self::attach_pick_outputs(&wrapped_pick, wrapped_stats);
                original(outcome);
            }));
        }
        let done = rr.pick(pick);
        if done {
            Self::attach_pick_outputs(pick, stats);
            if force_async {
                pick.complete(Ok(()));
                return false;
            }
        }
        done
    }
}

impl LbPolicy for GrpcLb {
    fn name(&self) -> &'static str {
        "grpclb"
    }

    fn pick(&self, pick: &Arc<PickState>) -> bool {
        let Some(me) = self.upgrade() else {
            return true;
        };
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return true;
            }
            if inner.rr.is_none() {
                inner.pending_picks.push(Arc::clone(pick));
                return false;
            }
        }
        me.pick_from_internal_rr(false, pick)
    }

    fn cancel_pick(&self, pick: &Arc<PickState>, error: ChannelError) {
        let (removed, rr) = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.pending_picks.len();
            inner.pending_picks.retain(|queued| !Arc::ptr_eq(queued, pick));
            (before != inner.pending_picks.len(), inner.rr.clone())
        };
        if removed {
            pick.complete(Err(ChannelError::wrap("pick cancelled", error)));
        } else if let Some(rr) = rr {
            rr.cancel_pick(pick, error);
        }
    }

    fn cancel_picks_matching(&self, mask: u32, eq: u32, error: ChannelError) {
        let (cancelled, rr) = {
            let mut inner = self.inner.lock().unwrap();
            let mut cancelled = Vec::new();
            inner.pending_picks.retain(|pick| {
                if pick.initial_metadata_flags & mask == eq {
                    cancelled.push(Arc::clone(pick));
                    false
                } else {
                    true
                }
            });
            (cancelled, inner.rr.clone())
        };
        for pick in cancelled {
            pick.complete(Err(ChannelError::wrap(
                "pick cancelled by connectivity change",
                error.clone(),
            )));
        }
        if let Some(rr) = rr {
            rr.cancel_picks_matching(mask, eq, error);
        }
    }

    fn ping_one(&self, on_ack: AckCallback) {
        let rr = self.inner.lock().unwrap().rr.clone();
        match rr {
            Some(rr) => rr.ping_one(on_ack),
            None => on_ack(Err(ChannelError::Unavailable(
                "no balancer-directed backends yet".into(),
            ))),
        }
    }

    fn exit_idle(&self) {
        let rr = self.inner.lock().unwrap().rr.clone();
        if let Some(rr) = rr {
            rr.exit_idle();
        }
    }

    fn check_connectivity(&self) -> (ConnectivityState, Option<ChannelError>) {
        self.tracker.current_with_error()
    }

    fn notify_on_state_change(&self, last_seen: ConnectivityState, notify: StateCallback) {
        self.tracker.notify_on_state_change(last_seen, notify);
    }

    fn update(&self, update: LbPolicyUpdate) {
        let Some(me) = self.upgrade() else {
            return;
        };
        let mut balancers = Vec::new();
        let mut backends = Vec::new();
        for address in update.addresses {
            if address.is_balancer {
                balancers.push(address);
            } else {
                backends.push(address);
            }
        }
        if balancers.is_empty() {
            warn!("grpclb update carried no balancer addresses");
        }
        let refresh_fallback_rr = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            inner.fallback_backend_addresses = backends;
            inner.fallback_in_use && inner.rr.is_some()
        };
        me.ensure_balancer_channel(balancers);
        if refresh_fallback_rr {
            me.rr_handover();
        }
    }

    fn hand_off_pending_picks(&self, new_policy: &Arc<dyn LbPolicy>) {
        let picks = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.pending_picks)
        };
        for pick in picks {
            if new_policy.pick(&pick) {
                pick.complete(Ok(()));
            }
        }
    }

    fn set_reresolution_hook(&self, hook: ReresolutionHook) {
        *self.reresolution.lock().unwrap() = Some(hook);
    }

    fn shutdown(&self, error: ChannelError) {
        let (calld, timers, channel, rr, picks) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            (
                inner.lb_calld.take(),
                (inner.retry_timer.take(), inner.fallback_timer.take()),
                inner.balancer_channel.take(),
                inner.rr.take(),
                std::mem::take(&mut inner.pending_picks),
            )
        };
        if let Some(calld) = calld {
            calld.orphan();
        }
        for timer in [timers.0, timers.1].into_iter().flatten() {
            timer.cancel();
        }
        if let Some(rr) = rr {
            rr.shutdown(error.clone());
        }
        if let Some(channel) = channel {
            channel.disconnect(ChannelError::wrap("grpclb shutdown", error.clone()));
        }
        for pick in picks {
            pick.complete(Err(ChannelError::wrap("policy shut down", error.clone())));
        }
        self.tracker
            .set(ConnectivityState::Shutdown, Some(error), "grpclb_shutdown");
    }
}

impl GrpcLb {
    fn arm_report_timer(self: &Arc<Self>, calld: Arc<BalancerCallState>) {
        let Some(interval) = *calld.report_interval.lock().unwrap() else {
            return;
        };
        let me = self.me.clone();
        let timer_calld = Arc::clone(&calld);
        let timer = TimerHandle::after(&self.serializer, interval, move || {
            if let Some(glb) = me.upgrade() {
                glb.on_report_timer(timer_calld);
            }
        });
        *calld.report_timer.lock().unwrap() = Some(timer);
    }

    fn on_report_timer(self: &Arc<Self>, calld: Arc<BalancerCallState>) {
        {
            let inner = self.inner.lock().unwrap();
            if inner.shutting_down
                || !inner
                    .lb_calld
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &calld))
            {
                return;
            }
        }
        let Some(stats) = calld.client_stats() else {
            return;
        };
        let report = stats.snapshot_and_reset();
        let report_is_zero = report.is_zero();
        // Skip a send when this and the previous interval were both idle.
        if report_is_zero && calld.last_report_zero.load(Ordering::Acquire) {
            debug!("skipping all-zero client load report");
        } else {
            calld.call.start_batch(StreamOpBatch {
                send_message: Some(Box::new(SliceBuffer::from_bytes(encode_balance_request(
                    &BalanceRequest {
                        initial: None,
                        client_stats: Some(report),
                    },
                )))),
                on_complete: Some(Box::new(|_| {})),
                ..Default::default()
            });
        }
        calld.last_report_zero.store(report_is_zero, Ordering::Release);
        self.arm_report_timer(calld);
    }
}

impl std::fmt::Debug for GrpcLb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("GrpcLb")
            .field("state", &self.tracker.current())
            .field("has_serverlist", &inner.serverlist.is_some())
            .field("fallback_in_use", &inner.fallback_in_use)
            .field("pending_picks", &inner.pending_picks.len())
            .finish()
    }
}
