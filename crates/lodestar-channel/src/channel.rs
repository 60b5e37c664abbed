//! The client channel: resolver integration, LB policy lifecycle, and
//! channel-level operations.
//!
//! A channel owns a resolver and the current LB policy, applies the resolver's
//! service config, tracks aggregate connectivity, and hands calls to the
//! per-call pick and retry machinery in `call`/`retry`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backoff::BackoffConfig;
use crate::call::{Call, CallOptions, CallShared};
use crate::connectivity::{ConnectivityState, ConnectivityTracker, StateCallback};
use crate::error::{ChannelError, Result};
use crate::lb_policy::{create_lb_policy, AckCallback, LbPolicy, LbPolicyBuildArgs, LbPolicyUpdate};
use crate::resolver::{Resolver, ResolverResult};
use crate::serializer::Serializer;
use crate::service_config::ServiceConfig;
use crate::subchannel::Connector;
use crate::throttle::{RetryThrottle, RetryThrottleMap};
use crate::transport::WAIT_FOR_READY;

/// Default cap on bytes buffered for retry per RPC.
pub const DEFAULT_PER_RPC_RETRY_BUFFER_SIZE: usize = 1 << 30;

/// Default time grpclb waits for a serverlist before using fallback backends.
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel-level configuration knobs.
#[derive(Debug, Clone)]
pub struct ChannelArgs {
    /// Cap on bytes buffered for retry per RPC.
    pub per_rpc_retry_buffer_size: usize,
    /// When set, subchannels gate READY on a health watch of this service.
    pub health_check_service: Option<String>,
    /// Deadline applied to each balancer stream; `None` means no deadline.
    pub lb_call_timeout: Option<Duration>,
    /// grpclb fallback timeout.
    pub fallback_timeout: Duration,
    /// Reconnect back-off for subchannels.
    pub subchannel_backoff: BackoffConfig,
    /// Retry back-off for the balancer call.
    pub balancer_call_backoff: BackoffConfig,
}

impl Default for ChannelArgs {
    fn default() -> Self {
        Self {
            per_rpc_retry_buffer_size: DEFAULT_PER_RPC_RETRY_BUFFER_SIZE,
            health_check_service: None,
            lb_call_timeout: None,
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
            subchannel_backoff: BackoffConfig::default(),
            balancer_call_backoff: BackoffConfig::default(),
        }
    }
}

/// A deferred pick parked until the resolver produces a result.
pub(crate) struct WaitingPick {
    pub(crate) call: Arc<CallShared>,
    pub(crate) cancelled: Arc<std::sync::atomic::AtomicBool>,
}

pub(crate) struct ChannelInner {
    pub(crate) resolver: Option<Arc<dyn Resolver>>,
    pub(crate) started_resolving: bool,
    pub(crate) exit_idle_when_lb_policy_arrives: bool,
    pub(crate) lb_policy: Option<Arc<dyn LbPolicy>>,
    pub(crate) lb_policy_generation: u64,
    pub(crate) retry_throttle: Option<Arc<RetryThrottle>>,
    pub(crate) service_config: Option<Arc<ServiceConfig>>,
    pub(crate) waiting_for_resolver: Vec<WaitingPick>,
}

#[derive(Default)]
struct ChannelInfo {
    lb_policy_name: Option<String>,
    service_config_json: Option<String>,
}

pub(crate) struct ChannelShared {
    pub(crate) server_name: String,
    pub(crate) args: ChannelArgs,
    pub(crate) serializer: Serializer,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) tracker: ConnectivityTracker,
    pub(crate) inner: Mutex<ChannelInner>,
    // Guarded separately so info queries never touch the serializer.
    info: Mutex<ChannelInfo>,
    external_watchers: Mutex<Vec<u64>>,
    next_watcher_id: AtomicU64,
}

/// The top-level client-side handle through which RPCs are issued.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
}

impl Channel {
    /// Creates a channel over `resolver` and `connector`.
    ///
    /// The channel starts `Idle`; the first pick (or an explicit
    /// `check_connectivity(true)`) kicks name resolution.
    pub fn new(
        server_uri: impl Into<String>,
        args: ChannelArgs,
        resolver: Arc<dyn Resolver>,
        connector: Arc<dyn Connector>,
    ) -> Channel {
        let server_uri = server_uri.into();
        let server_name = server_name_from_uri(&server_uri);
        Channel {
            shared: Arc::new(ChannelShared {
                server_name,
                args,
                serializer: Serializer::new(),
                connector,
                tracker: ConnectivityTracker::new("client_channel", ConnectivityState::Idle),
                inner: Mutex::new(ChannelInner {
                    resolver: Some(resolver),
                    started_resolving: false,
                    exit_idle_when_lb_policy_arrives: false,
                    lb_policy: None,
                    lb_policy_generation: 0,
                    retry_throttle: None,
                    service_config: None,
                    waiting_for_resolver: Vec::new(),
                }),
                info: Mutex::new(ChannelInfo::default()),
                external_watchers: Mutex::new(Vec::new()),
                next_watcher_id: AtomicU64::new(1),
            }),
        }
    }

    /// The server name this channel resolves.
    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    /// Creates a call on this channel. Ops submitted to the call are held
    /// until a pick produces a transport call.
    pub fn create_call(&self, options: CallOptions) -> Call {
        Call::new(Arc::clone(&self.shared), options)
    }

    /// Current channel connectivity. With `try_to_connect`, an idle channel
    /// kicks resolution and exits idle once a policy arrives.
    pub fn check_connectivity(&self, try_to_connect: bool) -> ConnectivityState {
        let state = self.shared.tracker.current();
        if state == ConnectivityState::Idle && try_to_connect {
            let shared = Arc::clone(&self.shared);
            self.shared.serializer.schedule(move || {
                let policy = {
                    let mut inner = shared.inner.lock().unwrap();
                    match inner.lb_policy.clone() {
                        Some(policy) => Some(policy),
                        None => {
                            inner.exit_idle_when_lb_policy_arrives = true;
                            ChannelShared::start_resolving(&shared, &mut inner);
                            None
                        }
                    }
                };
                if let Some(policy) = policy {
                    policy.exit_idle();
                }
            });
        }
        state
    }

    /// Registers a one-shot external connectivity watcher. Returns an id
    /// observable through [`Channel::num_external_watchers`].
    pub fn watch_connectivity_state(
        &self,
        last_seen: ConnectivityState,
        notify: StateCallback,
    ) -> u64 {
        let id = self.shared.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.shared.external_watchers.lock().unwrap().push(id);
        let shared = Arc::clone(&self.shared);
        self.shared.tracker.notify_on_state_change(
            last_seen,
            Box::new(move |state, error| {
                shared
                    .external_watchers
                    .lock()
                    .unwrap()
                    .retain(|watcher| *watcher != id);
                notify(state, error);
            }),
        );
        id
    }

    /// Number of external connectivity watchers currently registered.
    pub fn num_external_watchers(&self) -> usize {
        self.shared.external_watchers.lock().unwrap().len()
    }

    /// Sends a channel-level ping through the LB policy.
    pub fn ping(&self, on_ack: AckCallback) {
        let shared = Arc::clone(&self.shared);
        self.shared.serializer.schedule(move || {
            let policy = shared.inner.lock().unwrap().lb_policy.clone();
            match policy {
                Some(policy) => policy.ping_one(on_ack),
                None => on_ack(Err(ChannelError::Unavailable(
                    "ping with no load balancing".into(),
                ))),
            }
        });
    }

    /// Tears the channel down: shuts the resolver and LB policy, fails
    /// deferred picks, and publishes `Shutdown`.
    pub fn disconnect(&self, error: ChannelError) {
        let shared = Arc::clone(&self.shared);
        self.shared.serializer.schedule(move || {
            ChannelShared::shutdown_locked(&shared, error);
        });
    }

    /// The LB policy name last selected from a resolver result.
    pub fn lb_policy_name(&self) -> Option<String> {
        self.shared.info.lock().unwrap().lb_policy_name.clone()
    }

    /// The raw service-config JSON last received from the resolver.
    pub fn service_config_json(&self) -> Option<String> {
        self.shared.info.lock().unwrap().service_config_json.clone()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("server_name", &self.shared.server_name)
            .field("state", &self.shared.tracker.current())
            .finish()
    }
}

impl ChannelShared {
    /// Kicks the first resolver request. Caller holds the inner lock.
    pub(crate) fn start_resolving(shared: &Arc<ChannelShared>, inner: &mut ChannelInner) {
        if inner.started_resolving {
            return;
        }
        let Some(resolver) = inner.resolver.clone() else {
            return;
        };
        inner.started_resolving = true;
        debug!(server = %shared.server_name, "starting name resolution");
        Self::request_resolution(shared, &resolver);
    }

    fn request_resolution(shared: &Arc<ChannelShared>, resolver: &Arc<dyn Resolver>) {
        let shared = Arc::clone(shared);
        resolver.next(Box::new(move |outcome| {
            let shared2 = Arc::clone(&shared);
            shared.serializer.schedule(move || {
                Self::on_resolver_result(&shared2, outcome);
            });
        }));
    }

    /// Handles one resolver result on the channel serializer (spec steps for
    /// resolver-result processing).
    fn on_resolver_result(shared: &Arc<ChannelShared>, outcome: Result<ResolverResult>) {
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                warn!(server = %shared.server_name, %error, "resolver failed; shutting down channel");
                Self::shutdown_locked(
                    shared,
                    ChannelError::wrap("resolver transient failure", error),
                );
                return;
            }
        };
        // Select the LB policy name; any balancer address forces grpclb.
        let mut lb_policy_name = result.lb_policy_name.clone();
        if result.has_balancer_address() {
            if let Some(name) = &lb_policy_name {
                if name != "grpclb" {
                    info!(
                        requested = %name,
                        "resolver provided balancer addresses; forcing grpclb policy"
                    );
                }
            }
            lb_policy_name = Some("grpclb".to_string());
        }
        let lb_policy_name = lb_policy_name.unwrap_or_else(|| "pick_first".to_string());
        // Parse the service config before swapping anything in.
        let parsed_config = result
            .service_config_json
            .as_deref()
            .and_then(ServiceConfig::parse);
        let retry_throttle = parsed_config.as_ref().and_then(|config| {
            config.retry_throttling().map(|params| {
                RetryThrottleMap::global().for_server(
                    &shared.server_name,
                    params.max_milli_tokens,
                    params.milli_token_ratio,
                )
            })
        });
        let name_changed = shared
            .info
            .lock()
            .unwrap()
            .lb_policy_name
            .as_deref()
            != Some(lb_policy_name.as_str());
        let (resolver, kept_policy, new_policy, waiting, exit_idle) = {
            let mut inner = shared.inner.lock().unwrap();
            let Some(resolver) = inner.resolver.clone() else {
                // Disconnected while the result was in flight.
                drop(inner);
                Self::shutdown_locked(
                    shared,
                    ChannelError::Unavailable("got resolver result after disconnection".into()),
                );
                return;
            };
            let mut kept_policy = None;
            let mut new_policy: Option<Arc<dyn LbPolicy>> = None;
            if inner.lb_policy.is_some() && !name_changed {
                kept_policy = inner.lb_policy.clone();
            } else {
                match create_lb_policy(
                    &lb_policy_name,
                    LbPolicyBuildArgs {
                        server_name: shared.server_name.clone(),
                        connector: Arc::clone(&shared.connector),
                        serializer: shared.serializer.clone(),
                        channel_args: shared.args.clone(),
                        addresses: result.addresses.clone(),
                    },
                ) {
                    Some(policy) => {
                        let old = inner.lb_policy.replace(Arc::clone(&policy));
                        inner.lb_policy_generation += 1;
                        if let Some(old) = &old {
                            debug!(policy = old.name(), "shutting down superseded LB policy");
                            old.hand_off_pending_picks(&policy);
                            old.shutdown(ChannelError::Unavailable(
                                "superseded by new LB policy".into(),
                            ));
                        }
                        new_policy = Some(policy);
                    }
                    None => {
                        warn!(policy = %lb_policy_name, "could not create LB policy; keeping previous");
                        kept_policy = inner.lb_policy.clone();
                    }
                }
            }
            // Swap throttle and method-params table. A malformed config is
            // dropped and the previous one retained; an absent one clears.
            match (&result.service_config_json, &parsed_config) {
                (Some(_), Some(config)) => {
                    inner.retry_throttle = retry_throttle.clone();
                    inner.service_config = Some(Arc::new(config.clone()));
                }
                (Some(_), None) => {}
                (None, _) => {
                    inner.retry_throttle = None;
                    inner.service_config = None;
                }
            }
            let waiting = if inner.lb_policy.is_some() {
                std::mem::take(&mut inner.waiting_for_resolver)
            } else {
                Vec::new()
            };
            let exit_idle = inner.exit_idle_when_lb_policy_arrives && new_policy.is_some();
            if exit_idle {
                inner.exit_idle_when_lb_policy_arrives = false;
            }
            (resolver, kept_policy, new_policy, waiting, exit_idle)
        };
        // Update info fields under their own lock.
        {
            let mut info = shared.info.lock().unwrap();
            info.lb_policy_name = Some(lb_policy_name.clone());
            if let Some(json) = &result.service_config_json {
                info.service_config_json = Some(json.clone());
            }
        }
        debug!(
            server = %shared.server_name,
            policy = %lb_policy_name,
            changed = name_changed,
            addresses = result.addresses.len(),
            "resolver result applied"
        );
        if let Some(policy) = &kept_policy {
            // Same policy: push the new addresses into it.
            policy.update(LbPolicyUpdate {
                addresses: result.addresses.clone(),
            });
        }
        if let Some(policy) = &new_policy {
            let generation = shared.inner.lock().unwrap().lb_policy_generation;
            Self::install_policy_hooks(shared, policy, generation);
            let (state, error) = policy.check_connectivity();
            Self::set_connectivity(shared, state, error, "new_lb_policy");
            if exit_idle {
                policy.exit_idle();
            }
        }
        // Serve picks that were parked waiting for this result.
        let serving_policy = shared.inner.lock().unwrap().lb_policy.clone();
        if let Some(policy) = serving_policy {
            for parked in waiting {
                if parked.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                crate::call::continue_pick_with_policy(&parked.call, &policy);
            }
        }
        // Ask for the next result.
        Self::request_resolution(shared, &resolver);
    }

    fn install_policy_hooks(
        shared: &Arc<ChannelShared>,
        policy: &Arc<dyn LbPolicy>,
        generation: u64,
    ) {
        // Re-resolution requests from the policy kick the resolver.
        let hook_shared = Arc::clone(shared);
        policy.set_reresolution_hook(Arc::new(move || {
            let resolver = hook_shared.inner.lock().unwrap().resolver.clone();
            if let Some(resolver) = resolver {
                resolver.channel_saw_error();
            }
        }));
        let (state, _) = policy.check_connectivity();
        Self::watch_policy(shared, policy, generation, state);
    }

    fn watch_policy(
        shared: &Arc<ChannelShared>,
        policy: &Arc<dyn LbPolicy>,
        generation: u64,
        last_seen: ConnectivityState,
    ) {
        let weak = Arc::downgrade(shared);
        let serializer = shared.serializer.clone();
        policy.notify_on_state_change(
            last_seen,
            Box::new(move |state, error| {
                serializer.schedule(move || {
                    if let Some(shared) = weak.upgrade() {
                        Self::on_policy_state_changed(&shared, generation, state, error);
                    }
                });
            }),
        );
    }

    fn on_policy_state_changed(
        shared: &Arc<ChannelShared>,
        generation: u64,
        state: ConnectivityState,
        error: Option<ChannelError>,
    ) {
        let (current_policy, resolver) = {
            let inner = shared.inner.lock().unwrap();
            if inner.lb_policy_generation != generation {
                return;
            }
            (inner.lb_policy.clone(), inner.resolver.clone())
        };
        let Some(policy) = current_policy else {
            return;
        };
        let mut publish = state;
        if state == ConnectivityState::Shutdown && resolver.is_some() {
            // The policy died underneath us; hint re-resolution and drop it.
            if let Some(resolver) = &resolver {
                resolver.channel_saw_error();
            }
            let mut inner = shared.inner.lock().unwrap();
            inner.lb_policy = None;
            publish = ConnectivityState::TransientFailure;
        }
        Self::set_connectivity(shared, publish, error, "lb_policy_state_changed");
        if state != ConnectivityState::Shutdown {
            Self::watch_policy(shared, &policy, generation, state);
        }
    }

    /// Publishes channel connectivity, cancelling queued picks the new state
    /// can no longer serve.
    pub(crate) fn set_connectivity(
        shared: &Arc<ChannelShared>,
        state: ConnectivityState,
        error: Option<ChannelError>,
        reason: &str,
    ) {
        let policy = shared.inner.lock().unwrap().lb_policy.clone();
        if let Some(policy) = policy {
            if state == ConnectivityState::TransientFailure {
                // Cancel picks that did not ask to wait for READY.
                policy.cancel_picks_matching(
                    WAIT_FOR_READY,
                    0,
                    error
                        .clone()
                        .unwrap_or_else(|| ChannelError::Unavailable(reason.to_string())),
                );
            } else if state == ConnectivityState::Shutdown {
                policy.cancel_picks_matching(
                    0,
                    0,
                    error
                        .clone()
                        .unwrap_or_else(|| ChannelError::Unavailable(reason.to_string())),
                );
            }
        }
        shared.tracker.set(state, error, reason);
    }

    fn shutdown_locked(shared: &Arc<ChannelShared>, error: ChannelError) {
        let (resolver, policy, waiting) = {
            let mut inner = shared.inner.lock().unwrap();
            (
                inner.resolver.take(),
                inner.lb_policy.take(),
                std::mem::take(&mut inner.waiting_for_resolver),
            )
        };
        if resolver.is_none() && policy.is_none() && waiting.is_empty() {
            return;
        }
        if let Some(policy) = &policy {
            policy.cancel_picks_matching(0, 0, error.clone());
            policy.shutdown(error.clone());
        }
        if let Some(resolver) = resolver {
            resolver.shutdown();
        }
        for parked in waiting {
            parked.cancelled.store(true, Ordering::Release);
            crate::call::fail_deferred_pick(
                &parked.call,
                ChannelError::wrap("channel disconnected", error.clone()),
            );
        }
        shared
            .tracker
            .set(ConnectivityState::Shutdown, Some(error), "disconnect");
    }
}

fn server_name_from_uri(uri: &str) -> String {
    let path = match uri.find("://") {
        Some(index) => &uri[index + 3..],
        None => uri,
    };
    path.trim_start_matches('/').to_string()
}
