//! The round-robin LB policy.
//!
//! Maintains a subchannel list over the resolved backends and serves picks
//! from the READY members in cursor order. Address updates while picking are
//! staged as a pending list and promoted exactly when one of the pending
//! subchannels first reports READY.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info};

use crate::connectivity::{ConnectivityState, ConnectivityTracker, StateCallback};
use crate::error::ChannelError;
use crate::lb_policy::{
    AckCallback, LbPolicy, LbPolicyBuildArgs, LbPolicyUpdate, PickResult, PickState,
    ReresolutionHook,
};
use crate::resolver::ResolvedAddress;
use crate::serializer::Serializer;
use crate::subchannel::{Connector, Subchannel, SubchannelOptions};
use crate::subchannel_list::{start_watch, SubchannelList, SubchannelStateHandler};

struct RrInner {
    current: Option<SubchannelList>,
    latest_pending: Option<SubchannelList>,
    last_ready_index: Option<usize>,
    pending_picks: Vec<Arc<PickState>>,
    started_picking: bool,
    shut_down: bool,
    next_list_id: u64,
}

/// Round-robin policy over the resolver's backend addresses.
pub struct RoundRobin {
    me: Weak<RoundRobin>,
    serializer: Serializer,
    connector: Arc<dyn Connector>,
    subchannel_options: SubchannelOptions,
    tracker: ConnectivityTracker,
    reresolution: Mutex<Option<ReresolutionHook>>,
    inner: Mutex<RrInner>,
}

impl RoundRobin {
    /// Builds the policy and applies the initial address set.
    pub fn create(args: LbPolicyBuildArgs) -> Arc<RoundRobin> {
        let policy = Arc::new_cyclic(|me| RoundRobin {
            me: me.clone(),
            serializer: args.serializer.clone(),
            connector: Arc::clone(&args.connector),
            subchannel_options: SubchannelOptions {
                backoff: args.channel_args.subchannel_backoff.clone(),
                health_check_service: args.channel_args.health_check_service.clone(),
            },
            tracker: ConnectivityTracker::new("round_robin", ConnectivityState::Idle),
            reresolution: Mutex::new(None),
            inner: Mutex::new(RrInner {
                current: None,
                latest_pending: None,
                last_ready_index: None,
                pending_picks: Vec::new(),
                started_picking: false,
                shut_down: false,
                next_list_id: 0,
            }),
        });
        policy.update(LbPolicyUpdate {
            addresses: args.addresses,
        });
        policy
    }

    fn state_handler(&self) -> SubchannelStateHandler {
        let me = self.me.clone();
        Arc::new(move |list_id, index, state, error| {
            if let Some(policy) = me.upgrade() {
                policy.on_subchannel_state(list_id, index, state, error);
            }
        })
    }

    /// Cursor scan: first READY subchannel after `last_ready`.
    fn scan_for_ready(list: &SubchannelList, last_ready: Option<usize>) -> Option<usize> {
        let n = list.len();
        if n == 0 {
            return None;
        }
        let start = last_ready.map(|i| (i + 1) % n).unwrap_or(0);
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&index| {
                let sd = &list.subchannels[index];
                sd.curr_state == ConnectivityState::Ready && sd.connected.is_some()
            })
    }

    fn serve_pick_from(list: &SubchannelList, index: usize, pick: &Arc<PickState>) {
        let sd = &list.subchannels[index];
        pick.set_result(PickResult {
            connected_subchannel: sd.connected.clone(),
            user_data: sd.lb_token.clone(),
            client_stats: None,
        });
    }

    fn watch_all(&self, list: &SubchannelList) -> Vec<(u64, usize, Arc<Subchannel>)> {
        list.subchannels
            .iter()
            .enumerate()
            .map(|(index, sd)| (list.id, index, Arc::clone(&sd.subchannel)))
            .collect()
    }

    fn begin_watching(&self, targets: Vec<(u64, usize, Arc<Subchannel>)>) {
        for (list_id, index, subchannel) in targets {
            start_watch(
                list_id,
                index,
                &subchannel,
                ConnectivityState::Idle,
                &self.serializer,
                self.state_handler(),
            );
            subchannel.request_connection();
        }
    }

    fn on_subchannel_state(
        self: &Arc<Self>,
        list_id: u64,
        index: usize,
        state: ConnectivityState,
        error: Option<ChannelError>,
    ) {
        let mut to_shutdown: Option<SubchannelList> = None;
        let mut completions: Vec<Arc<PickState>> = Vec::new();
        let mut rewatch: Option<Arc<Subchannel>> = None;
        let mut aggregate: Option<(ConnectivityState, Option<ChannelError>, bool)> = None;
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if inner.shut_down {
                return;
            }
            let in_current = inner.current.as_ref().is_some_and(|l| l.id == list_id);
            let in_pending = inner.latest_pending.as_ref().is_some_and(|l| l.id == list_id);
            if !in_current && !in_pending {
                // Notification for a superseded list; stop watching.
                return;
            }
            {
                let list = if in_current {
                    inner.current.as_mut().unwrap()
                } else {
                    inner.latest_pending.as_mut().unwrap()
                };
                list.record_transition(index, state);
                let sd = &mut list.subchannels[index];
                sd.connected = if state == ConnectivityState::Ready {
                    sd.subchannel.connected_subchannel()
                } else {
                    None
                };
                if state != ConnectivityState::Shutdown {
                    rewatch = Some(Arc::clone(&sd.subchannel));
                }
            }
            // A READY subchannel in the pending list promotes it.
            if state == ConnectivityState::Ready && in_pending {
                info!(list_id, "promoting pending subchannel list");
                to_shutdown = inner.current.take();
                inner.current = inner.latest_pending.take();
                inner.last_ready_index = None;
            }
            // Serve queued picks while READY members exist.
            if state == ConnectivityState::Ready {
                if let Some(list) = inner.current.as_ref() {
                    let mut last_ready = inner.last_ready_index;
                    let mut unserved = Vec::new();
                    for pick in inner.pending_picks.drain(..) {
                        match Self::scan_for_ready(list, last_ready) {
                            Some(found) => {
                                Self::serve_pick_from(list, found, &pick);
                                last_ready = Some(found);
                                completions.push(pick);
                            }
                            None => unserved.push(pick),
                        }
                    }
                    inner.pending_picks = unserved;
                    inner.last_ready_index = last_ready;
                }
            }
            // Aggregate connectivity over the transitioned subchannel's list,
            // in priority order.
            let list = if in_pending && inner.latest_pending.is_some() {
                inner.latest_pending.as_ref().unwrap()
            } else {
                inner.current.as_ref().unwrap()
            };
            if list.num_ready > 0 {
                aggregate = Some((ConnectivityState::Ready, None, false));
            } else if state == ConnectivityState::Connecting {
                aggregate = Some((ConnectivityState::Connecting, None, false));
            } else if list.num_shutdown == list.len() {
                inner.started_picking = false;
                aggregate = Some((ConnectivityState::Idle, None, true));
            } else if list.num_shutdown + list.num_transient_failures == list.len() {
                aggregate = Some((ConnectivityState::TransientFailure, error.clone(), false));
            }
        }
        if let Some(mut old) = to_shutdown {
            old.shutdown_all("superseded by promoted list");
        }
        if let Some((agg_state, agg_error, reresolve)) = aggregate {
            self.tracker.set(agg_state, agg_error, "subchannel_transition");
            if reresolve {
                let hook = self.reresolution.lock().unwrap().clone();
                if let Some(hook) = hook {
                    hook();
                }
            }
        }
        for pick in completions {
            pick.complete(Ok(()));
        }
        if let Some(subchannel) = rewatch {
            start_watch(
                list_id,
                index,
                &subchannel,
                state,
                &self.serializer,
                self.state_handler(),
            );
        }
    }

    fn start_picking(&self) {
        let targets = {
            let inner = self.inner.lock().unwrap();
            inner
                .current
                .as_ref()
                .map(|list| self.watch_all(list))
                .unwrap_or_default()
        };
        self.begin_watching(targets);
    }
}

impl LbPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn pick(&self, pick: &Arc<PickState>) -> bool {
        let need_start = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                // Completed with no subchannel; the caller maps this to an
                // unavailable call.
                return true;
            }
            if let Some(list) = inner.current.as_ref() {
                if let Some(index) = Self::scan_for_ready(list, inner.last_ready_index) {
                    Self::serve_pick_from(list, index, pick);
                    inner.last_ready_index = Some(index);
                    debug!(index, "pick served synchronously");
                    return true;
                }
            }
            inner.pending_picks.push(Arc::clone(pick));
            let need_start = !inner.started_picking;
            inner.started_picking = true;
            need_start
        };
        if need_start {
            self.start_picking();
        }
        false
    }

    fn cancel_pick(&self, pick: &Arc<PickState>, error: ChannelError) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.pending_picks.len();
            inner.pending_picks.retain(|queued| !Arc::ptr_eq(queued, pick));
            before != inner.pending_picks.len()
        };
        if removed {
            pick.complete(Err(ChannelError::wrap("pick cancelled", error)));
        }
    }

    fn cancel_picks_matching(&self, mask: u32, eq: u32, error: ChannelError) {
        let cancelled = {
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
            cancelled
        };
        for pick in cancelled {
            pick.complete(Err(ChannelError::wrap(
                "pick cancelled by connectivity change",
                error.clone(),
            )));
        }
    }

    fn ping_one(&self, on_ack: AckCallback) {
        let ready = {
            let inner = self.inner.lock().unwrap();
            inner
                .current
                .as_ref()
                .map(|list| list.num_ready > 0)
                .unwrap_or(false)
        };
        if ready {
            on_ack(Ok(()));
        } else {
            on_ack(Err(ChannelError::Unavailable("no connected subchannel".into())));
        }
    }

    fn exit_idle(&self) {
        let need_start = {
            let mut inner = self.inner.lock().unwrap();
            let need_start = !inner.started_picking && !inner.shut_down;
            if need_start {
                inner.started_picking = true;
            }
            need_start
        };
        if need_start {
            self.start_picking();
        }
    }

    fn check_connectivity(&self) -> (ConnectivityState, Option<ChannelError>) {
        self.tracker.current_with_error()
    }

    fn notify_on_state_change(&self, last_seen: ConnectivityState, notify: StateCallback) {
        self.tracker.notify_on_state_change(last_seen, notify);
    }

    fn update(&self, update: LbPolicyUpdate) {
        let backends: Vec<ResolvedAddress> = update
            .addresses
            .into_iter()
            .filter(|address| !address.is_balancer)
            .collect();
        let mut to_shutdown: Option<SubchannelList> = None;
        let mut watch_targets = Vec::new();
        let empty_with_no_list = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return;
            }
            if backends.is_empty() {
                if inner.current.is_some() {
                    debug!("ignoring empty address update; keeping current list");
                    return;
                }
                true
            } else {
                let id = inner.next_list_id;
                inner.next_list_id += 1;
                let list =
                    SubchannelList::new(id, &backends, &self.connector, &self.subchannel_options);
                if inner.started_picking && inner.current.is_some() {
                    watch_targets = self.watch_all(&list);
                    to_shutdown = inner.latest_pending.replace(list);
                } else {
                    if inner.started_picking {
                        watch_targets = self.watch_all(&list);
                    }
                    to_shutdown = inner.current.replace(list);
                    inner.last_ready_index = None;
                }
                false
            }
        };
        if empty_with_no_list {
            self.tracker.set(
                ConnectivityState::TransientFailure,
                Some(ChannelError::Unavailable("empty address list from resolver".into())),
                "empty_update",
            );
            return;
        }
        if let Some(mut old) = to_shutdown {
            old.shutdown_all("superseded by address update");
        }
        self.begin_watching(watch_targets);
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
        let (lists, picks) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            (
                (inner.current.take(), inner.latest_pending.take()),
                std::mem::take(&mut inner.pending_picks),
            )
        };
        for list in [lists.0, lists.1].into_iter().flatten() {
            let mut list = list;
            list.shutdown_all("policy shutdown");
        }
        for pick in picks {
            pick.complete(Err(ChannelError::wrap("policy shut down", error.clone())));
        }
        self.tracker
            .set(ConnectivityState::Shutdown, Some(error), "rr_shutdown");
    }
}

impl std::fmt::Debug for RoundRobin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("RoundRobin")
            .field("state", &self.tracker.current())
            .field("pending_picks", &inner.pending_picks.len())
            .field("has_pending_list", &inner.latest_pending.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::channel::ChannelArgs;
    use crate::error::Result;
    use crate::metadata::Metadata;
    use crate::resolver::Address;
    use crate::subchannel::ConnectCallback;
    use crate::transport::{StreamOpBatch, Transport, TransportCall, TransportCallArgs};

    struct NoopCall;

    impl TransportCall for NoopCall {
        fn start_batch(&self, _batch: StreamOpBatch) {}
    }

    struct InlineTransport;

    impl Transport for InlineTransport {
        fn create_call(&self, _args: &TransportCallArgs) -> Result<Box<dyn TransportCall>> {
            Ok(Box::new(NoopCall))
        }
    }

    struct InlineConnector;

    impl Connector for InlineConnector {
        fn connect(&self, _address: &Address, on_done: ConnectCallback) {
            on_done(Ok(Arc::new(InlineTransport)));
        }
    }

    fn build(addresses: &[&str]) -> Arc<RoundRobin> {
        RoundRobin::create(LbPolicyBuildArgs {
            server_name: "rr.test".to_string(),
            connector: Arc::new(InlineConnector),
            serializer: Serializer::new(),
            channel_args: ChannelArgs::default(),
            addresses: addresses
                .iter()
                // Tag each address with itself so picks are identifiable.
                .map(|a| ResolvedAddress::backend(*a).with_token(*a))
                .collect(),
        })
    }

    fn picked_address(policy: &Arc<RoundRobin>) -> Option<String> {
        let completed = Arc::new(AtomicUsize::new(0));
        let completed2 = Arc::clone(&completed);
        let pick = PickState::new(
            Metadata::new(),
            0,
            Box::new(move |_| {
                completed2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let sync = policy.pick(&pick);
        if !sync {
            // Connections complete inline, so queued picks resolve by the
            // time pick() returns.
            assert_eq!(completed.load(Ordering::SeqCst), 1);
        }
        pick.result().user_data
    }

    #[test]
    fn test_picks_rotate_through_ready_subchannels() {
        let policy = build(&["a:1", "b:1"]);
        let order: Vec<_> = (0..4).map(|_| picked_address(&policy).unwrap()).collect();
        assert_eq!(order, vec!["a:1", "b:1", "a:1", "b:1"]);
        assert_eq!(policy.check_connectivity().0, ConnectivityState::Ready);
    }

    #[test]
    fn test_empty_initial_update_is_transient_failure() {
        let policy = build(&[]);
        let (state, error) = policy.check_connectivity();
        assert_eq!(state, ConnectivityState::TransientFailure);
        assert!(error.is_some());
    }

    #[test]
    fn test_empty_update_keeps_current_list() {
        let policy = build(&["a:1"]);
        assert!(picked_address(&policy).is_some());
        policy.update(LbPolicyUpdate { addresses: vec![] });
        assert_eq!(picked_address(&policy).as_deref(), Some("a:1"));
    }

    #[test]
    fn test_update_promotes_pending_list_on_ready() {
        let policy = build(&["a:1"]);
        assert_eq!(picked_address(&policy).as_deref(), Some("a:1"));
        policy.update(LbPolicyUpdate {
            addresses: vec![
                ResolvedAddress::backend("c:1").with_token("c:1"),
                ResolvedAddress::backend("d:1").with_token("d:1"),
            ],
        });
        // The pending list connected inline and was promoted.
        let order: Vec<_> = (0..2).map(|_| picked_address(&policy).unwrap()).collect();
        assert_eq!(order, vec!["c:1", "d:1"]);
    }

    #[test]
    fn test_shutdown_fails_queued_picks() {
        let policy = build(&["a:1"]);
        policy.shutdown(ChannelError::Unavailable("test over".into()));
        assert_eq!(policy.check_connectivity().0, ConnectivityState::Shutdown);
        let pick = PickState::new(Metadata::new(), 0, Box::new(|_| {}));
        // Completed synchronously with no subchannel.
        assert!(policy.pick(&pick));
        assert!(pick.result().connected_subchannel.is_none());
    }

    #[test]
    fn test_cancel_picks_matching_wait_for_ready_mask() {
        use crate::transport::WAIT_FOR_READY;
        // No connections succeed, so picks queue.
        struct SilentConnector;
        impl Connector for SilentConnector {
            fn connect(&self, _address: &Address, _on_done: ConnectCallback) {}
        }
        let policy = RoundRobin::create(LbPolicyBuildArgs {
            server_name: "rr.test".to_string(),
            connector: Arc::new(SilentConnector),
            serializer: Serializer::new(),
            channel_args: ChannelArgs::default(),
            addresses: vec![ResolvedAddress::backend("a:1")],
        });
        let plain_result = Arc::new(Mutex::new(None));
        let plain_result2 = Arc::clone(&plain_result);
        let plain = PickState::new(
            Metadata::new(),
            0,
            Box::new(move |outcome| *plain_result2.lock().unwrap() = Some(outcome)),
        );
        let wfr = PickState::new(Metadata::new(), WAIT_FOR_READY, Box::new(|_| {}));
        assert!(!policy.pick(&plain));
        assert!(!policy.pick(&wfr));
        // Cancel only picks that did not ask to wait for READY.
        policy.cancel_picks_matching(
            WAIT_FOR_READY,
            0,
            ChannelError::Unavailable("transient failure".into()),
        );
        assert!(plain_result.lock().unwrap().as_ref().unwrap().is_err());
        assert!(!wfr.is_completed());
    }
}
