//! The pick-first LB policy: the default when the resolver names none.
//!
//! Connects through the resolved addresses and routes every pick to the first
//! subchannel that reports READY; the remaining subchannels are released once
//! a selection is made.

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
use crate::subchannel::{ConnectedSubchannel, Connector, Subchannel, SubchannelOptions};
use crate::subchannel_list::{start_watch, SubchannelList, SubchannelStateHandler};

struct PfInner {
    current: Option<SubchannelList>,
    latest_pending: Option<SubchannelList>,
    selected: Option<(usize, Arc<ConnectedSubchannel>)>,
    pending_picks: Vec<Arc<PickState>>,
    started_picking: bool,
    shut_down: bool,
    next_list_id: u64,
}

/// Pick-first policy: one selected subchannel serves all picks.
pub struct PickFirst {
    me: Weak<PickFirst>,
    serializer: Serializer,
    connector: Arc<dyn Connector>,
    subchannel_options: SubchannelOptions,
    tracker: ConnectivityTracker,
    reresolution: Mutex<Option<ReresolutionHook>>,
    inner: Mutex<PfInner>,
}

impl PickFirst {
    /// Builds the policy and applies the initial address set.
    pub fn create(args: LbPolicyBuildArgs) -> Arc<PickFirst> {
        let policy = Arc::new_cyclic(|me| PickFirst {
            me: me.clone(),
            serializer: args.serializer.clone(),
            connector: Arc::clone(&args.connector),
            subchannel_options: SubchannelOptions {
                backoff: args.channel_args.subchannel_backoff.clone(),
                health_check_service: args.channel_args.health_check_service.clone(),
            },
            tracker: ConnectivityTracker::new("pick_first", ConnectivityState::Idle),
            reresolution: Mutex::new(None),
            inner: Mutex::new(PfInner {
                current: None,
                latest_pending: None,
                selected: None,
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

    fn watch_all(list: &SubchannelList) -> Vec<(u64, usize, Arc<Subchannel>)> {
        list.subchannels
            .iter()
            .enumerate()
            .map(|(index, sd)| (list.id, index, Arc::clone(&sd.subchannel)))
            .collect()
    }

    fn on_subchannel_state(
        self: &Arc<Self>,
        list_id: u64,
        index: usize,
        state: ConnectivityState,
        error: Option<ChannelError>,
    ) {
        let mut to_shutdown: Option<SubchannelList> = None;
        let mut release: Vec<Arc<Subchannel>> = Vec::new();
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
            match state {
                ConnectivityState::Ready => {
                    if in_pending {
                        info!(list_id, "promoting pending list on first READY subchannel");
                        to_shutdown = inner.current.take();
                        inner.current = inner.latest_pending.take();
                    }
                    let list = inner.current.as_ref().unwrap();
                    if let Some(connected) = list.subchannels[index].connected.clone() {
                        inner.selected = Some((index, Arc::clone(&connected)));
                        // Release every other subchannel in the list.
                        release = list
                            .subchannels
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| *i != index)
                            .map(|(_, sd)| Arc::clone(&sd.subchannel))
                            .collect();
                        for pick in inner.pending_picks.drain(..) {
                            pick.set_result(PickResult {
                                connected_subchannel: Some(Arc::clone(&connected)),
                                user_data: list.subchannels[index].lb_token.clone(),
                                client_stats: None,
                            });
                            completions.push(pick);
                        }
                        aggregate = Some((ConnectivityState::Ready, None, false));
                    }
                }
                _ => {
                    let was_selected =
                        in_current && inner.selected.as_ref().is_some_and(|(i, _)| *i == index);
                    if was_selected {
                        debug!(index, "selected subchannel left READY");
                        inner.selected = None;
                    }
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
                        aggregate =
                            Some((ConnectivityState::TransientFailure, error.clone(), false));
                    }
                }
            }
        }
        if let Some(mut old) = to_shutdown {
            old.shutdown_all("superseded by promoted list");
        }
        for subchannel in release {
            subchannel.shutdown(ChannelError::Unavailable("not selected".into()));
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
                .map(Self::watch_all)
                .unwrap_or_default()
        };
        self.begin_watching(targets);
    }
}

impl LbPolicy for PickFirst {
    fn name(&self) -> &'static str {
        "pick_first"
    }

    fn pick(&self, pick: &Arc<PickState>) -> bool {
        let need_start = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return true;
            }
            if let Some((index, connected)) = inner.selected.clone() {
                let token = inner
                    .current
                    .as_ref()
                    .and_then(|list| list.subchannels.get(index))
                    .and_then(|sd| sd.lb_token.clone());
                pick.set_result(PickResult {
                    connected_subchannel: Some(connected),
                    user_data: token,
                    client_stats: None,
                });
                return true;
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
        let connected = self.inner.lock().unwrap().selected.is_some();
        if connected {
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
                if inner.started_picking && inner.selected.is_some() {
                    // Keep serving from the selection until the pending list
                    // produces a READY subchannel.
                    watch_targets = Self::watch_all(&list);
                    to_shutdown = inner.latest_pending.replace(list);
                } else {
                    if inner.started_picking {
                        watch_targets = Self::watch_all(&list);
                    }
                    inner.selected = None;
                    to_shutdown = inner.current.replace(list);
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
            inner.selected = None;
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
            .set(ConnectivityState::Shutdown, Some(error), "pf_shutdown");
    }
}

impl std::fmt::Debug for PickFirst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("PickFirst")
            .field("state", &self.tracker.current())
            .field("selected", &inner.selected.as_ref().map(|(i, _)| *i))
            .field("pending_picks", &inner.pending_picks.len())
            .finish()
    }
}
