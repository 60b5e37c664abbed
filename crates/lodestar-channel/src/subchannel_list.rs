//! Ordered subchannel lists shared by the list-based LB policies.

use std::sync::Arc;

use tracing::debug;

use crate::connectivity::{ConnectivityState, StateCallback};
use crate::error::ChannelError;
use crate::resolver::ResolvedAddress;
use crate::serializer::Serializer;
use crate::subchannel::{ConnectedSubchannel, Connector, Subchannel, SubchannelOptions};

/// Per-subchannel bookkeeping inside a list.
pub struct SubchannelData {
    /// The subchannel itself.
    pub subchannel: Arc<Subchannel>,
    /// State currently reflected in the list's counters.
    pub prev_state: ConnectivityState,
    /// Latest observed state.
    pub curr_state: ConnectivityState,
    /// Connected facet, held while `Ready`.
    pub connected: Option<Arc<ConnectedSubchannel>>,
    /// Per-address user data (grpclb's serverlist token).
    pub lb_token: Option<String>,
}

/// An ordered list of subchannels with aggregate state counters.
///
/// The counters always sum to the list size; individually shut-down
/// subchannels stay in the list and are counted under `num_shutdown`.
pub struct SubchannelList {
    /// Identifies this list in watcher callbacks, so notifications for a
    /// superseded list can be recognized as stale.
    pub id: u64,
    /// The entries, in resolver order.
    pub subchannels: Vec<SubchannelData>,
    /// Entries in `Ready`.
    pub num_ready: usize,
    /// Entries in `Connecting`.
    pub num_connecting: usize,
    /// Entries in `Idle`.
    pub num_idle: usize,
    /// Entries in `TransientFailure`.
    pub num_transient_failures: usize,
    /// Entries in `Shutdown`.
    pub num_shutdown: usize,
    /// Set when the owning policy has superseded this list.
    pub shutting_down: bool,
}

impl SubchannelList {
    /// Builds a list of idle subchannels over `addresses`.
    pub fn new(
        id: u64,
        addresses: &[ResolvedAddress],
        connector: &Arc<dyn Connector>,
        options: &SubchannelOptions,
    ) -> SubchannelList {
        let subchannels: Vec<SubchannelData> = addresses
            .iter()
            .map(|address| SubchannelData {
                subchannel: Subchannel::new(
                    address.address.clone(),
                    Arc::clone(connector),
                    options.clone(),
                ),
                prev_state: ConnectivityState::Idle,
                curr_state: ConnectivityState::Idle,
                connected: None,
                lb_token: address.lb_token.clone(),
            })
            .collect();
        let num_idle = subchannels.len();
        debug!(list_id = id, size = num_idle, "built subchannel list");
        SubchannelList {
            id,
            subchannels,
            num_ready: 0,
            num_connecting: 0,
            num_idle,
            num_transient_failures: 0,
            num_shutdown: 0,
            shutting_down: false,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.subchannels.len()
    }

    /// Whether the list holds no entries.
    pub fn is_empty(&self) -> bool {
        self.subchannels.is_empty()
    }

    /// Applies a state transition for `index`, moving it between counters.
    pub fn record_transition(&mut self, index: usize, state: ConnectivityState) {
        let sd = &mut self.subchannels[index];
        match sd.prev_state {
            ConnectivityState::Ready => self.num_ready -= 1,
            ConnectivityState::Connecting => self.num_connecting -= 1,
            ConnectivityState::Idle => self.num_idle -= 1,
            ConnectivityState::TransientFailure => self.num_transient_failures -= 1,
            ConnectivityState::Shutdown => self.num_shutdown -= 1,
        }
        sd.prev_state = state;
        sd.curr_state = state;
        match state {
            ConnectivityState::Ready => self.num_ready += 1,
            ConnectivityState::Connecting => self.num_connecting += 1,
            ConnectivityState::Idle => self.num_idle += 1,
            ConnectivityState::TransientFailure => self.num_transient_failures += 1,
            ConnectivityState::Shutdown => self.num_shutdown += 1,
        }
    }

    /// Sum of all counters; equals `len()` at every observation point.
    pub fn counter_sum(&self) -> usize {
        self.num_ready + self.num_connecting + self.num_idle + self.num_transient_failures
            + self.num_shutdown
    }

    /// Marks the list superseded and shuts down every subchannel.
    pub fn shutdown_all(&mut self, reason: &str) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        debug!(list_id = self.id, reason, "shutting down subchannel list");
        for sd in &mut self.subchannels {
            sd.connected = None;
            sd.subchannel
                .shutdown(ChannelError::Unavailable(reason.to_string()));
        }
    }
}

/// Handler invoked on the policy serializer for each subchannel transition:
/// `(list_id, index, new_state, cause)`.
pub type SubchannelStateHandler =
    Arc<dyn Fn(u64, usize, ConnectivityState, Option<ChannelError>) + Send + Sync>;

/// Registers a one-shot watch on `subchannel` that re-enters `serializer`
/// before invoking `handler`. The handler re-registers to keep watching.
pub fn start_watch(
    list_id: u64,
    index: usize,
    subchannel: &Arc<Subchannel>,
    last_seen: ConnectivityState,
    serializer: &Serializer,
    handler: SubchannelStateHandler,
) {
    let serializer = serializer.clone();
    let notify: StateCallback = Box::new(move |state, error| {
        serializer.schedule(move || handler(list_id, index, state, error));
    });
    subchannel.notify_on_state_change(last_seen, notify);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subchannel::ConnectCallback;

    struct NeverConnector;

    impl Connector for NeverConnector {
        fn connect(&self, _address: &crate::resolver::Address, _on_done: ConnectCallback) {}
    }

    fn list_of(n: usize) -> SubchannelList {
        let addresses: Vec<ResolvedAddress> = (0..n)
            .map(|i| ResolvedAddress::backend(format!("10.0.0.{i}:50051")))
            .collect();
        let connector: Arc<dyn Connector> = Arc::new(NeverConnector);
        SubchannelList::new(1, &addresses, &connector, &SubchannelOptions::default())
    }

    #[test]
    fn test_new_list_counts_all_idle() {
        let list = list_of(3);
        assert_eq!(list.num_idle, 3);
        assert_eq!(list.counter_sum(), 3);
    }

    #[test]
    fn test_record_transition_moves_counters() {
        let mut list = list_of(3);
        list.record_transition(0, ConnectivityState::Connecting);
        list.record_transition(1, ConnectivityState::Connecting);
        assert_eq!(list.num_idle, 1);
        assert_eq!(list.num_connecting, 2);
        list.record_transition(0, ConnectivityState::Ready);
        assert_eq!(list.num_connecting, 1);
        assert_eq!(list.num_ready, 1);
        list.record_transition(0, ConnectivityState::Shutdown);
        assert_eq!(list.num_ready, 0);
        assert_eq!(list.num_shutdown, 1);
        assert_eq!(list.counter_sum(), 3);
    }

    #[test]
    fn test_counter_sum_invariant_across_random_walk() {
        let mut list = list_of(5);
        let states = [
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
            ConnectivityState::TransientFailure,
            ConnectivityState::Idle,
            ConnectivityState::Shutdown,
        ];
        for step in 0..100 {
            let index = step % 5;
            let state = states[(step * 7) % states.len()];
            list.record_transition(index, state);
            assert_eq!(list.counter_sum(), 5);
        }
    }

    #[test]
    fn test_shutdown_all_is_idempotent() {
        let mut list = list_of(2);
        list.shutdown_all("superseded");
        assert!(list.shutting_down);
        list.shutdown_all("again");
        for sd in &list.subchannels {
            assert_eq!(sd.subchannel.state(), ConnectivityState::Shutdown);
        }
    }
}
