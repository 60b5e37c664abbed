//! The load-balancing policy contract and pick plumbing.
//!
//! A policy receives address updates, manages subchannels, and answers picks.
//! Every operation runs inside the policy's serializer; a pick may complete
//! synchronously (returning `true` with the outputs populated) or
//! asynchronously (returning `false` and firing the completion callback
//! later).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::balancer::ClientStats;
use crate::channel::ChannelArgs;
use crate::connectivity::{ConnectivityState, StateCallback};
use crate::error::{ChannelError, Result};
use crate::metadata::Metadata;
use crate::resolver::ResolvedAddress;
use crate::serializer::Serializer;
use crate::subchannel::{ConnectedSubchannel, Connector};

/// Completion callback for an asynchronous pick.
pub type PickCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Acknowledgement callback for a channel-level ping.
pub type AckCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Hook a policy invokes to ask the channel for re-resolution.
pub type ReresolutionHook = Arc<dyn Fn() + Send + Sync>;

/// Outputs of a completed pick.
#[derive(Clone, Default)]
pub struct PickResult {
    /// The chosen connected subchannel; `None` for a server-directed drop.
    pub connected_subchannel: Option<Arc<ConnectedSubchannel>>,
    /// Per-address user data; grpclb carries the serverlist token here.
    pub user_data: Option<String>,
    /// Client-load-reporting handle to attach to the call, when enabled.
    pub client_stats: Option<Arc<ClientStats>>,
}

/// The input/output record crossing the call/LB boundary for one pick.
///
/// The call lends its initial metadata for the duration of the pick so the
/// policy can attach entries (grpclb's LB token); the call takes it back when
/// the pick completes.
pub struct PickState {
    /// `WAIT_FOR_READY*` flag bits from the call's initial metadata.
    pub initial_metadata_flags: u32,
    metadata: Mutex<Option<Metadata>>,
    on_complete: Mutex<Option<PickCallback>>,
    result: Mutex<PickResult>,
    completed: AtomicBool,
}

impl PickState {
    /// Creates a pick carrying the call's initial metadata and completion
    /// callback.
    pub fn new(
        metadata: Metadata,
        initial_metadata_flags: u32,
        on_complete: PickCallback,
    ) -> Arc<PickState> {
        Arc::new(PickState {
            initial_metadata_flags,
            metadata: Mutex::new(Some(metadata)),
            on_complete: Mutex::new(Some(on_complete)),
            result: Mutex::new(PickResult::default()),
            completed: AtomicBool::new(false),
        })
    }

    /// Mutates the lent initial metadata in place.
    pub fn with_metadata(&self, f: impl FnOnce(&mut Metadata)) {
        if let Some(metadata) = self.metadata.lock().unwrap().as_mut() {
            f(metadata);
        }
    }

    /// Takes the lent metadata back out of the pick.
    pub fn take_metadata(&self) -> Option<Metadata> {
        self.metadata.lock().unwrap().take()
    }

    /// Stores the pick outputs.
    pub fn set_result(&self, result: PickResult) {
        *self.result.lock().unwrap() = result;
    }

    /// Reads the pick outputs.
    pub fn result(&self) -> PickResult {
        self.result.lock().unwrap().clone()
    }

    /// Swaps the completion callback, returning the previous one. Policies
    /// that interpose on completion (grpclb) use this to wrap the original.
    pub fn swap_on_complete(&self, replacement: PickCallback) -> Option<PickCallback> {
        self.on_complete.lock().unwrap().replace(replacement)
    }

    /// Completes an asynchronous pick, invoking the callback at most once.
    pub fn complete(&self, outcome: Result<()>) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(on_complete) = self.on_complete.lock().unwrap().take() {
            on_complete(outcome);
        }
    }

    /// Whether `complete` has already fired.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PickState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickState")
            .field("flags", &self.initial_metadata_flags)
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Arguments for building a policy.
pub struct LbPolicyBuildArgs {
    /// Server name the channel targets, for balancer calls.
    pub server_name: String,
    /// Transport factory shared with the channel.
    pub connector: Arc<dyn Connector>,
    /// Serializer the policy's operations run on.
    pub serializer: Serializer,
    /// Channel-level knobs.
    pub channel_args: ChannelArgs,
    /// Initial resolved address set.
    pub addresses: Vec<ResolvedAddress>,
}

/// An address update delivered to a live policy.
#[derive(Debug, Clone)]
pub struct LbPolicyUpdate {
    /// The new resolved address set.
    pub addresses: Vec<ResolvedAddress>,
}

/// A load-balancing policy.
pub trait LbPolicy: Send + Sync {
    /// Registry name of this policy.
    fn name(&self) -> &'static str;

    /// Attempts a pick. Returns `true` when completed synchronously with the
    /// outputs stored on `pick`; otherwise the pick is queued and the
    /// completion callback fires later.
    fn pick(&self, pick: &Arc<PickState>) -> bool;

    /// Cancels one queued pick.
    fn cancel_pick(&self, pick: &Arc<PickState>, error: ChannelError);

    /// Cancels every queued pick whose metadata flags satisfy
    /// `(flags & mask) == eq`.
    fn cancel_picks_matching(&self, mask: u32, eq: u32, error: ChannelError);

    /// Acknowledges a channel ping through a connected subchannel.
    fn ping_one(&self, on_ack: AckCallback);

    /// Starts connecting without waiting for the first pick.
    fn exit_idle(&self);

    /// Current aggregate connectivity with its cause.
    fn check_connectivity(&self) -> (ConnectivityState, Option<ChannelError>);

    /// Registers a one-shot aggregate-connectivity watcher.
    fn notify_on_state_change(&self, last_seen: ConnectivityState, notify: StateCallback);

    /// Applies a new address set.
    fn update(&self, update: LbPolicyUpdate);

    /// Moves queued picks onto `new_policy` during a policy swap.
    fn hand_off_pending_picks(&self, new_policy: &Arc<dyn LbPolicy>);

    /// Installs the hook used to request re-resolution.
    fn set_reresolution_hook(&self, hook: ReresolutionHook);

    /// Shuts the policy down, failing queued picks.
    fn shutdown(&self, error: ChannelError);
}

/// Instantiates a policy by registry name, or `None` for an unknown name.
pub fn create_lb_policy(name: &str, args: LbPolicyBuildArgs) -> Option<Arc<dyn LbPolicy>> {
    match name {
        "pick_first" => Some(crate::pick_first::PickFirst::create(args)),
        "round_robin" => Some(crate::round_robin::RoundRobin::create(args)),
        "grpclb" => Some(crate::grpclb::GrpcLb::create(args)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_completes_at_most_once() {
        let fired = Arc::new(Mutex::new(0));
        let fired2 = Arc::clone(&fired);
        let pick = PickState::new(
            Metadata::new(),
            0,
            Box::new(move |_| *fired2.lock().unwrap() += 1),
        );
        pick.complete(Ok(()));
        pick.complete(Err(ChannelError::Cancelled("late".into())));
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(pick.is_completed());
    }

    #[test]
    fn test_metadata_lending_round_trip() {
        let mut metadata = Metadata::new();
        metadata.add("k", "v");
        let pick = PickState::new(metadata, 0, Box::new(|_| {}));
        pick.with_metadata(|md| md.add("lb-token", "t1"));
        let taken = pick.take_metadata().unwrap();
        assert_eq!(taken.get("lb-token"), Some("t1"));
        // Lending is one-shot until the metadata is put back.
        assert!(pick.take_metadata().is_none());
    }

    #[test]
    fn test_swap_on_complete_wraps_original() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let pick = PickState::new(
            Metadata::new(),
            0,
            Box::new(move |_| log2.lock().unwrap().push("original")),
        );
        let original = pick.swap_on_complete(Box::new(|_| {})).unwrap();
        let log3 = Arc::clone(&log);
        pick.swap_on_complete(Box::new(move |outcome| {
            log3.lock().unwrap().push("wrapper");
            original(outcome);
        }));
        pick.complete(Ok(()));
        assert_eq!(*log.lock().unwrap(), vec!["wrapper", "original"]);
    }

    #[test]
    fn test_result_defaults_to_drop_shape() {
        let pick = PickState::new(Metadata::new(), 0, Box::new(|_| {}));
        let result = pick.result();
        assert!(result.connected_subchannel.is_none());
        assert!(result.user_data.is_none());
        assert!(result.client_stats.is_none());
    }
}
