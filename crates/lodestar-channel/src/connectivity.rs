//! Connectivity state tracking for channels, subchannels, and LB policies.

use std::sync::Mutex;

use tracing::debug;

use crate::error::ChannelError;

/// Connectivity of a channel or subchannel.
///
/// `Shutdown` is terminal: a tracker that reaches it refuses to move off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No connection attempt is in progress.
    Idle,
    /// A connection attempt is in progress.
    Connecting,
    /// A connection is established and usable.
    Ready,
    /// The last connection attempt failed; a retry is pending.
    TransientFailure,
    /// The entity has been shut down.
    Shutdown,
}

impl ConnectivityState {
    /// Lowercase name for logging.
    pub fn name(self) -> &'static str {
        match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient_failure",
            ConnectivityState::Shutdown => "shutdown",
        }
    }
}

/// Callback invoked with the new state and its cause, if any.
pub type StateCallback = Box<dyn FnOnce(ConnectivityState, Option<ChannelError>) + Send + 'static>;

struct Watcher {
    last_seen: ConnectivityState,
    notify: StateCallback,
}

struct TrackerInner {
    state: ConnectivityState,
    error: Option<ChannelError>,
    watchers: Vec<Watcher>,
}

/// Publishes connectivity transitions to a set of one-shot watchers.
///
/// All mutations must run within the owning entity's serializer; watcher
/// callbacks are invoked after the internal lock is released, so a callback
/// may safely re-register.
pub struct ConnectivityTracker {
    name: &'static str,
    inner: Mutex<TrackerInner>,
}

impl ConnectivityTracker {
    /// Creates a tracker in `initial` state. `name` tags log lines.
    pub fn new(name: &'static str, initial: ConnectivityState) -> ConnectivityTracker {
        ConnectivityTracker {
            name,
            inner: Mutex::new(TrackerInner {
                state: initial,
                error: None,
                watchers: Vec::new(),
            }),
        }
    }

    /// The current state.
    pub fn current(&self) -> ConnectivityState {
        self.inner.lock().unwrap().state
    }

    /// The current state together with its cause error.
    pub fn current_with_error(&self) -> (ConnectivityState, Option<ChannelError>) {
        let inner = self.inner.lock().unwrap();
        (inner.state, inner.error.clone())
    }

    /// Sets the state and fires every watcher whose observed state differs.
    ///
    /// `Shutdown` is absorbing: once reached, later `set` calls are permitted
    /// but ignored.
    pub fn set(&self, state: ConnectivityState, error: Option<ChannelError>, reason: &str) {
        let fired = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ConnectivityState::Shutdown && state != ConnectivityState::Shutdown {
                return;
            }
            debug!(
                tracker = self.name,
                from = inner.state.name(),
                to = state.name(),
                reason,
                "connectivity changed"
            );
            inner.state = state;
            inner.error = error.clone();
            let mut fired = Vec::new();
            let mut kept = Vec::new();
            for watcher in inner.watchers.drain(..) {
                if watcher.last_seen != state {
                    fired.push(watcher);
                } else {
                    kept.push(watcher);
                }
            }
            inner.watchers = kept;
            fired
        };
        for watcher in fired {
            (watcher.notify)(state, error.clone());
        }
    }

    /// Registers a one-shot watcher.
    ///
    /// If the current state already differs from `last_seen`, the callback is
    /// invoked immediately; otherwise it fires on the next differing `set`.
    pub fn notify_on_state_change(&self, last_seen: ConnectivityState, notify: StateCallback) {
        let mut notify = Some(notify);
        let immediate = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != last_seen {
                Some((inner.state, inner.error.clone()))
            } else {
                inner.watchers.push(Watcher {
                    last_seen,
                    notify: notify.take().unwrap(),
                });
                None
            }
        };
        if let Some((state, error)) = immediate {
            (notify.take().unwrap())(state, error);
        }
    }

    /// Number of registered watchers.
    pub fn num_watchers(&self) -> usize {
        self.inner.lock().unwrap().watchers.len()
    }
}

impl std::fmt::Debug for ConnectivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ConnectivityTracker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}
