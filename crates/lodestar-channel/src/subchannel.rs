//! Subchannels: lazily-connecting handles to one backend address.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::debug;

use crate::backoff::{Backoff, BackoffConfig};
use crate::connectivity::{ConnectivityState, ConnectivityTracker, StateCallback};
use crate::error::{ChannelError, Result};
use crate::health::HealthCheckClient;
use crate::resolver::Address;
use crate::retry::RetryState;
use crate::serializer::Serializer;
use crate::timer::TimerHandle;
use crate::transport::{StreamOpBatch, Transport, TransportCall, TransportCallArgs};

/// Callback receiving the outcome of a connection attempt.
pub type ConnectCallback = Box<dyn FnOnce(Result<Arc<dyn Transport>>) + Send + 'static>;

/// Establishes transport connections to addresses.
///
/// This is the factory seam between the channel core and the wire layer;
/// tests plug in in-memory connectors.
pub trait Connector: Send + Sync {
    /// Starts a connection attempt to `address`.
    fn connect(&self, address: &Address, on_done: ConnectCallback);
}

/// Knobs for a subchannel's reconnect behavior.
#[derive(Debug, Clone, Default)]
pub struct SubchannelOptions {
    /// Reconnect back-off schedule.
    pub backoff: BackoffConfig,
    /// When set, a health-watch stream on this service gates READY.
    pub health_check_service: Option<String>,
}

struct SubchannelInner {
    connected: Option<Arc<ConnectedSubchannel>>,
    health: Option<Arc<HealthCheckClient>>,
    backoff: Backoff,
    backoff_started: bool,
    retry_timer: Option<TimerHandle>,
    connect_pending: bool,
    shut_down: bool,
}

/// A reference-counted handle representing a potential connection to one
/// backend address.
///
/// State machine: `Idle → Connecting → Ready` on demand, any state to
/// `TransientFailure` on connect failure with a per-subchannel back-off
/// schedule driving reconnects, and `Shutdown` on explicit release.
pub struct Subchannel {
    me: Weak<Subchannel>,
    address: Address,
    serializer: Serializer,
    tracker: ConnectivityTracker,
    connector: Arc<dyn Connector>,
    options: SubchannelOptions,
    inner: Mutex<SubchannelInner>,
}

impl Subchannel {
    /// Creates an idle subchannel.
    pub fn new(
        address: Address,
        connector: Arc<dyn Connector>,
        options: SubchannelOptions,
    ) -> Arc<Subchannel> {
        Arc::new_cyclic(|me| Subchannel {
            me: me.clone(),
            address,
            serializer: Serializer::new(),
            tracker: ConnectivityTracker::new("subchannel", ConnectivityState::Idle),
            connector,
            inner: Mutex::new(SubchannelInner {
                connected: None,
                health: None,
                backoff: Backoff::new(options.backoff.clone()),
                backoff_started: false,
                retry_timer: None,
                connect_pending: false,
                shut_down: false,
            }),
            options,
        })
    }

    /// The backend address this subchannel targets.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Current connectivity.
    pub fn state(&self) -> ConnectivityState {
        self.tracker.current()
    }

    /// Registers a one-shot connectivity watcher.
    pub fn notify_on_state_change(&self, last_seen: ConnectivityState, notify: StateCallback) {
        self.tracker.notify_on_state_change(last_seen, notify);
    }

    /// The live call-creating facet, present while `Ready`.
    pub fn connected_subchannel(&self) -> Option<Arc<ConnectedSubchannel>> {
        self.inner.lock().unwrap().connected.clone()
    }

    /// Requests a connection attempt if the subchannel is idle.
    pub fn request_connection(&self) {
        let me = self.me.clone();
        self.serializer.schedule(move || {
            if let Some(subchannel) = me.upgrade() {
                subchannel.start_connecting();
            }
        });
    }

    fn start_connecting(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down || inner.connect_pending || inner.connected.is_some() {
                return;
            }
            if self.tracker.current() == ConnectivityState::TransientFailure
                && inner.retry_timer.is_some()
            {
                // Back-off in progress; the timer will reconnect.
                return;
            }
            inner.connect_pending = true;
        }
        self.tracker
            .set(ConnectivityState::Connecting, None, "connect_requested");
        let me = self.me.clone();
        let serializer = self.serializer.clone();
        self.connector.connect(
            &self.address,
            Box::new(move |outcome| {
                serializer.schedule(move || {
                    if let Some(subchannel) = me.upgrade() {
                        subchannel.on_connect_result(outcome);
                    }
                });
            }),
        );
    }

    fn on_connect_result(self: &Arc<Self>, outcome: Result<Arc<dyn Transport>>) {
        match outcome {
            Ok(transport) => {
                let connected = Arc::new(ConnectedSubchannel { transport });
                let health = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.connect_pending = false;
                    if inner.shut_down {
                        return;
                    }
                    inner.backoff.reset();
                    inner.backoff_started = false;
                    inner.connected = Some(Arc::clone(&connected));
                    match &self.options.health_check_service {
                        Some(service) => {
                            let health = HealthCheckClient::new(
                                service.clone(),
                                Arc::clone(&connected),
                                self.serializer.clone(),
                            );
                            inner.health = Some(Arc::clone(&health));
                            Some(health)
                        }
                        None => None,
                    }
                };
                match health {
                    Some(health) => {
                        debug!(address = %self.address, "transport ready, awaiting health check");
                        self.watch_health(&health);
                    }
                    None => {
                        self.tracker
                            .set(ConnectivityState::Ready, None, "transport_ready");
                    }
                }
            }
            Err(error) => {
                let deadline = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.connect_pending = false;
                    if inner.shut_down {
                        return;
                    }
                    let now = Instant::now();
                    if inner.backoff_started {
                        inner.backoff.step(now)
                    } else {
                        inner.backoff_started = true;
                        inner.backoff.begin(now)
                    }
                };
                debug!(address = %self.address, error = %error, "connect failed, backing off");
                self.tracker.set(
                    ConnectivityState::TransientFailure,
                    Some(error),
                    "connect_failed",
                );
                let me = self.me.clone();
                let timer = TimerHandle::at(&self.serializer, deadline, move || {
                    if let Some(subchannel) = me.upgrade() {
                        subchannel.on_retry_timer();
                    }
                });
                self.inner.lock().unwrap().retry_timer = Some(timer);
            }
        }
    }

    fn on_retry_timer(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.retry_timer = None;
            if inner.shut_down {
                return;
            }
            inner.connect_pending = true;
        }
        self.tracker
            .set(ConnectivityState::Connecting, None, "backoff_expired");
        let me = self.me.clone();
        let serializer = self.serializer.clone();
        self.connector.connect(
            &self.address,
            Box::new(move |outcome| {
                serializer.schedule(move || {
                    if let Some(subchannel) = me.upgrade() {
                        subchannel.on_connect_result(outcome);
                    }
                });
            }),
        );
    }

    fn watch_health(self: &Arc<Self>, health: &Arc<HealthCheckClient>) {
        let me = self.me.clone();
        let serializer = self.serializer.clone();
        health.notify_on_state_change(
            ConnectivityState::Connecting,
            Box::new(move |state, error| {
                serializer.schedule(move || {
                    if let Some(subchannel) = me.upgrade() {
                        subchannel.on_health_changed(state, error);
                    }
                });
            }),
        );
    }

    fn on_health_changed(self: &Arc<Self>, state: ConnectivityState, error: Option<ChannelError>) {
        let health = {
            let inner = self.inner.lock().unwrap();
            if inner.shut_down || inner.connected.is_none() {
                return;
            }
            inner.health.clone()
        };
        match state {
            ConnectivityState::Ready => {
                self.tracker
                    .set(ConnectivityState::Ready, None, "health_serving");
            }
            ConnectivityState::TransientFailure => {
                self.tracker.set(
                    ConnectivityState::TransientFailure,
                    error,
                    "health_not_serving",
                );
            }
            _ => {}
        }
        if let Some(health) = health {
            let me = self.me.clone();
            let serializer = self.serializer.clone();
            health.notify_on_state_change(
                state,
                Box::new(move |next, error| {
                    serializer.schedule(move || {
                        if let Some(subchannel) = me.upgrade() {
                            subchannel.on_health_changed(next, error);
                        }
                    });
                }),
            );
        }
    }

    /// Releases the subchannel: cancels any reconnect timer, orphans the
    /// health watch, drops the connection, and publishes `Shutdown`.
    pub fn shutdown(&self, reason: ChannelError) {
        let (timer, health) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.connected = None;
            (inner.retry_timer.take(), inner.health.take())
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(health) = health {
            health.orphan();
        }
        self.tracker
            .set(ConnectivityState::Shutdown, Some(reason), "subchannel_shutdown");
    }
}

impl std::fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subchannel")
            .field("address", &self.address)
            .field("state", &self.tracker.current())
            .finish()
    }
}

/// The live transport wrapper exposed while a subchannel is `Ready`.
pub struct ConnectedSubchannel {
    transport: Arc<dyn Transport>,
}

impl ConnectedSubchannel {
    /// Creates a call on the underlying transport.
    ///
    /// When `with_retry_state` is set, the call carries the per-attempt
    /// bookkeeping block used by the retry orchestrator.
    pub fn create_call(
        &self,
        args: &TransportCallArgs,
        with_retry_state: bool,
    ) -> Result<Arc<SubchannelCall>> {
        let call = self.transport.create_call(args)?;
        Ok(Arc::new(SubchannelCall {
            call,
            retry_state: with_retry_state.then(|| Mutex::new(RetryState::default())),
        }))
    }
}

impl std::fmt::Debug for ConnectedSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedSubchannel").finish()
    }
}

/// One call attempt on a connected subchannel, with its optional retry
/// bookkeeping attached as parent data.
pub struct SubchannelCall {
    call: Box<dyn TransportCall>,
    retry_state: Option<Mutex<RetryState>>,
}

impl SubchannelCall {
    /// Submits a batch to the transport call.
    pub fn start_batch(&self, batch: StreamOpBatch) {
        self.call.start_batch(batch);
    }

    /// Per-attempt retry bookkeeping; present iff the call was created with
    /// retries enabled.
    pub fn retry_state(&self) -> Option<&Mutex<RetryState>> {
        self.retry_state.as_ref()
    }
}

impl std::fmt::Debug for SubchannelCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubchannelCall")
            .field("retries_enabled", &self.retry_state.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoopCall;

    impl TransportCall for NoopCall {
        fn start_batch(&self, _batch: StreamOpBatch) {}
    }

    struct NoopTransport;

    impl Transport for NoopTransport {
        fn create_call(&self, _args: &TransportCallArgs) -> Result<Box<dyn TransportCall>> {
            Ok(Box::new(NoopCall))
        }
    }

    #[derive(Default)]
    struct FlakyConnector {
        refuse: Mutex<HashSet<Address>>,
        attempts: AtomicUsize,
    }

    impl Connector for FlakyConnector {
        fn connect(&self, address: &Address, on_done: ConnectCallback) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.lock().unwrap().contains(address) {
                on_done(Err(ChannelError::Unavailable(format!(
                    "connection refused to {address}"
                ))));
            } else {
                on_done(Ok(Arc::new(NoopTransport)));
            }
        }
    }

    #[test]
    fn test_connects_on_demand() {
        let connector = Arc::new(FlakyConnector::default());
        let subchannel = Subchannel::new(
            "10.0.0.1:50051".to_string(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            SubchannelOptions::default(),
        );
        assert_eq!(subchannel.state(), ConnectivityState::Idle);
        assert!(subchannel.connected_subchannel().is_none());
        subchannel.request_connection();
        assert_eq!(subchannel.state(), ConnectivityState::Ready);
        assert!(subchannel.connected_subchannel().is_some());
        // A second request is a no-op once connected.
        subchannel.request_connection();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_backoff() {
        let connector = Arc::new(FlakyConnector::default());
        connector
            .refuse
            .lock()
            .unwrap()
            .insert("10.0.0.2:50051".to_string());
        let subchannel = Subchannel::new(
            "10.0.0.2:50051".to_string(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            SubchannelOptions::default(),
        );
        subchannel.request_connection();
        assert_eq!(subchannel.state(), ConnectivityState::TransientFailure);
        // Accept before the back-off expires; the retry timer reconnects.
        connector.refuse.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(subchannel.state(), ConnectivityState::Ready);
        assert!(connector.attempts.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let connector = Arc::new(FlakyConnector::default());
        let subchannel = Subchannel::new(
            "10.0.0.3:50051".to_string(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            SubchannelOptions::default(),
        );
        subchannel.request_connection();
        subchannel.shutdown(ChannelError::Unavailable("released".into()));
        assert_eq!(subchannel.state(), ConnectivityState::Shutdown);
        assert!(subchannel.connected_subchannel().is_none());
        subchannel.request_connection();
        assert_eq!(subchannel.state(), ConnectivityState::Shutdown);
    }

    #[test]
    fn test_create_call_with_retry_state() {
        let connector = Arc::new(FlakyConnector::default());
        let subchannel = Subchannel::new(
            "10.0.0.4:50051".to_string(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            SubchannelOptions::default(),
        );
        subchannel.request_connection();
        let connected = subchannel.connected_subchannel().unwrap();
        let args = TransportCallArgs {
            path: "/EchoService/Echo".to_string(),
            start_time: Instant::now(),
            deadline: None,
        };
        let plain = connected.create_call(&args, false).unwrap();
        assert!(plain.retry_state().is_none());
        let retriable = connected.create_call(&args, true).unwrap();
        assert!(retriable.retry_state().is_some());
    }
}
