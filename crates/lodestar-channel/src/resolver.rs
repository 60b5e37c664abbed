//! Name resolution contract and the injectable fake resolver.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{ChannelError, Result};

/// A backend or balancer address. Addresses are opaque strings interpreted by
/// the connector.
pub type Address = String;

/// One resolved address with its balancer attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    /// The address to connect to.
    pub address: Address,
    /// True when this address is a load balancer rather than a backend.
    pub is_balancer: bool,
    /// Balancer display name, when `is_balancer`.
    pub balancer_name: Option<String>,
    /// Per-address user data; grpclb carries the serverlist token here.
    pub lb_token: Option<String>,
}

impl ResolvedAddress {
    /// A plain backend address.
    pub fn backend(address: impl Into<Address>) -> ResolvedAddress {
        ResolvedAddress {
            address: address.into(),
            is_balancer: false,
            balancer_name: None,
            lb_token: None,
        }
    }

    /// A balancer address.
    pub fn balancer(address: impl Into<Address>, name: impl Into<String>) -> ResolvedAddress {
        ResolvedAddress {
            address: address.into(),
            is_balancer: true,
            balancer_name: Some(name.into()),
            lb_token: None,
        }
    }

    /// Attaches a load-balance token.
    pub fn with_token(mut self, token: impl Into<String>) -> ResolvedAddress {
        self.lb_token = Some(token.into());
        self
    }
}

/// One resolution outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolverResult {
    /// Resolved addresses, in priority order.
    pub addresses: Vec<ResolvedAddress>,
    /// LB policy requested by the resolver, if any.
    pub lb_policy_name: Option<String>,
    /// Raw service-config JSON, if the resolver supplies one.
    pub service_config_json: Option<String>,
}

impl ResolverResult {
    /// Whether any address is marked as a balancer.
    pub fn has_balancer_address(&self) -> bool {
        self.addresses.iter().any(|a| a.is_balancer)
    }
}

/// Callback receiving one resolution outcome.
pub type ResolverCallback = Box<dyn FnOnce(Result<ResolverResult>) + Send + 'static>;

/// Produces address sets for a channel.
///
/// `next` completes its callback at most once per invocation. `shutdown` must
/// cause an outstanding `next` to complete promptly with an error.
pub trait Resolver: Send + Sync {
    /// Requests the next resolution result.
    fn next(&self, on_result: ResolverCallback);

    /// Hints that the channel saw an error and re-resolution may help.
    fn channel_saw_error(&self) {}

    /// Shuts the resolver down, failing any outstanding `next`.
    fn shutdown(&self);
}

struct FakeResolverState {
    queued: VecDeque<Result<ResolverResult>>,
    waiting: Option<ResolverCallback>,
    shut_down: bool,
    saw_error_count: usize,
}

/// Hand-driven resolver used by tests and by grpclb's balancer channel.
///
/// Results pushed through the [`FakeResolverGenerator`] are delivered to the
/// oldest outstanding `next` call, or queued until one arrives.
pub struct FakeResolver {
    state: Arc<Mutex<FakeResolverState>>,
}

/// Shared handle that injects results into a [`FakeResolver`].
#[derive(Clone)]
pub struct FakeResolverGenerator {
    state: Arc<Mutex<FakeResolverState>>,
}

impl FakeResolverGenerator {
    /// Creates a generator with no resolver attached yet.
    pub fn new() -> FakeResolverGenerator {
        FakeResolverGenerator {
            state: Arc::new(Mutex::new(FakeResolverState {
                queued: VecDeque::new(),
                waiting: None,
                shut_down: false,
                saw_error_count: 0,
            })),
        }
    }

    /// Builds the resolver fed by this generator.
    pub fn resolver(&self) -> Arc<FakeResolver> {
        Arc::new(FakeResolver {
            state: Arc::clone(&self.state),
        })
    }

    /// Delivers a successful result.
    pub fn set_result(&self, result: ResolverResult) {
        self.push(Ok(result));
    }

    /// Delivers a resolution error.
    pub fn set_error(&self, error: ChannelError) {
        self.push(Err(error));
    }

    /// Number of times the channel hinted re-resolution.
    pub fn saw_error_count(&self) -> usize {
        self.state.lock().unwrap().saw_error_count
    }

    fn push(&self, outcome: Result<ResolverResult>) {
        let waiting = {
            let mut state = self.state.lock().unwrap();
            if state.shut_down {
                return;
            }
            match state.waiting.take() {
                Some(waiting) => Some(waiting),
                None => {
                    state.queued.push_back(outcome.clone());
                    None
                }
            }
        };
        if let Some(waiting) = waiting {
            waiting(outcome);
        }
    }
}

impl Default for FakeResolverGenerator {
    fn default() -> Self {
        FakeResolverGenerator::new()
    }
}

impl Resolver for FakeResolver {
    fn next(&self, on_result: ResolverCallback) {
        let immediate = {
            let mut state = self.state.lock().unwrap();
            if state.shut_down {
                Some(Err(ChannelError::Unavailable("resolver shut down".into())))
            } else if let Some(queued) = state.queued.pop_front() {
                Some(queued)
            } else {
                debug_assert!(state.waiting.is_none(), "overlapping next() calls");
                state.waiting = Some(on_result);
                return;
            }
        };
        if let Some(outcome) = immediate {
            on_result(outcome);
        }
    }

    fn channel_saw_error(&self) {
        self.state.lock().unwrap().saw_error_count += 1;
    }

    fn shutdown(&self) {
        let waiting = {
            let mut state = self.state.lock().unwrap();
            state.shut_down = true;
            state.queued.clear();
            state.waiting.take()
        };
        if let Some(waiting) = waiting {
            waiting(Err(ChannelError::Unavailable("resolver shut down".into())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(addr: &str) -> ResolverResult {
        ResolverResult {
            addresses: vec![ResolvedAddress::backend(addr)],
            ..Default::default()
        }
    }

    #[test]
    fn test_queued_result_delivered_to_next() {
        let generator = FakeResolverGenerator::new();
        let resolver = generator.resolver();
        generator.set_result(result_with("10.0.0.1:50051"));
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        resolver.next(Box::new(move |r| *seen2.lock().unwrap() = Some(r)));
        let seen = seen.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(seen.addresses[0].address, "10.0.0.1:50051");
    }

    #[test]
    fn test_waiting_next_woken_by_set_result() {
        let generator = FakeResolverGenerator::new();
        let resolver = generator.resolver();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        resolver.next(Box::new(move |r| *seen2.lock().unwrap() = Some(r)));
        assert!(seen.lock().unwrap().is_none());
        generator.set_result(result_with("b"));
        assert!(seen.lock().unwrap().as_ref().unwrap().is_ok());
    }

    #[test]
    fn test_shutdown_fails_outstanding_next() {
        let generator = FakeResolverGenerator::new();
        let resolver = generator.resolver();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        resolver.next(Box::new(move |r| *seen2.lock().unwrap() = Some(r)));
        resolver.shutdown();
        assert!(seen.lock().unwrap().as_ref().unwrap().is_err());
        // A next() after shutdown fails immediately.
        let late = Arc::new(Mutex::new(None));
        let late2 = Arc::clone(&late);
        resolver.next(Box::new(move |r| *late2.lock().unwrap() = Some(r)));
        assert!(late.lock().unwrap().as_ref().unwrap().is_err());
    }

    #[test]
    fn test_has_balancer_address() {
        let mut result = result_with("backend");
        assert!(!result.has_balancer_address());
        result
            .addresses
            .push(ResolvedAddress::balancer("lb.example.com:80", "lb"));
        assert!(result.has_balancer_address());
    }
}
