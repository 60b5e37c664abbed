#![warn(missing_docs)]

//! Lodestar client-channel core: the subsystem between an application's call
//! surface and the wire transport.
//!
//! This crate turns a logical RPC into a concrete, policy-driven,
//! retry-aware, load-balanced call on a selected backend connection:
//! - Name-resolution integration and service-config-driven per-method policy
//! - LB policies (`pick_first`, `round_robin`, `grpclb`) with connectivity
//!   tracking and per-call subchannel picks
//! - A per-subchannel streaming health-check client
//! - A retry orchestrator that transparently replays op batches across
//!   attempts under a token-bucket throttle
//!
//! Transports, resolvers, and timers are consumed through narrow interfaces;
//! wire framing, TLS, and credentials live elsewhere in the Lodestar runtime.

pub mod backoff;
pub mod balancer;
pub mod bytestream;
pub mod call;
pub mod channel;
pub mod connectivity;
pub mod error;
pub mod grpclb;
pub mod health;
pub mod lb_policy;
pub mod metadata;
pub mod pick_first;
pub mod resolver;
pub mod retry;
pub mod round_robin;
pub mod serializer;
pub mod service_config;
pub mod subchannel;
pub mod subchannel_list;
pub mod throttle;
pub mod timer;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use call::{Call, CallOptions};
pub use channel::{Channel, ChannelArgs, DEFAULT_PER_RPC_RETRY_BUFFER_SIZE};
pub use connectivity::{ConnectivityState, ConnectivityTracker};
pub use error::{ChannelError, Result, StatusCode};
pub use lb_policy::{LbPolicy, PickResult, PickState};
pub use metadata::Metadata;
pub use resolver::{
    FakeResolver, FakeResolverGenerator, ResolvedAddress, Resolver, ResolverResult,
};
pub use service_config::{MethodParams, RetryPolicyConfig, ServiceConfig};
pub use subchannel::{ConnectedSubchannel, Connector, Subchannel, SubchannelCall};
pub use throttle::{RetryThrottle, RetryThrottleMap};
pub use transport::{
    BatchResult, RecvInitialMetadata, SendInitialMetadata, StreamOpBatch, Transport,
    TransportCall, TransportCallArgs,
};
