//! Typed messages and client-side load accounting for the balancer stream.
//!
//! The wire schema is deliberately abstract: requests and responses are plain
//! structs encoded as JSON on the balancer call's message stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};

/// Request path of the balancer streaming call.
pub const BALANCE_LOAD_PATH: &str = "/lodestar.lb.v1.LoadBalancer/BalanceLoad";

/// First request on a balancer stream, naming the target server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialBalanceRequest {
    /// Server name the channel is resolving.
    pub name: String,
}

/// Per-token drop counts in a load report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropEntry {
    /// The serverlist token whose picks were dropped.
    pub load_balance_token: String,
    /// Number of drops since the previous report.
    pub num_calls: u64,
}

/// Accumulated client-side load counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatsReport {
    /// Calls started since the previous report.
    pub num_calls_started: u64,
    /// Calls finished since the previous report.
    pub num_calls_finished: u64,
    /// Finished calls that never reached a backend.
    pub num_calls_finished_with_client_failed_to_send: u64,
    /// Finished calls known to have been received by a backend.
    pub num_calls_finished_known_received: u64,
    /// Server-directed drops by token.
    pub calls_finished_with_drop: Vec<DropEntry>,
}

impl ClientStatsReport {
    /// Whether every counter is zero.
    pub fn is_zero(&self) -> bool {
        self.num_calls_started == 0
            && self.num_calls_finished == 0
            && self.num_calls_finished_with_client_failed_to_send == 0
            && self.num_calls_finished_known_received == 0
            && self.calls_finished_with_drop.is_empty()
    }
}

/// A message on the client-to-balancer direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceRequest {
    /// Present on the first message only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<InitialBalanceRequest>,
    /// Present on load-report messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_stats: Option<ClientStatsReport>,
}

/// First response on a balancer stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialBalanceResponse {
    /// Interval between client load reports; zero disables reporting.
    pub client_stats_report_interval_ms: u64,
}

/// One serverlist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Backend address; ignored for drop entries.
    pub address: String,
    /// Token to attach to picks routed at this entry.
    pub load_balance_token: String,
    /// When set, picks landing on this entry must be dropped.
    pub drop: bool,
}

/// A balancer-supplied list of backends and drop directives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerList {
    /// Entries in balancer order.
    pub servers: Vec<ServerEntry>,
}

/// A message on the balancer-to-client direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceResponse {
    /// Present on the first message only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<InitialBalanceResponse>,
    /// Present on serverlist updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_list: Option<ServerList>,
}

/// Encodes a balancer request for the wire.
pub fn encode_balance_request(request: &BalanceRequest) -> Bytes {
    Bytes::from(serde_json::to_vec(request).expect("balance request serializes"))
}

/// Decodes a balancer response.
pub fn decode_balance_response(bytes: &[u8]) -> Result<BalanceResponse> {
    serde_json::from_slice(bytes)
        .map_err(|err| ChannelError::Internal(format!("malformed balancer response: {err}")))
}

/// Thread-safe accumulator for client-side load counters.
///
/// Snapshotting for a report resets the counters, so each report covers the
/// interval since the previous one.
#[derive(Debug, Default)]
pub struct ClientStats {
    calls_started: AtomicU64,
    calls_finished: AtomicU64,
    finished_with_client_failed_to_send: AtomicU64,
    finished_known_received: AtomicU64,
    drops: Mutex<HashMap<String, u64>>,
}

impl ClientStats {
    /// Creates a zeroed accumulator.
    pub fn new() -> ClientStats {
        ClientStats::default()
    }

    /// Records a call handed to a backend subchannel.
    pub fn record_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished call and how far it got.
    pub fn record_call_finished(&self, failed_to_send: bool, known_received: bool) {
        self.calls_finished.fetch_add(1, Ordering::Relaxed);
        if failed_to_send {
            self.finished_with_client_failed_to_send
                .fetch_add(1, Ordering::Relaxed);
        }
        if known_received {
            self.finished_known_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a server-directed drop for `token`.
    pub fn record_call_dropped(&self, token: &str) {
        *self
            .drops
            .lock()
            .unwrap()
            .entry(token.to_string())
            .or_insert(0) += 1;
    }

    /// Returns the counters accumulated since the last snapshot and resets
    /// them.
    pub fn snapshot_and_reset(&self) -> ClientStatsReport {
        let mut drops: Vec<DropEntry> = self
            .drops
            .lock()
            .unwrap()
            .drain()
            .map(|(load_balance_token, num_calls)| DropEntry {
                load_balance_token,
                num_calls,
            })
            .collect();
        drops.sort_by(|a, b| a.load_balance_token.cmp(&b.load_balance_token));
        ClientStatsReport {
            num_calls_started: self.calls_started.swap(0, Ordering::Relaxed),
            num_calls_finished: self.calls_finished.swap(0, Ordering::Relaxed),
            num_calls_finished_with_client_failed_to_send: self
                .finished_with_client_failed_to_send
                .swap(0, Ordering::Relaxed),
            num_calls_finished_known_received: self
                .finished_known_received
                .swap(0, Ordering::Relaxed),
            calls_finished_with_drop: drops,
        }
    }

    /// Current drop count for `token`, for observation in tests.
    pub fn drop_count(&self, token: &str) -> u64 {
        self.drops.lock().unwrap().get(token).copied().unwrap_or(0)
    }
}
