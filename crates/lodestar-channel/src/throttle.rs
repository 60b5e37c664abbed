//! Per-server retry throttling.
//!
//! A token bucket gates retry volume toward each server: every failed RPC
//! debits one token, every success credits a configured fraction, and retries
//! are permitted only while the bucket sits above half-full. Counts are kept
//! in milli-tokens so fractional credit ratios stay in integer arithmetic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Shared token bucket for one server name.
#[derive(Debug)]
pub struct RetryThrottle {
    max_milli_tokens: i64,
    milli_token_ratio: i64,
    milli_tokens: AtomicI64,
}

impl RetryThrottle {
    fn new(max_milli_tokens: i64, milli_token_ratio: i64) -> RetryThrottle {
        RetryThrottle {
            max_milli_tokens,
            milli_token_ratio,
            // The bucket starts full.
            milli_tokens: AtomicI64::new(max_milli_tokens),
        }
    }

    /// Records a call failure, debiting one token (floor zero).
    ///
    /// Returns `true` iff the bucket was strictly above half-full before the
    /// debit, i.e. whether a retry is permitted.
    pub fn record_failure(&self) -> bool {
        let mut observed = self.milli_tokens.load(Ordering::Relaxed);
        loop {
            let next = (observed - 1000).max(0);
            match self.milli_tokens.compare_exchange_weak(
                observed,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return observed > self.max_milli_tokens / 2,
                Err(actual) => observed = actual,
            }
        }
    }

    /// Records a call success, crediting the configured ratio (capped).
    pub fn record_success(&self) {
        let mut observed = self.milli_tokens.load(Ordering::Relaxed);
        loop {
            let next = (observed + self.milli_token_ratio).min(self.max_milli_tokens);
            match self.milli_tokens.compare_exchange_weak(
                observed,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => observed = actual,
            }
        }
    }

    /// Current bucket level in milli-tokens.
    pub fn milli_tokens(&self) -> i64 {
        self.milli_tokens.load(Ordering::Relaxed)
    }

    /// Configured capacity in milli-tokens.
    pub fn max_milli_tokens(&self) -> i64 {
        self.max_milli_tokens
    }

    fn matches(&self, max_milli_tokens: i64, milli_token_ratio: i64) -> bool {
        self.max_milli_tokens == max_milli_tokens && self.milli_token_ratio == milli_token_ratio
    }

    #[cfg(test)]
    pub(crate) fn drain_to(&self, milli_tokens: i64) {
        self.milli_tokens.store(milli_tokens, Ordering::SeqCst);
    }
}

/// Map of throttles keyed by server name.
///
/// Repeated lookups with the same parameters return the same shared throttle;
/// a parameter change rebuilds the entry atomically, so new references see the
/// new bucket while existing holders keep the old one until dropped.
#[derive(Debug, Default)]
pub struct RetryThrottleMap {
    entries: Mutex<HashMap<String, Arc<RetryThrottle>>>,
}

impl RetryThrottleMap {
    /// Creates an empty map. Most callers want [`RetryThrottleMap::global`].
    pub fn new() -> RetryThrottleMap {
        RetryThrottleMap::default()
    }

    /// The process-wide map.
    pub fn global() -> &'static RetryThrottleMap {
        static GLOBAL: OnceLock<RetryThrottleMap> = OnceLock::new();
        GLOBAL.get_or_init(RetryThrottleMap::new)
    }

    /// Returns the shared throttle for `server_name`, creating or rebuilding
    /// it if the parameters differ from the stored entry.
    pub fn for_server(
        &self,
        server_name: &str,
        max_milli_tokens: i64,
        milli_token_ratio: i64,
    ) -> Arc<RetryThrottle> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(server_name) {
            Some(existing) if existing.matches(max_milli_tokens, milli_token_ratio) => {
                Arc::clone(existing)
            }
            _ => {
                let built = Arc::new(RetryThrottle::new(max_milli_tokens, milli_token_ratio));
                entries.insert(server_name.to_string(), Arc::clone(&built));
                built
            }
        }
    }
}
