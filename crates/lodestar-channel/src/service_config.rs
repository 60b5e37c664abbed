//! Service-config parsing: per-method parameters and retry throttling.
//!
//! The resolver delivers the service config as JSON text. Parsing produces an
//! immutable method-params table keyed by request path (with service-level
//! wildcards) plus optional retry-throttling parameters; any invalid method
//! entry rejects the whole config, and a rejected config is treated as "no
//! config" by the channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::StatusCode;

/// Tri-state wait-for-ready setting from the service config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitForReady {
    /// Not specified; the caller's flag stands.
    #[default]
    Unset,
    /// Force wait-for-ready off unless the caller explicitly set it.
    False,
    /// Force wait-for-ready on unless the caller explicitly set it.
    True,
}

/// Retry policy for one method.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicyConfig {
    /// Maximum number of retry attempts after the initial one.
    pub max_retry_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
    /// Growth factor between retries.
    pub backoff_multiplier: f64,
    /// Statuses that are eligible for retry.
    pub retryable_status_codes: Vec<StatusCode>,
}

/// Parameters applied to calls of one method (or one service, via wildcard).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodParams {
    /// Per-method timeout, intersected with the caller's deadline.
    pub timeout: Option<Duration>,
    /// Wait-for-ready override.
    pub wait_for_ready: WaitForReady,
    /// Retry policy, if retries are configured.
    pub retry_policy: Option<RetryPolicyConfig>,
}

/// Retry-throttling parameters for the whole server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryThrottlingParams {
    /// Bucket capacity in milli-tokens.
    pub max_milli_tokens: i64,
    /// Success credit in milli-tokens.
    pub milli_token_ratio: i64,
}

/// A parsed, immutable service config.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    methods: HashMap<String, Arc<MethodParams>>,
    retry_throttling: Option<RetryThrottlingParams>,
}

impl ServiceConfig {
    /// Parses service-config JSON text. Returns `None` for malformed configs,
    /// which callers treat as "no config".
    pub fn parse(json: &str) -> Option<ServiceConfig> {
        let value: Value = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "rejecting unparseable service config");
                return None;
            }
        };
        ServiceConfig::from_value(&value)
    }

    /// Parses an already-decoded JSON tree.
    pub fn from_value(value: &Value) -> Option<ServiceConfig> {
        let root = value.as_object()?;
        let mut methods = HashMap::new();
        if let Some(configs) = root.get("methodConfig") {
            for entry in configs.as_array()? {
                let entry = entry.as_object()?;
                let params = Arc::new(parse_method_params(entry)?);
                for path in parse_method_names(entry.get("name")?)? {
                    // A path configured twice rejects the whole config.
                    if methods.insert(path, Arc::clone(&params)).is_some() {
                        warn!("rejecting service config with duplicate method name");
                        return None;
                    }
                }
            }
        }
        let retry_throttling = match root.get("retryThrottling") {
            Some(block) => Some(parse_retry_throttling(block)?),
            None => None,
        };
        Some(ServiceConfig {
            methods,
            retry_throttling,
        })
    }

    /// Looks up params for `path` (`/Service/Method`), trying the exact path
    /// first and then the `/Service/` wildcard.
    pub fn method_params(&self, path: &str) -> Option<Arc<MethodParams>> {
        if let Some(params) = self.methods.get(path) {
            return Some(Arc::clone(params));
        }
        let service_end = path.rfind('/')?;
        self.methods.get(&path[..service_end + 1]).map(Arc::clone)
    }

    /// Retry-throttling parameters, if configured.
    pub fn retry_throttling(&self) -> Option<RetryThrottlingParams> {
        self.retry_throttling
    }

    /// Number of configured method entries.
    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }
}

fn parse_method_names(value: &Value) -> Option<Vec<String>> {
    let mut paths = Vec::new();
    for name in value.as_array()? {
        let name = name.as_object()?;
        let service = name.get("service")?.as_str()?;
        if service.is_empty() {
            return None;
        }
        let method = match name.get("method") {
            Some(method) => method.as_str()?,
            None => "",
        };
        // An empty method is a service-level wildcard.
        paths.push(format!("/{service}/{method}"));
    }
    Some(paths)
}

fn parse_method_params(entry: &serde_json::Map<String, Value>) -> Option<MethodParams> {
    let mut params = MethodParams::default();
    if let Some(value) = entry.get("waitForReady") {
        params.wait_for_ready = match value.as_bool()? {
            true => WaitForReady::True,
            false => WaitForReady::False,
        };
    }
    if let Some(value) = entry.get("timeout") {
        params.timeout = Some(parse_timeout(value.as_str()?)?);
    }
    if let Some(value) = entry.get("retryPolicy") {
        params.retry_policy = Some(parse_retry_policy(value)?);
    }
    Some(params)
}

/// Parses a duration of the form `<seconds>s` or `<seconds>.<frac>s` where the
/// fraction has exactly 3, 6, or 9 digits.
fn parse_timeout(text: &str) -> Option<Duration> {
    let text = text.strip_suffix('s')?;
    let (whole, frac) = match text.split_once('.') {
        Some((whole, frac)) => (whole, Some(frac)),
        None => (text, None),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: u64 = whole.parse().ok()?;
    let nanos = match frac {
        None => 0,
        Some(frac) => {
            if !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let digits: u32 = frac.parse().ok()?;
            match frac.len() {
                3 => digits * 1_000_000,
                6 => digits * 1_000,
                9 => digits,
                _ => return None,
            }
        }
    };
    Some(Duration::new(secs, nanos))
}

fn parse_retry_policy(value: &Value) -> Option<RetryPolicyConfig> {
    let obj = value.as_object()?;
    let max_retry_attempts = obj.get("maxRetryAttempts")?.as_u64()?;
    if max_retry_attempts == 0 {
        return None;
    }
    let initial_backoff_ms = obj.get("initialBackoffMs")?.as_u64()?;
    if initial_backoff_ms == 0 {
        return None;
    }
    let max_backoff_ms = obj.get("maxBackoffMs")?.as_u64()?;
    if max_backoff_ms == 0 {
        return None;
    }
    let backoff_multiplier = obj.get("backoffMultiplier")?.as_f64()?;
    if backoff_multiplier <= 0.0 {
        return None;
    }
    let mut retryable_status_codes = Vec::new();
    for code in obj.get("retryableStatusCodes")?.as_array()? {
        retryable_status_codes.push(StatusCode::from_name(code.as_str()?)?);
    }
    Some(RetryPolicyConfig {
        max_retry_attempts: max_retry_attempts as u32,
        initial_backoff: Duration::from_millis(initial_backoff_ms),
        max_backoff: Duration::from_millis(max_backoff_ms),
        backoff_multiplier,
        retryable_status_codes,
    })
}

fn parse_retry_throttling(value: &Value) -> Option<RetryThrottlingParams> {
    let obj = value.as_object()?;
    let max_tokens = obj.get("maxTokens")?.as_u64()?;
    if max_tokens == 0 {
        return None;
    }
    let milli_token_ratio = parse_token_ratio(obj.get("tokenRatio")?)?;
    Some(RetryThrottlingParams {
        max_milli_tokens: max_tokens as i64 * 1000,
        milli_token_ratio,
    })
}

/// Parses a token ratio with up to three decimal digits into milli-tokens.
fn parse_token_ratio(value: &Value) -> Option<i64> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let (whole, frac) = match text.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (text.as_str(), ""),
    };
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac = &frac[..frac.len().min(3)];
    let mut frac_milli: i64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    for _ in frac.len()..3 {
        frac_milli *= 10;
    }
    let ratio = whole * 1000 + frac_milli;
    if ratio <= 0 {
        return None;
    }
    Some(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"{
        "methodConfig": [
            {
                "name": [{"service": "EchoService", "method": "Echo"}],
                "waitForReady": true,
                "timeout": "1.500s",
                "retryPolicy": {
                    "maxRetryAttempts": 3,
                    "initialBackoffMs": 100,
                    "maxBackoffMs": 1000,
                    "backoffMultiplier": 2.0,
                    "retryableStatusCodes": ["UNAVAILABLE", "ABORTED"]
                }
            },
            {
                "name": [{"service": "WideService"}],
                "waitForReady": false
            }
        ],
        "retryThrottling": {"maxTokens": 10, "tokenRatio": 0.1}
    }"#;

    #[test]
    fn test_parses_full_config() {
        let config = ServiceConfig::parse(FULL_CONFIG).unwrap();
        let params = config.method_params("/EchoService/Echo").unwrap();
        assert_eq!(params.wait_for_ready, WaitForReady::True);
        assert_eq!(params.timeout, Some(Duration::from_millis(1500)));
        let retry = params.retry_policy.as_ref().unwrap();
        assert_eq!(retry.max_retry_attempts, 3);
        assert_eq!(retry.initial_backoff, Duration::from_millis(100));
        assert_eq!(retry.max_backoff, Duration::from_millis(1000));
        assert_eq!(
            retry.retryable_status_codes,
            vec![StatusCode::Unavailable, StatusCode::Aborted]
        );
        let throttling = config.retry_throttling().unwrap();
        assert_eq!(throttling.max_milli_tokens, 10_000);
        assert_eq!(throttling.milli_token_ratio, 100);
    }

    #[test]
    fn test_service_wildcard_lookup() {
        let config = ServiceConfig::parse(FULL_CONFIG).unwrap();
        let params = config.method_params("/WideService/AnyMethod").unwrap();
        assert_eq!(params.wait_for_ready, WaitForReady::False);
        assert!(config.method_params("/UnknownService/M").is_none());
    }

    #[test]
    fn test_timeout_grammar() {
        assert_eq!(parse_timeout("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_timeout("0.100s"), Some(Duration::from_millis(100)));
        assert_eq!(
            parse_timeout("1.000250s"),
            Some(Duration::new(1, 250_000))
        );
        assert_eq!(
            parse_timeout("2.000000003s"),
            Some(Duration::new(2, 3))
        );
        // Fractions must have exactly 3, 6, or 9 digits.
        assert_eq!(parse_timeout("1.5s"), None);
        assert_eq!(parse_timeout("1.0000s"), None);
        assert_eq!(parse_timeout("5"), None);
        assert_eq!(parse_timeout("s"), None);
        assert_eq!(parse_timeout("-1s"), None);
    }

    #[test]
    fn test_token_ratio_decimal_digits() {
        let parse = |s: &str| {
            let value: Value = serde_json::from_str(s).unwrap();
            parse_token_ratio(&value)
        };
        assert_eq!(parse("1"), Some(1000));
        assert_eq!(parse("0.1"), Some(100));
        assert_eq!(parse("0.125"), Some(125));
        // Digits past the third are truncated.
        assert_eq!(parse("0.12345"), Some(123));
        assert_eq!(parse("0"), None);
        assert_eq!(parse("\"0.5\""), Some(500));
    }

    #[test]
    fn test_invalid_retry_policy_rejects_config() {
        let json = r#"{
            "methodConfig": [{
                "name": [{"service": "S", "method": "M"}],
                "retryPolicy": {
                    "maxRetryAttempts": 0,
                    "initialBackoffMs": 100,
                    "maxBackoffMs": 1000,
                    "backoffMultiplier": 2.0,
                    "retryableStatusCodes": ["UNAVAILABLE"]
                }
            }]
        }"#;
        assert!(ServiceConfig::parse(json).is_none());
    }

    #[test]
    fn test_unknown_status_name_rejects_config() {
        let json = r#"{
            "methodConfig": [{
                "name": [{"service": "S", "method": "M"}],
                "retryPolicy": {
                    "maxRetryAttempts": 1,
                    "initialBackoffMs": 100,
                    "maxBackoffMs": 1000,
                    "backoffMultiplier": 2.0,
                    "retryableStatusCodes": ["NOT_A_STATUS"]
                }
            }]
        }"#;
        assert!(ServiceConfig::parse(json).is_none());
    }

    #[test]
    fn test_duplicate_method_rejects_config() {
        let json = r#"{
            "methodConfig": [
                {"name": [{"service": "S", "method": "M"}], "waitForReady": true},
                {"name": [{"service": "S", "method": "M"}], "waitForReady": false}
            ]
        }"#;
        assert!(ServiceConfig::parse(json).is_none());
    }

    #[test]
    fn test_unparseable_json_is_none() {
        assert!(ServiceConfig::parse("not json").is_none());
        assert!(ServiceConfig::parse("[1, 2]").is_none());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = ServiceConfig::parse("{}").unwrap();
        assert_eq!(config.num_methods(), 0);
        assert!(config.retry_throttling().is_none());
    }
}
