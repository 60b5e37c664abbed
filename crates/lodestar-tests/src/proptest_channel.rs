//! Property tests for the channel's shared primitives.

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use proptest::prelude::*;

    use lodestar_channel::backoff::{Backoff, BackoffConfig};
    use lodestar_channel::error::StatusCode;
    use lodestar_channel::service_config::ServiceConfig;
    use lodestar_channel::throttle::RetryThrottleMap;

    proptest! {
        /// Each back-off step stays inside the jitter band around the
        /// unjittered, clamped interval sequence.
        #[test]
        fn backoff_steps_stay_in_jitter_band(
            initial_ms in 1u64..2_000,
            multiplier in 1.01f64..4.0,
            jitter in 0.0f64..0.5,
            max_ms in 2_000u64..60_000,
            steps in 1usize..12,
        ) {
            let config = BackoffConfig {
                initial: Duration::from_millis(initial_ms),
                multiplier,
                jitter,
                max: Duration::from_millis(max_ms),
                min_connect_timeout: Duration::from_millis(1),
            };
            let mut backoff = Backoff::new(config);
            let now = Instant::now();
            let first = backoff.begin(now);
            prop_assert_eq!(first, now + Duration::from_millis(initial_ms));
            let mut expected_ms = initial_ms as f64;
            for _ in 0..steps {
                expected_ms = (expected_ms * multiplier).min(max_ms as f64);
                let deadline = backoff.step(now);
                let interval_ms =
                    deadline.duration_since(now).as_secs_f64() * 1_000.0;
                let lower = expected_ms * (1.0 - jitter) - 1.0;
                let upper = (expected_ms * (1.0 + jitter)).min(max_ms as f64) + 1.0;
                prop_assert!(
                    interval_ms >= lower && interval_ms <= upper,
                    "interval {interval_ms}ms outside [{lower}, {upper}]"
                );
            }
        }

        /// With a 1.0 token ratio, k successes followed by k failures return
        /// the bucket to its starting level while neither cap nor floor is
        /// hit.
        #[test]
        fn throttle_round_trip_returns_to_start(
            pre_drain in 10usize..20,
            k in 1usize..10,
        ) {
            let map = RetryThrottleMap::new();
            let throttle = map.for_server("prop.test", 40_000, 1_000);
            for _ in 0..pre_drain {
                throttle.record_failure();
            }
            let start = throttle.milli_tokens();
            for _ in 0..k {
                throttle.record_success();
            }
            for _ in 0..k {
                throttle.record_failure();
            }
            prop_assert_eq!(throttle.milli_tokens(), start);
        }

        /// Bucket level never leaves [0, max] under arbitrary operation mixes.
        #[test]
        fn throttle_stays_in_bounds(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let map = RetryThrottleMap::new();
            let throttle = map.for_server("bounds.test", 10_000, 700);
            for success in ops {
                if success {
                    throttle.record_success();
                } else {
                    throttle.record_failure();
                }
                let level = throttle.milli_tokens();
                prop_assert!((0..=10_000).contains(&level));
            }
        }

        /// Re-emitting a parsed method config in canonical form and parsing
        /// it again yields the same table.
        #[test]
        fn service_config_reparse_is_stable(
            service in "[A-Z][A-Za-z]{2,8}",
            method in "[A-Z][A-Za-z]{2,8}",
            wait_for_ready in any::<bool>(),
            timeout_ms in 1u64..10_000,
            max_attempts in 1u32..5,
            initial_backoff_ms in 1u64..1_000,
            extra_backoff_ms in 1u64..10_000,
            multiplier_tenths in 11u32..40,
        ) {
            let max_backoff_ms = initial_backoff_ms + extra_backoff_ms;
            let multiplier = multiplier_tenths as f64 / 10.0;
            let json = serde_json::json!({
                "methodConfig": [{
                    "name": [{"service": service, "method": method}],
                    "waitForReady": wait_for_ready,
                    "timeout": format!("{}.{:03}s", timeout_ms / 1_000, timeout_ms % 1_000),
                    "retryPolicy": {
                        "maxRetryAttempts": max_attempts,
                        "initialBackoffMs": initial_backoff_ms,
                        "maxBackoffMs": max_backoff_ms,
                        "backoffMultiplier": multiplier,
                        "retryableStatusCodes": ["UNAVAILABLE", "ABORTED"]
                    }
                }]
            });
            let config = ServiceConfig::from_value(&json).expect("valid config");
            let path = format!("/{service}/{method}");
            let params = config.method_params(&path).expect("params for path");
            // Canonical re-emission from the parsed values.
            let reemitted = serde_json::json!({
                "methodConfig": [{
                    "name": [{"service": service, "method": method}],
                    "waitForReady": wait_for_ready,
                    "timeout": format!(
                        "{}.{:03}s",
                        params.timeout.unwrap().as_secs(),
                        params.timeout.unwrap().subsec_millis()
                    ),
                    "retryPolicy": {
                        "maxRetryAttempts": params.retry_policy.as_ref().unwrap().max_retry_attempts,
                        "initialBackoffMs": params.retry_policy.as_ref().unwrap().initial_backoff.as_millis() as u64,
                        "maxBackoffMs": params.retry_policy.as_ref().unwrap().max_backoff.as_millis() as u64,
                        "backoffMultiplier": params.retry_policy.as_ref().unwrap().backoff_multiplier,
                        "retryableStatusCodes": params.retry_policy.as_ref().unwrap()
                            .retryable_status_codes.iter().map(|code| code.name()).collect::<Vec<_>>()
                    }
                }]
            });
            let reparsed = ServiceConfig::from_value(&reemitted).expect("reparse");
            let reparsed_params = reparsed.method_params(&path).expect("params again");
            prop_assert_eq!(params.as_ref(), reparsed_params.as_ref());
        }

        /// Status codes survive the name round trip used by the parser.
        #[test]
        fn status_name_round_trip(code in 0i32..17) {
            let status = StatusCode::from_code(code).unwrap();
            prop_assert_eq!(StatusCode::from_name(status.name()), Some(status));
        }
    }
}
