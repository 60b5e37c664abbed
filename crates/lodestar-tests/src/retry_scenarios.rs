//! End-to-end retry behavior: transparent replay, commitment, throttling.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use lodestar_channel::channel::{Channel, ChannelArgs};
    use lodestar_channel::error::StatusCode;
    use lodestar_channel::metadata::Metadata;
    use lodestar_channel::resolver::{FakeResolverGenerator, ResolvedAddress, ResolverResult};
    use lodestar_channel::call::CallOptions;
    use lodestar_channel::subchannel::Connector;
    use lodestar_channel::transport::StreamOpBatch;
    use lodestar_channel::ChannelError;

    use crate::harness::{CallObserver, FakeConnector};

    const BACKEND: &str = "10.0.0.1:50051";
    const ECHO_PATH: &str = "/EchoService/Echo";

    fn retry_config() -> String {
        r#"{
            "methodConfig": [{
                "name": [{"service": "EchoService", "method": "Echo"}],
                "retryPolicy": {
                    "maxRetryAttempts": 3,
                    "initialBackoffMs": 100,
                    "maxBackoffMs": 1000,
                    "backoffMultiplier": 2.0,
                    "retryableStatusCodes": ["UNAVAILABLE"]
                }
            }],
            "retryThrottling": {"maxTokens": 10, "tokenRatio": 0.1}
        }"#
        .to_string()
    }

    fn channel_with_config(
        server_uri: &str,
        connector: &Arc<FakeConnector>,
        args: ChannelArgs,
        config: Option<String>,
    ) -> (Channel, FakeResolverGenerator) {
        let generator = FakeResolverGenerator::new();
        let channel = Channel::new(
            server_uri,
            args,
            generator.resolver(),
            Arc::clone(connector) as Arc<dyn Connector>,
        );
        generator.set_result(ResolverResult {
            addresses: vec![ResolvedAddress::backend(BACKEND)],
            lb_policy_name: None,
            service_config_json: config,
        });
        (channel, generator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transparent_retry_on_unavailable() {
        let connector = FakeConnector::new();
        let (channel, _generator) = channel_with_config(
            "fake:///retry.transparent.test",
            &connector,
            ChannelArgs::default(),
            Some(retry_config()),
        );
        let observer = CallObserver::new();
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        call.start_batch(observer.unary_batch(Metadata::new(), 0, "hello"));

        // First attempt reaches the backend and fails Trailers-Only.
        let attempts = connector.calls_for_path(ECHO_PATH);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].sent_messages(), vec!["hello"]);
        attempts[0].finish_trailers_only(StatusCode::Unavailable);

        // Nothing reaches the surface while the retry back-off runs.
        assert_eq!(observer.num_completions(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Second attempt replays all three send ops from the cache.
        let attempts = connector.calls_for_path(ECHO_PATH);
        assert_eq!(attempts.len(), 2);
        let second = &attempts[1];
        assert!(second.sent_initial_metadata().is_some());
        assert_eq!(second.sent_messages(), vec!["hello"]);
        assert!(second.half_closed());
        second.respond_initial(Metadata::new());
        second.respond_message("world");
        second.finish(StatusCode::Ok, Metadata::new());

        // Surface callbacks fire exactly once each, with OK.
        assert_eq!(observer.recv_initial.lock().unwrap().len(), 1);
        let messages = observer.recv_messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_ref().unwrap().as_deref(), Some(&b"world"[..]));
        drop(messages);
        assert_eq!(observer.num_completions(), 1);
        assert_eq!(observer.final_status(), Some(StatusCode::Ok));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commitment_on_initial_metadata_delivery() {
        let connector = FakeConnector::new();
        let (channel, _generator) = channel_with_config(
            "fake:///retry.commit.test",
            &connector,
            ChannelArgs::default(),
            Some(retry_config()),
        );
        let observer = CallObserver::new();
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        call.start_batch(observer.unary_batch(Metadata::new(), 0, "hello"));

        let attempts = connector.calls_for_path(ECHO_PATH);
        assert_eq!(attempts.len(), 1);
        // A real (non-Trailers-Only) response commits the call ...
        attempts[0].respond_initial(Metadata::new());
        // ... so the later UNAVAILABLE status is not retried.
        attempts[0].finish(StatusCode::Unavailable, Metadata::new());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 1);
        assert_eq!(observer.final_status(), Some(StatusCode::Unavailable));
        assert_eq!(observer.recv_initial.lock().unwrap().len(), 1);
        // End of stream was reported once.
        let messages = observer.recv_messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].as_ref().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_throttled_at_half_bucket() {
        let connector = FakeConnector::new();
        let (channel, _generator) = channel_with_config(
            "fake:///retry.throttle.test",
            &connector,
            ChannelArgs::default(),
            Some(retry_config()),
        );
        // Pre-drain the shared bucket to exactly half: 10 tokens -> 5.
        let throttle = lodestar_channel::RetryThrottleMap::global().for_server(
            "retry.throttle.test",
            10_000,
            100,
        );
        for _ in 0..5 {
            throttle.record_failure();
        }
        assert_eq!(throttle.milli_tokens(), 5_000);

        let observer = CallObserver::new();
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        call.start_batch(observer.unary_batch(Metadata::new(), 0, "hello"));
        let attempts = connector.calls_for_path(ECHO_PATH);
        assert_eq!(attempts.len(), 1);
        attempts[0].finish_trailers_only(StatusCode::Unavailable);
        tokio::time::sleep(Duration::from_secs(2)).await;

        // The failure was recorded but no retry was permitted.
        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 1);
        assert_eq!(observer.final_status(), Some(StatusCode::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_attempts_exhausted() {
        let connector = FakeConnector::new();
        let (channel, _generator) = channel_with_config(
            "fake:///retry.exhausted.test",
            &connector,
            ChannelArgs::default(),
            Some(retry_config()),
        );
        let observer = CallObserver::new();
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        call.start_batch(observer.unary_batch(Metadata::new(), 0, "hello"));

        // Initial attempt plus three retries, then the status propagates.
        for round in 0..4 {
            let attempts = connector.calls_for_path(ECHO_PATH);
            assert_eq!(attempts.len(), round + 1);
            attempts[round].finish_trailers_only(StatusCode::Unavailable);
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 4);
        assert_eq!(observer.num_completions(), 1);
        assert_eq!(observer.final_status(), Some(StatusCode::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_propagates() {
        let connector = FakeConnector::new();
        let (channel, _generator) = channel_with_config(
            "fake:///retry.nonretryable.test",
            &connector,
            ChannelArgs::default(),
            Some(retry_config()),
        );
        let observer = CallObserver::new();
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        call.start_batch(observer.unary_batch(Metadata::new(), 0, "hello"));
        let attempts = connector.calls_for_path(ECHO_PATH);
        attempts[0].finish_trailers_only(StatusCode::InvalidArgument);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 1);
        assert_eq!(observer.final_status(), Some(StatusCode::InvalidArgument));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_overflow_commits_before_first_attempt() {
        let connector = FakeConnector::new();
        let args = ChannelArgs {
            per_rpc_retry_buffer_size: 4,
            ..ChannelArgs::default()
        };
        let (channel, _generator) = channel_with_config(
            "fake:///retry.buffer.test",
            &connector,
            args,
            Some(retry_config()),
        );
        let observer = CallObserver::new();
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        // The payload alone exceeds the 4-byte retry buffer.
        call.start_batch(observer.unary_batch(Metadata::new(), 0, "much too large"));

        let attempts = connector.calls_for_path(ECHO_PATH);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].sent_messages(), vec!["much too large"]);
        attempts[0].finish_trailers_only(StatusCode::Unavailable);
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Committed: the UNAVAILABLE is not retried.
        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 1);
        assert_eq!(observer.final_status(), Some(StatusCode::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailers_only_with_only_initial_metadata_deferred() {
        use lodestar_channel::metadata::Metadata as Md;
        use lodestar_channel::transport::SendInitialMetadata;

        let connector = FakeConnector::new();
        let (channel, _generator) = channel_with_config(
            "fake:///retry.rim-only.test",
            &connector,
            ChannelArgs::default(),
            Some(retry_config()),
        );
        let observer = CallObserver::new();
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        // A batch with no recv_message op: only the initial-metadata delivery
        // can be parked by Trailers-Only handling.
        let initial = Arc::clone(&observer);
        let completions = Arc::clone(&observer);
        call.start_batch(StreamOpBatch {
            send_initial_metadata: Some(SendInitialMetadata {
                metadata: Md::new(),
                flags: 0,
            }),
            send_trailing_metadata: Some(Md::new()),
            recv_initial_metadata: Some(Box::new(move |result| {
                initial.recv_initial.lock().unwrap().push(result);
            })),
            recv_trailing_metadata: true,
            on_complete: Some(Box::new(move |result| {
                completions.completions.lock().unwrap().push(result);
            })),
            ..Default::default()
        });
        let attempts = connector.calls_for_path(ECHO_PATH);
        assert_eq!(attempts.len(), 1);
        // Non-retryable Trailers-Only: the parked delivery is released to the
        // surface exactly once alongside the terminal status.
        attempts[0].finish_trailers_only(StatusCode::PermissionDenied);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 1);
        assert_eq!(observer.num_completions(), 1);
        assert_eq!(observer.final_status(), Some(StatusCode::PermissionDenied));
        let initial = observer.recv_initial.lock().unwrap();
        assert_eq!(initial.len(), 1);
        assert!(initial[0].as_ref().unwrap().trailers_only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_deliveries_dropped_across_retry() {
        let connector = FakeConnector::new();
        let (channel, _generator) = channel_with_config(
            "fake:///retry.deferred.test",
            &connector,
            ChannelArgs::default(),
            Some(retry_config()),
        );
        let observer = CallObserver::new();
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        call.start_batch(observer.unary_batch(Metadata::new(), 0, "hello"));

        // Attempt 1 parks both the Trailers-Only initial metadata and the
        // null message, then retries; attempt 2 parks them again and is
        // terminal. Every surface callback still fires exactly once.
        for round in 0..2 {
            let attempts = connector.calls_for_path(ECHO_PATH);
            attempts[round].finish_trailers_only(StatusCode::Unavailable);
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        let attempts = connector.calls_for_path(ECHO_PATH);
        attempts[2].finish_trailers_only(StatusCode::InvalidArgument);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(observer.recv_initial.lock().unwrap().len(), 1);
        assert_eq!(observer.recv_messages.lock().unwrap().len(), 1);
        assert_eq!(observer.num_completions(), 1);
        assert_eq!(observer.final_status(), Some(StatusCode::InvalidArgument));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_resolver_fails_batches() {
        let connector = FakeConnector::new();
        let generator = FakeResolverGenerator::new();
        let channel = Channel::new(
            "fake:///retry.cancel.test",
            ChannelArgs::default(),
            generator.resolver(),
            Arc::clone(&connector) as Arc<dyn Connector>,
        );
        // No resolver result: the pick parks.
        let observer = CallObserver::new();
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        call.start_batch(observer.unary_batch(Metadata::new(), 0, "hello"));
        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 0);

        call.start_batch(StreamOpBatch {
            cancel_stream: Some(ChannelError::Cancelled("caller gave up".into())),
            ..Default::default()
        });
        assert!(observer.num_completions() >= 1);
        assert_eq!(observer.final_status(), Some(StatusCode::Cancelled));
        // Batches after cancellation fail immediately.
        let late = CallObserver::new();
        call.start_batch(late.unary_batch(Metadata::new(), 0, "late"));
        assert_eq!(late.final_status(), Some(StatusCode::Cancelled));
    }
}
