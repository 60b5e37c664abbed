//! End-to-end load-balancing behavior: round-robin, grpclb, health gating.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use lodestar_channel::balancer::{
        BalanceRequest, BalanceResponse, InitialBalanceResponse, ServerEntry, ServerList,
        BALANCE_LOAD_PATH,
    };
    use lodestar_channel::call::CallOptions;
    use lodestar_channel::channel::{Channel, ChannelArgs};
    use lodestar_channel::connectivity::ConnectivityState;
    use lodestar_channel::error::StatusCode;
    use lodestar_channel::health::HEALTH_WATCH_PATH;
    use lodestar_channel::metadata::{Metadata, LB_TOKEN};
    use lodestar_channel::resolver::{FakeResolverGenerator, ResolvedAddress, ResolverResult};
    use lodestar_channel::subchannel::Connector;

    use crate::harness::{CallObserver, FakeCallControl, FakeConnector};

    const ECHO_PATH: &str = "/EchoService/Echo";

    fn make_channel(
        server_uri: &str,
        connector: &Arc<FakeConnector>,
        args: ChannelArgs,
    ) -> (Channel, FakeResolverGenerator) {
        let generator = FakeResolverGenerator::new();
        let channel = Channel::new(
            server_uri,
            args,
            generator.resolver(),
            Arc::clone(connector) as Arc<dyn Connector>,
        );
        (channel, generator)
    }

    fn start_unary(channel: &Channel, observer: &Arc<CallObserver>) {
        let call = channel.create_call(CallOptions {
            path: ECHO_PATH.to_string(),
            deadline: None,
        });
        call.start_batch(observer.unary_batch(Metadata::new(), 0, "ping"));
    }

    fn health_call_for(connector: &FakeConnector, address: &str) -> FakeCallControl {
        connector
            .calls_for_path(HEALTH_WATCH_PATH)
            .into_iter()
            .find(|call| call.address() == address)
            .expect("health call for address")
    }

    fn serving(status: &str) -> String {
        format!(r#"{{"status":"{status}"}}"#)
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_cursor_and_failover() {
        let connector = FakeConnector::new();
        let args = ChannelArgs {
            health_check_service: Some("echo".to_string()),
            ..ChannelArgs::default()
        };
        let (channel, generator) = make_channel("fake:///rr.failover.test", &connector, args);
        generator.set_result(ResolverResult {
            addresses: vec![
                ResolvedAddress::backend("10.0.0.1:50051"),
                ResolvedAddress::backend("10.0.0.2:50051"),
            ],
            lb_policy_name: Some("round_robin".to_string()),
            service_config_json: None,
        });

        // First pick parks until a subchannel passes its health check.
        let first = CallObserver::new();
        start_unary(&channel, &first);
        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 0);

        health_call_for(&connector, "10.0.0.1:50051").respond_message(serving("SERVING"));
        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 1);
        health_call_for(&connector, "10.0.0.2:50051").respond_message(serving("SERVING"));
        assert_eq!(channel.check_connectivity(false), ConnectivityState::Ready);

        // Cursor order: A was index 0, so the next three go B, A, B.
        for _ in 0..3 {
            start_unary(&channel, &CallObserver::new());
        }
        let picked: Vec<String> = connector
            .calls_for_path(ECHO_PATH)
            .iter()
            .map(|call| call.address().to_string())
            .collect();
        assert_eq!(
            picked,
            vec![
                "10.0.0.1:50051",
                "10.0.0.2:50051",
                "10.0.0.1:50051",
                "10.0.0.2:50051"
            ]
        );

        // A stops serving: further picks land on B, aggregate stays READY.
        health_call_for(&connector, "10.0.0.1:50051").respond_message(serving("NOT_SERVING"));
        start_unary(&channel, &CallObserver::new());
        start_unary(&channel, &CallObserver::new());
        let picked: Vec<String> = connector
            .calls_for_path(ECHO_PATH)
            .iter()
            .skip(4)
            .map(|call| call.address().to_string())
            .collect();
        assert_eq!(picked, vec!["10.0.0.2:50051", "10.0.0.2:50051"]);
        assert_eq!(channel.check_connectivity(false), ConnectivityState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_unimplemented_assumes_healthy() {
        let connector = FakeConnector::new();
        let args = ChannelArgs {
            health_check_service: Some("echo".to_string()),
            ..ChannelArgs::default()
        };
        let (channel, generator) = make_channel("fake:///health.unimpl.test", &connector, args);
        generator.set_result(ResolverResult {
            addresses: vec![ResolvedAddress::backend("10.0.0.9:50051")],
            lb_policy_name: Some("round_robin".to_string()),
            service_config_json: None,
        });
        let observer = CallObserver::new();
        start_unary(&channel, &observer);
        // The server has no health service; the subchannel is treated as
        // permanently healthy.
        health_call_for(&connector, "10.0.0.9:50051")
            .finish(StatusCode::Unimplemented, Metadata::new());
        let attempts = connector.calls_for_path(ECHO_PATH);
        assert_eq!(attempts.len(), 1);
        attempts[0].respond_initial(Metadata::new());
        attempts[0].respond_message("pong");
        attempts[0].finish(StatusCode::Ok, Metadata::new());
        assert_eq!(observer.final_status(), Some(StatusCode::Ok));
    }

    fn balancer_response(response: &BalanceResponse) -> bytes::Bytes {
        bytes::Bytes::from(serde_json::to_vec(response).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_grpclb_drop_and_token_attachment() {
        let connector = FakeConnector::new();
        let (channel, generator) =
            make_channel("fake:///glb.drop.test", &connector, ChannelArgs::default());
        generator.set_result(ResolverResult {
            addresses: vec![
                ResolvedAddress::balancer("lb.internal:80", "lb"),
                ResolvedAddress::backend("10.0.1.1:50051"),
            ],
            lb_policy_name: None,
            service_config_json: None,
        });
        // Kick resolution so the balancer machinery starts.
        channel.check_connectivity(true);
        tokio::task::yield_now().await;
        // Balancer addresses force grpclb regardless of the resolver's wish.
        assert_eq!(channel.lb_policy_name().as_deref(), Some("grpclb"));

        let balancer_calls = connector.calls_for_path(BALANCE_LOAD_PATH);
        assert_eq!(balancer_calls.len(), 1);
        let balancer = &balancer_calls[0];
        // The stream opens with the server name.
        let sent = balancer.sent_messages();
        let initial: BalanceRequest = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(initial.initial.unwrap().name, "glb.drop.test");

        balancer.respond_initial(Metadata::new());
        balancer.respond_message(balancer_response(&BalanceResponse {
            initial: Some(InitialBalanceResponse {
                client_stats_report_interval_ms: 1_000,
            }),
            server_list: None,
        }));
        balancer.respond_message(balancer_response(&BalanceResponse {
            initial: None,
            server_list: Some(ServerList {
                servers: vec![
                    ServerEntry {
                        address: String::new(),
                        load_balance_token: "t1".to_string(),
                        drop: true,
                    },
                    ServerEntry {
                        address: "10.0.2.2:50051".to_string(),
                        load_balance_token: "t2".to_string(),
                        drop: false,
                    },
                ],
            }),
        }));

        // Pick 1 lands on the drop entry and completes with no backend.
        let dropped = CallObserver::new();
        start_unary(&channel, &dropped);
        assert_eq!(dropped.final_status(), Some(StatusCode::Unavailable));
        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 0);

        // Pick 2 resolves through the inner round-robin with the LB token.
        let served = CallObserver::new();
        start_unary(&channel, &served);
        let backend_calls = connector.calls_for_path(ECHO_PATH);
        assert_eq!(backend_calls.len(), 1);
        assert_eq!(backend_calls[0].address(), "10.0.2.2:50051");
        let sent_initial = backend_calls[0].sent_initial_metadata().unwrap();
        assert_eq!(sent_initial.metadata.get(LB_TOKEN), Some("t2"));

        // The next client load report accounts the drop under t1.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let sent = balancer.sent_messages();
        assert!(sent.len() >= 2, "expected a load report to be sent");
        let report: BalanceRequest = serde_json::from_slice(&sent[1]).unwrap();
        let stats = report.client_stats.unwrap();
        assert_eq!(stats.calls_finished_with_drop.len(), 1);
        assert_eq!(stats.calls_finished_with_drop[0].load_balance_token, "t1");
        assert_eq!(stats.calls_finished_with_drop[0].num_calls, 1);
        assert!(stats.num_calls_started >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grpclb_fallback_then_recovery() {
        let connector = FakeConnector::new();
        let (channel, generator) = make_channel(
            "fake:///glb.fallback.test",
            &connector,
            ChannelArgs::default(),
        );
        generator.set_result(ResolverResult {
            addresses: vec![
                ResolvedAddress::balancer("lb.internal:80", "lb"),
                ResolvedAddress::backend("10.0.3.1:50051"),
                ResolvedAddress::backend("10.0.3.2:50051"),
            ],
            lb_policy_name: None,
            service_config_json: None,
        });
        // The pick parks: no serverlist and fallback has not fired yet.
        let observer = CallObserver::new();
        start_unary(&channel, &observer);
        assert_eq!(connector.calls_for_path(ECHO_PATH).len(), 0);

        // After the fallback timeout the resolver-provided backends serve.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let first = connector.calls_for_path(ECHO_PATH);
        assert_eq!(first.len(), 1);
        assert!(first[0].address().starts_with("10.0.3."));

        // A serverlist arriving later supersedes the fallback list.
        let balancer_calls = connector.calls_for_path(BALANCE_LOAD_PATH);
        let balancer = &balancer_calls[0];
        balancer.respond_initial(Metadata::new());
        balancer.respond_message(balancer_response(&BalanceResponse {
            initial: Some(InitialBalanceResponse {
                client_stats_report_interval_ms: 0,
            }),
            server_list: Some(ServerList {
                servers: vec![ServerEntry {
                    address: "10.0.4.4:50051".to_string(),
                    load_balance_token: "t9".to_string(),
                    drop: false,
                }],
            }),
        }));
        start_unary(&channel, &CallObserver::new());
        let calls = connector.calls_for_path(ECHO_PATH);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].address(), "10.0.4.4:50051");
    }

    #[tokio::test(start_paused = true)]
    async fn test_balancer_call_retry_after_stream_failure() {
        let connector = FakeConnector::new();
        let (channel, generator) = make_channel(
            "fake:///glb.retry.test",
            &connector,
            ChannelArgs::default(),
        );
        generator.set_result(ResolverResult {
            addresses: vec![ResolvedAddress::balancer("lb.internal:80", "lb")],
            lb_policy_name: None,
            service_config_json: None,
        });
        channel.check_connectivity(true);
        tokio::task::yield_now().await;
        let calls = connector.calls_for_path(BALANCE_LOAD_PATH);
        assert_eq!(calls.len(), 1);
        // The stream dies before any response: the retry timer backs off and
        // then starts a fresh call.
        calls[0].finish(StatusCode::Unavailable, Metadata::new());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(connector.calls_for_path(BALANCE_LOAD_PATH).len() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_watchers_and_disconnect() {
        let connector = FakeConnector::new();
        let (channel, generator) = make_channel(
            "fake:///channel.misc.test",
            &connector,
            ChannelArgs::default(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        channel.watch_connectivity_state(
            ConnectivityState::Idle,
            Box::new(move |state, _| seen2.lock().unwrap().push(state)),
        );
        assert_eq!(channel.num_external_watchers(), 1);

        // Pings fail while no LB policy exists.
        let ping_result = Arc::new(Mutex::new(None));
        let ping_result2 = Arc::clone(&ping_result);
        channel.ping(Box::new(move |outcome| {
            *ping_result2.lock().unwrap() = Some(outcome);
        }));
        assert!(ping_result.lock().unwrap().as_ref().unwrap().is_err());

        generator.set_result(ResolverResult {
            addresses: vec![ResolvedAddress::backend("10.0.5.1:50051")],
            lb_policy_name: None,
            service_config_json: None,
        });
        let observer = CallObserver::new();
        start_unary(&channel, &observer);
        assert_eq!(observer.num_completions(), 0);
        // The watcher fired on the first transition away from Idle.
        assert_eq!(channel.num_external_watchers(), 0);
        assert!(!seen.lock().unwrap().is_empty());

        // Respond so the call completes, then tear the channel down.
        let attempts = connector.calls_for_path(ECHO_PATH);
        assert_eq!(attempts.len(), 1);
        attempts[0].respond_initial(Metadata::new());
        attempts[0].respond_message("pong");
        attempts[0].finish(StatusCode::Ok, Metadata::new());
        assert_eq!(observer.final_status(), Some(StatusCode::Ok));

        channel.disconnect(lodestar_channel::ChannelError::Cancelled(
            "shutting down".into(),
        ));
        assert_eq!(channel.check_connectivity(false), ConnectivityState::Shutdown);
    }
}
