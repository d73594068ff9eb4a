//! End-to-end tests of the service façade against the loopback SFU and the
//! fake encoder launcher.

use relaycast_abr::{AdjustmentDirection, NetworkSample};
use relaycast_core::{Config, Error, Relaycast, RelaycastEvent};
use relaycast_egress::testing::FakeLauncher;
use relaycast_egress::{
    BridgeEvent, CloseReason, Destination, EgressError, EgressKey, EgressState, EgressStrategy,
    PipelineRequest,
};
use relaycast_sfu::testing::LoopbackSfu;
use relaycast_sfu::{BroadcastId, SfuError};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const POOR: NetworkSample = NetworkSample::new(0.08, 0.0, 200);

struct TestService {
    sfu: Arc<LoopbackSfu>,
    launcher: Arc<FakeLauncher>,
    service: Arc<Relaycast>,
    artifacts: TempDir,
}

impl TestService {
    async fn start(strategy: EgressStrategy) -> Self {
        let artifacts = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.pool.exit_on_exhaustion = false;
        config.pool.fatal_grace_ms = 10;
        config.bridge.strategy = strategy;
        config.bridge.artifact_dir = Some(artifacts.path().to_path_buf());

        let sfu = LoopbackSfu::new();
        sfu.add_default_producers(&"video".into(), &"audio".into());
        let launcher = FakeLauncher::new();
        let service = Relaycast::start(config, sfu.clone(), launcher.clone(), None)
            .await
            .unwrap();

        Self {
            sfu,
            launcher,
            service,
            artifacts,
        }
    }

    async fn start_broadcast(&self, id: &str, destinations: &[&str]) -> BroadcastId {
        let broadcast_id = BroadcastId::from(id);
        self.service.get_or_create_router(&broadcast_id).await.unwrap();
        let destinations = destinations.iter().map(|d| destination(d)).collect();
        self.service
            .start_pipeline(PipelineRequest::new(
                broadcast_id.clone(),
                "video".into(),
                "audio".into(),
                destinations,
            ))
            .await
            .unwrap();
        broadcast_id
    }

    fn artifact_count(&self) -> usize {
        std::fs::read_dir(self.artifacts.path()).unwrap().count()
    }
}

fn destination(id: &str) -> Destination {
    Destination::new(id, id, format!("rtmp://{id}.example.com/app"), format!("sk-{id}"))
}

#[tokio::test(start_paused = true)]
async fn test_pool_replaces_dead_worker_and_router_is_recreated() {
    let t = TestService::start(EgressStrategy::SharedFanout).await;
    let broadcast_id = BroadcastId::from("b1");

    let router = t.service.get_or_create_router(&broadcast_id).await.unwrap();
    let old_router_id = router.id().clone();
    assert_eq!(t.service.get_pool_status().size, 2);

    t.sfu.kill_worker(router.worker_id());

    for _ in 0..100 {
        if t.service.get_pool_status().replacements == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = t.service.get_pool_status();
    assert_eq!(status.size, 2);
    assert_eq!(status.desired, 2);
    assert_eq!(status.deaths, 1);
    assert!(router.is_closed());
    assert!(matches!(
        t.service.registry().get_router(&broadcast_id),
        Err(SfuError::RouterNotFound(_))
    ));

    let fresh = t.service.get_or_create_router(&broadcast_id).await.unwrap();
    assert_ne!(fresh.id(), &old_router_id);
    assert!(!fresh.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_three_destinations_one_encoder_and_clean_stop() {
    let t = TestService::start(EgressStrategy::SharedFanout).await;
    let broadcast_id = t.start_broadcast("b1", &["twitch", "youtube", "kick"]).await;

    assert_eq!(t.launcher.live_processes(), 1);
    assert_eq!(t.artifact_count(), 1);
    for id in ["twitch", "youtube", "kick"] {
        let stats = t.service.get_stream_stats(&broadcast_id, &id.into()).unwrap();
        assert_eq!(stats.state, EgressState::Streaming);
        assert_eq!(stats.destinations.len(), 3);
    }
    assert_eq!(t.service.get_all_stream_stats(&broadcast_id).len(), 1);

    assert!(t.service.stop_pipeline(&broadcast_id).await);
    assert_eq!(t.launcher.live_processes(), 0);
    assert_eq!(t.artifact_count(), 0);
    assert!(t.service.get_all_stream_stats(&broadcast_id).is_empty());
    assert_eq!(t.sfu.open_endpoints(), 0);

    // Stopping again, or stopping something that never existed, is a no-op
    assert!(!t.service.stop_pipeline(&broadcast_id).await);
    assert!(!t.service.stop_pipeline(&"never".into()).await);
}

#[tokio::test(start_paused = true)]
async fn test_update_destinations_leaves_one_encoder() {
    let t = TestService::start(EgressStrategy::SharedFanout).await;
    let broadcast_id = t.start_broadcast("b1", &["a"]).await;

    t.service
        .update_destinations(&broadcast_id, vec![destination("a"), destination("b")])
        .await
        .unwrap();
    assert_eq!(t.launcher.live_processes(), 1);

    t.service.start_egress(&broadcast_id, destination("c")).await.unwrap();
    assert_eq!(t.launcher.live_processes(), 1);
    let job = t.launcher.last_job(&EgressKey::fanout(broadcast_id.clone())).unwrap();
    assert_eq!(job.destinations.len(), 3);

    assert!(t.service.stop_egress(&broadcast_id, &"a".into()).await.unwrap());
    assert_eq!(t.launcher.live_processes(), 1);
    assert!(t.service.get_stream_stats(&broadcast_id, &"a".into()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_egress_is_idempotent() {
    let t = TestService::start(EgressStrategy::PerDestination).await;
    let broadcast_id = t.start_broadcast("b1", &["a", "b"]).await;

    assert!(t.service.stop_egress(&broadcast_id, &"a".into()).await.unwrap());
    assert!(!t.service.stop_egress(&broadcast_id, &"a".into()).await.unwrap());
    assert!(!t.service.stop_egress(&"nope".into(), &"a".into()).await.unwrap());
    assert_eq!(t.launcher.live_processes(), 1);
    assert!(t.service.abr().is_running(&broadcast_id));

    // The last destination ends the pipeline and its ABR control
    assert!(t.service.stop_egress(&broadcast_id, &"b".into()).await.unwrap());
    assert!(!t.service.bridge().has_pipeline(&broadcast_id));
    assert!(!t.service.abr().is_running(&broadcast_id));
    assert!(!t.service.stop_egress(&broadcast_id, &"b".into()).await.unwrap());
    assert_eq!(t.launcher.live_processes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_profile_changes_restart_once_each() {
    let t = TestService::start(EgressStrategy::SharedFanout).await;
    let broadcast_id = t.start_broadcast("b1", &["a"]).await;
    let key = EgressKey::fanout(broadcast_id.clone());
    let launches = t.launcher.launches();

    t.service.set_profile(&broadcast_id, "480p", None).await.unwrap();
    t.service.set_profile(&broadcast_id, "360p", None).await.unwrap();
    // Let the event router drain both adjustments
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(t.launcher.launches(), launches + 2);
    assert_eq!(t.launcher.last_job(&key).unwrap().profile.unwrap().name, "360p");
    assert_eq!(t.launcher.live_processes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abr_downgrade_restarts_encoder_with_new_profile() {
    let t = TestService::start(EgressStrategy::SharedFanout).await;
    let broadcast_id = t.start_broadcast("b1", &["a"]).await;
    let key = EgressKey::fanout(broadcast_id.clone());

    let initial = t.launcher.last_job(&key).unwrap().profile.unwrap();
    assert_eq!(initial.name, "720p");

    assert!(t.service.record_network_sample(&broadcast_id, POOR).await.unwrap().is_none());
    assert!(t.service.record_network_sample(&broadcast_id, POOR).await.unwrap().is_none());
    let event = t
        .service
        .record_network_sample(&broadcast_id, POOR)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.profile.name, "480p");
    assert_eq!(event.adjustment.direction, AdjustmentDirection::Downgrade);

    assert_eq!(t.launcher.last_job(&key).unwrap().profile.unwrap().name, "480p");
    assert_eq!(t.launcher.live_processes(), 1);
    assert_eq!(t.service.get_adjustment_history(&broadcast_id).len(), 1);

    t.service
        .set_profile(&broadcast_id, "1080p", Some("operator"))
        .await
        .unwrap();
    assert_eq!(t.launcher.last_job(&key).unwrap().profile.unwrap().name, "1080p");
    let history = t.service.get_adjustment_history(&broadcast_id);
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].direction, AdjustmentDirection::Manual);
    assert_eq!(t.service.get_abr_state(&broadcast_id).unwrap().profile.name, "1080p");
}

#[tokio::test(start_paused = true)]
async fn test_destination_backoff_then_manual_retry() {
    let t = TestService::start(EgressStrategy::PerDestination).await;
    let broadcast_id = BroadcastId::from("b1");
    let failing = EgressKey::destination(broadcast_id.clone(), "b".into());
    t.launcher.set_failing(&failing, true);

    t.start_broadcast("b1", &["a", "b"]).await;
    let stats = t.service.get_stream_stats(&broadcast_id, &"b".into()).unwrap();
    assert_eq!(stats.state, EgressState::Reconnecting);
    assert_eq!(stats.retry_count, 1);

    // A restart is already pending
    assert!(!t.service.retry_egress(&broadcast_id, &"b".into()).await.unwrap());
    assert_eq!(t.service.get_stream_stats(&broadcast_id, &"b".into()).unwrap().retry_count, 1);

    // 2 + 4 + 8 + 16 seconds of backoff exhaust the budget
    tokio::time::sleep(Duration::from_secs(31)).await;
    let stats = t.service.get_stream_stats(&broadcast_id, &"b".into()).unwrap();
    assert_eq!(stats.state, EgressState::Failed);
    assert_eq!(stats.retry_count, 5);
    assert!(stats.last_error.is_some());

    // Nothing further is scheduled
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(t.launcher.live_for(&failing), 0);
    assert_eq!(
        t.service.get_stream_stats(&broadcast_id, &"a".into()).unwrap().state,
        EgressState::Streaming
    );

    t.launcher.set_failing(&failing, false);
    assert!(t.service.retry_egress(&broadcast_id, &"b".into()).await.unwrap());
    let stats = t.service.get_stream_stats(&broadcast_id, &"b".into()).unwrap();
    assert_eq!(stats.state, EgressState::Streaming);
    assert_eq!(stats.retry_count, 0);
    assert_eq!(t.launcher.live_processes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_worker_death_ends_pipeline_and_abr() {
    let t = TestService::start(EgressStrategy::SharedFanout).await;
    let mut events = t.service.subscribe();
    let broadcast_id = t.start_broadcast("b1", &["a"]).await;
    assert!(t.service.abr().is_running(&broadcast_id));

    let router = t.service.registry().get_router(&broadcast_id).unwrap();
    t.sfu.kill_worker(router.worker_id());

    loop {
        if let RelaycastEvent::Bridge(BridgeEvent::PipelineClosed { reason, .. }) =
            events.recv().await.unwrap()
        {
            assert_eq!(reason, CloseReason::RouterClosed);
            break;
        }
    }
    assert_eq!(t.launcher.live_processes(), 0);
    assert_eq!(t.artifact_count(), 0);
    assert!(!t.service.abr().is_running(&broadcast_id));
}

#[tokio::test(start_paused = true)]
async fn test_setup_errors_are_synchronous() {
    let t = TestService::start(EgressStrategy::SharedFanout).await;

    let no_router = t
        .service
        .start_pipeline(PipelineRequest::new(
            "ghost".into(),
            "video".into(),
            "audio".into(),
            vec![destination("a")],
        ))
        .await;
    assert!(matches!(
        no_router,
        Err(Error::Egress(EgressError::Sfu(SfuError::RouterNotFound(_))))
    ));
    assert!(!t.service.abr().is_running(&"ghost".into()));

    let broadcast_id = t.start_broadcast("b1", &["a"]).await;
    let retry_unknown = t.service.retry_egress(&broadcast_id, &"zzz".into()).await;
    assert!(matches!(retry_unknown, Err(ref e) if e.is_not_found()));
    assert!(t.service.get_stream_stats(&broadcast_id, &"zzz".into()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_end_broadcast_and_shutdown_release_everything() {
    let t = TestService::start(EgressStrategy::PerDestination).await;
    let b1 = t.start_broadcast("b1", &["a", "b"]).await;
    let b2 = t.start_broadcast("b2", &["c"]).await;
    assert_eq!(t.launcher.live_processes(), 3);

    t.service.end_broadcast(&b1).await;
    assert_eq!(t.launcher.live_processes(), 1);
    assert!(t.service.registry().get_router(&b1).is_err());
    assert!(t.service.get_adjustment_history(&b1).is_empty());

    t.service.shutdown().await;
    assert_eq!(t.launcher.live_processes(), 0);
    assert_eq!(t.artifact_count(), 0);
    assert!(t.service.registry().get_router(&b2).is_err());
    assert!(matches!(
        t.service.get_or_create_router(&b1).await,
        Err(Error::ShutDown)
    ));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = Config::default();
    config.egress.max_retries = 0;
    config.logging.format = "xml".to_string();

    let result = Relaycast::start(config, LoopbackSfu::new(), FakeLauncher::new(), None).await;
    assert!(matches!(result, Err(Error::Config(_))));
}
