//! Fleet reaper passes against in-memory backend and provider.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use hatchery::annotation::InstanceAnnotation;
use hatchery::backend::{BackendOp, InMemoryBackend};
use hatchery::error::BackendError;
use hatchery::metrics::{AtomicMetrics, Counter};
use hatchery::model::{ModelType, ModelV2, SpawnModel, Worker, WorkerStatus};
use hatchery::provider::{InMemoryProvider, PowerState, ProviderCall, ProviderInstance, ProviderOp};
use hatchery::reaper::{FleetReaper, ReapStats, ReaperConfig};
use hatchery::status::{LoopKind, PassClock};
use hatchery_id::JobId;

const HATCHERY: &str = "hatch_test";

struct Fixture {
    backend: Arc<InMemoryBackend>,
    provider: Arc<InMemoryProvider>,
    metrics: Arc<AtomicMetrics>,
    reaper: FleetReaper,
}

fn fixture() -> Fixture {
    let backend = Arc::new(InMemoryBackend::new());
    let provider = Arc::new(InMemoryProvider::new());
    let metrics = Arc::new(AtomicMetrics::new());
    let reaper = FleetReaper::new(
        backend.clone(),
        provider.clone(),
        metrics.clone(),
        Arc::new(PassClock::new()),
        HATCHERY,
        ReaperConfig::default(),
    );
    Fixture {
        backend,
        provider,
        metrics,
        reaper,
    }
}

fn ubuntu() -> SpawnModel {
    SpawnModel::V2(ModelV2 {
        name: "ubuntu".to_string(),
        model_type: ModelType::VirtualMachine,
    })
}

fn worker(name: &str, state: PowerState) -> ProviderInstance {
    ProviderInstance::new(name)
        .with_annotation(&InstanceAnnotation::for_worker(
            HATCHERY,
            &ubuntu(),
            JobId::new(1),
            name,
        ))
        .with_power_state(state)
}

fn long_ago() -> chrono::DateTime<Utc> {
    Utc::now() - ChronoDuration::hours(2)
}

#[tokio::test]
async fn test_expired_worker_is_shut_down_then_destroyed_once() {
    let f = fixture();
    f.provider.insert(worker("ubuntu-old", PowerState::PoweredOn));
    f.provider.set_started_at("ubuntu-old", long_ago());

    let stats = f.reaper.kill_awol_servers().await.unwrap();

    assert_eq!(stats.reaped, 1);
    assert!(f.provider.instance("ubuntu-old").is_none());
    let mutations: Vec<ProviderCall> = f
        .provider
        .calls_for("ubuntu-old")
        .into_iter()
        .filter(|c| matches!(c, ProviderCall::Shutdown(_) | ProviderCall::Destroy(_)))
        .collect();
    assert_eq!(
        mutations,
        vec![
            ProviderCall::Shutdown("ubuntu-old".to_string()),
            ProviderCall::Destroy("ubuntu-old".to_string()),
        ]
    );
    assert_eq!(f.metrics.get(Counter::InstancesReaped), 1);
}

#[tokio::test]
async fn test_fresh_worker_is_kept() {
    let f = fixture();
    f.provider.insert(worker("ubuntu-new", PowerState::PoweredOn));
    f.provider.set_started_at("ubuntu-new", Utc::now());

    let stats = f.reaper.kill_awol_servers().await.unwrap();

    assert_eq!(stats.reaped, 0);
    assert!(f.provider.instance("ubuntu-new").is_some());
}

#[tokio::test]
async fn test_powered_off_instance_is_destroyed_without_shutdown() {
    let f = fixture();
    let mut annotation =
        InstanceAnnotation::for_worker(HATCHERY, &ubuntu(), JobId::new(1), "ubuntu-done");
    annotation.to_delete = true;
    f.provider
        .insert(ProviderInstance::new("ubuntu-done").with_annotation(&annotation));

    f.reaper.kill_awol_servers().await.unwrap();

    assert_eq!(
        f.provider.calls_for("ubuntu-done"),
        vec![ProviderCall::Destroy("ubuntu-done".to_string())]
    );
}

#[tokio::test]
async fn test_unclaimed_pool_instance_is_never_reaped_for_age() {
    let f = fixture();
    let annotation = InstanceAnnotation::for_provisioning(HATCHERY, &ubuntu());
    f.provider.insert(
        ProviderInstance::new("provision-01")
            .with_annotation(&annotation)
            .with_power_state(PowerState::PoweredOn),
    );
    f.provider.set_started_at("provision-01", long_ago());

    let stats = f.reaper.kill_awol_servers().await.unwrap();

    assert_eq!(stats, ReapStats { inspected: 1, reaped: 0, failed: 0 });
    assert!(f.provider.instance("provision-01").is_some());
}

#[tokio::test]
async fn test_claimed_pool_instance_without_worker_is_reaped() {
    let f = fixture();
    let mut annotation = InstanceAnnotation::for_provisioning(HATCHERY, &ubuntu());
    annotation.job_id = Some(JobId::new(9));
    annotation.worker_name = "ubuntu-claimed".to_string();
    f.provider.insert(
        ProviderInstance::new("ubuntu-claimed")
            .with_annotation(&annotation)
            .with_power_state(PowerState::PoweredOn),
    );
    // Within the worker TTL, outside the registration grace period.
    f.provider
        .set_started_at("ubuntu-claimed", Utc::now() - ChronoDuration::minutes(11));

    let config = ReaperConfig {
        worker_ttl: std::time::Duration::from_secs(3600),
        ..ReaperConfig::default()
    };
    let reaper = FleetReaper::new(
        f.backend.clone(),
        f.provider.clone(),
        f.metrics.clone(),
        Arc::new(PassClock::new()),
        HATCHERY,
        config,
    );

    assert_eq!(reaper.kill_awol_servers().await.unwrap().reaped, 1);
    assert!(f.provider.instance("ubuntu-claimed").is_none());
}

#[tokio::test]
async fn test_claimed_pool_instance_with_worker_is_kept() {
    let f = fixture();
    let mut annotation = InstanceAnnotation::for_provisioning(HATCHERY, &ubuntu());
    annotation.worker_name = "ubuntu-claimed".to_string();
    f.provider.insert(
        ProviderInstance::new("ubuntu-claimed")
            .with_annotation(&annotation)
            .with_power_state(PowerState::PoweredOn),
    );
    f.provider
        .set_started_at("ubuntu-claimed", Utc::now() - ChronoDuration::minutes(11));
    f.backend
        .add_worker(Worker::new("ubuntu-claimed", WorkerStatus::Building));

    let config = ReaperConfig {
        worker_ttl: std::time::Duration::from_secs(3600),
        ..ReaperConfig::default()
    };
    let reaper = FleetReaper::new(
        f.backend.clone(),
        f.provider.clone(),
        f.metrics.clone(),
        Arc::new(PassClock::new()),
        HATCHERY,
        config,
    );

    assert_eq!(reaper.kill_awol_servers().await.unwrap().reaped, 0);
}

#[tokio::test]
async fn test_worker_listing_failure_skips_orphan_check() {
    let f = fixture();
    let mut annotation = InstanceAnnotation::for_provisioning(HATCHERY, &ubuntu());
    annotation.worker_name = "ubuntu-claimed".to_string();
    f.provider.insert(
        ProviderInstance::new("ubuntu-claimed")
            .with_annotation(&annotation)
            .with_power_state(PowerState::PoweredOff),
    );
    f.provider.set_started_at("ubuntu-claimed", long_ago());
    f.backend
        .fail(BackendOp::ListWorkers, BackendError::Transport("reset".into()));

    assert_eq!(f.reaper.kill_awol_servers().await.unwrap().reaped, 0);
}

#[tokio::test]
async fn test_other_hatchery_instances_are_left_alone() {
    let f = fixture();
    let mut annotation =
        InstanceAnnotation::for_worker("hatch_other", &ubuntu(), JobId::new(1), "theirs");
    annotation.to_delete = true;
    f.provider.insert(
        ProviderInstance::new("theirs")
            .with_annotation(&annotation)
            .with_power_state(PowerState::PoweredOn),
    );
    f.provider.set_started_at("theirs", long_ago());
    f.provider.insert(
        ProviderInstance::new("unmanaged").with_power_state(PowerState::PoweredOn),
    );
    f.provider.set_started_at("unmanaged", long_ago());

    let stats = f.reaper.kill_awol_servers().await.unwrap();

    assert_eq!(stats.reaped, 0);
    assert_eq!(f.provider.instance_names(), vec!["theirs", "unmanaged"]);
}

#[tokio::test]
async fn test_failure_on_one_instance_does_not_stop_the_pass() {
    let f = fixture();
    for name in ["ubuntu-a", "ubuntu-b", "ubuntu-c"] {
        f.provider.insert(worker(name, PowerState::PoweredOn));
        f.provider.set_started_at(name, long_ago());
    }
    f.provider.fail(ProviderOp::Shutdown, Some("ubuntu-b"));

    let stats = f.reaper.kill_awol_servers().await.unwrap();

    assert_eq!(stats.reaped, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(f.provider.instance_names(), vec!["ubuntu-b"]);
    // A failed shutdown must not be followed by a destroy attempt.
    assert!(!f
        .provider
        .calls_for("ubuntu-b")
        .contains(&ProviderCall::Destroy("ubuntu-b".to_string())));
}

#[tokio::test]
async fn test_disabled_worker_is_queued_then_reaped() {
    let f = fixture();
    f.provider.insert(worker("ubuntu-disabled", PowerState::PoweredOn));
    f.provider.set_started_at("ubuntu-disabled", Utc::now());
    f.backend
        .add_worker(Worker::new("ubuntu-disabled", WorkerStatus::Disabled));

    assert_eq!(f.reaper.kill_disabled_workers().await.unwrap(), 1);
    assert_eq!(f.reaper.pending_deletion(), vec!["ubuntu-disabled"]);
    // Queuing twice is a no-op.
    assert_eq!(f.reaper.kill_disabled_workers().await.unwrap(), 0);
    assert!(f.provider.instance("ubuntu-disabled").is_some());

    let stats = f.reaper.kill_awol_servers().await.unwrap();
    assert_eq!(stats.reaped, 1);
    assert!(f.reaper.pending_deletion().is_empty());
    assert!(f.provider.instance("ubuntu-disabled").is_none());
}

#[tokio::test]
async fn test_stuck_registration_is_reaped() {
    let f = fixture();
    let annotation = InstanceAnnotation {
        hatchery_name: HATCHERY.to_string(),
        model: true,
        ..Default::default()
    };
    f.provider.insert(
        ProviderInstance::new("register-ubuntu-01")
            .with_annotation(&annotation)
            .with_power_state(PowerState::PoweredOn),
    );
    f.provider.set_started_at("register-ubuntu-01", long_ago());

    assert_eq!(f.reaper.kill_awol_servers().await.unwrap().reaped, 1);
}

#[tokio::test]
async fn test_run_pass_records_clock() {
    let backend = Arc::new(InMemoryBackend::new());
    let provider = Arc::new(InMemoryProvider::new());
    let clock = Arc::new(PassClock::new());
    let reaper = FleetReaper::new(
        backend,
        provider,
        Arc::new(AtomicMetrics::new()),
        clock.clone(),
        HATCHERY,
        ReaperConfig {
            interval: std::time::Duration::from_millis(10),
            ..ReaperConfig::default()
        },
    );
    let (errors_tx, _errors_rx) = tokio::sync::mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reaper = Arc::new(reaper);
    let handle = tokio::spawn({
        let reaper = reaper.clone();
        async move { reaper.run(errors_tx, shutdown_rx).await }
    });

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while clock.last(LoopKind::Reaper).is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_hung_shutdown_times_out_and_keeps_instance() {
    let f = fixture();
    f.provider.insert(worker("ubuntu-hung", PowerState::PoweredOn));
    f.provider.set_started_at("ubuntu-hung", long_ago());
    f.provider
        .delay(ProviderOp::Shutdown, std::time::Duration::from_secs(30));
    let reaper = FleetReaper::new(
        f.backend.clone(),
        f.provider.clone(),
        f.metrics.clone(),
        Arc::new(PassClock::new()),
        HATCHERY,
        ReaperConfig {
            provider_timeout: std::time::Duration::from_millis(50),
            ..ReaperConfig::default()
        },
    );

    let stats = reaper.kill_awol_servers().await.unwrap();

    assert_eq!(stats.failed, 1);
    assert!(f.provider.instance("ubuntu-hung").is_some());
    assert_eq!(f.metrics.get(Counter::InstancesReaped), 0);
}

#[tokio::test]
async fn test_disabled_worker_with_unnamed_annotation_is_queued() {
    let f = fixture();
    // Written by an older hatchery: no name, keys present but false.
    f.provider.insert(ProviderInstance {
        annotation: r#"{"model": false}"#.to_string(),
        ..ProviderInstance::new("worker1")
    });
    f.backend.add_worker(Worker::new("worker1", WorkerStatus::Disabled));

    assert_eq!(f.reaper.kill_disabled_workers().await.unwrap(), 1);
    assert_eq!(f.reaper.pending_deletion(), vec!["worker1"]);
}
