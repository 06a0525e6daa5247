//! Spawn decision against a live (in-memory) provider inventory.

use std::sync::Arc;

use hatchery::annotation::InstanceAnnotation;
use hatchery::model::{ModelType, Requirement, RequirementKind, SpawnModel, WorkerModel};
use hatchery::provider::{InMemoryProvider, ProviderInstance, ProviderOp};
use hatchery::spawn::{SpawnConfig, SpawnDecider};
use hatchery_id::names::{register_name, tmp_name};
use hatchery_id::JobId;
use rstest::rstest;

const HATCHERY: &str = "hatch_test";

fn debian() -> SpawnModel {
    SpawnModel::V1(WorkerModel {
        name: "debian".to_string(),
        group: "shared.infra".to_string(),
        model_type: ModelType::VirtualMachine,
        image: "debian-12".to_string(),
        ..Default::default()
    })
}

fn decider(provider: Arc<InMemoryProvider>) -> SpawnDecider {
    SpawnDecider::new(provider, SpawnConfig::default())
}

fn worker_for(name: &str, job_id: i64) -> ProviderInstance {
    ProviderInstance::new(name).with_annotation(&InstanceAnnotation::for_worker(
        HATCHERY,
        &debian(),
        JobId::new(job_id),
        name,
    ))
}

#[tokio::test]
async fn test_empty_inventory_accepts() {
    let decider = decider(Arc::new(InMemoryProvider::new()));
    assert!(decider.can_spawn(&debian(), JobId::new(0), &[]).await);
}

#[tokio::test]
async fn test_instance_for_same_job_refuses() {
    let provider = Arc::new(InMemoryProvider::new());
    provider.insert(worker_for("debian-01", 0));
    let decider = decider(provider);

    assert!(!decider.can_spawn(&debian(), JobId::new(0), &[]).await);
}

#[tokio::test]
async fn test_instance_for_other_job_accepts() {
    let provider = Arc::new(InMemoryProvider::new());
    provider.insert(worker_for("debian-01", 7));
    let decider = decider(provider);

    assert!(decider.can_spawn(&debian(), JobId::new(0), &[]).await);
}

#[tokio::test]
async fn test_template_annotation_is_not_a_worker() {
    let provider = Arc::new(InMemoryProvider::new());
    let mut template = worker_for("debian-12", 0);
    template.is_template = true;
    provider.insert(template);
    let decider = decider(provider);

    assert!(decider.can_spawn(&debian(), JobId::new(0), &[]).await);
}

#[tokio::test]
async fn test_recently_offered_job_refuses_until_forgotten() {
    let decider = decider(Arc::new(InMemoryProvider::new()));
    let job = JobId::new(0);

    assert!(decider.can_spawn(&debian(), job, &[]).await);
    assert!(decider.recently_offered(job));
    assert!(!decider.can_spawn(&debian(), job, &[]).await);

    assert!(decider.forget(job));
    assert!(decider.can_spawn(&debian(), job, &[]).await);
}

#[rstest]
#[case::template_build(tmp_name("debian"))]
#[case::registration(register_name("debian"))]
#[tokio::test]
async fn test_transient_instance_for_model_refuses(#[case] name: String) {
    let provider = Arc::new(InMemoryProvider::new());
    provider.insert(ProviderInstance::new(name));
    let decider = decider(provider);

    assert!(!decider.can_spawn(&debian(), JobId::new(3), &[]).await);
    assert!(!decider.recently_offered(JobId::new(3)));
}

#[tokio::test]
async fn test_transient_instance_for_other_model_accepts() {
    let provider = Arc::new(InMemoryProvider::new());
    provider.insert(ProviderInstance::new(register_name("alpine")));
    let decider = decider(provider);

    assert!(decider.can_spawn(&debian(), JobId::new(3), &[]).await);
}

#[tokio::test]
async fn test_unsupported_model_type_refuses_without_listing() {
    let provider = Arc::new(InMemoryProvider::new());
    let decider = decider(provider.clone());
    let container = SpawnModel::V1(WorkerModel {
        name: "node".to_string(),
        group: "shared.infra".to_string(),
        model_type: ModelType::Container,
        ..Default::default()
    });

    assert!(!decider.can_spawn(&container, JobId::new(1), &[]).await);
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_service_requirement_refuses() {
    let decider = decider(Arc::new(InMemoryProvider::new()));
    let reqs = vec![
        Requirement::new(RequirementKind::Model, "model", "shared.infra/debian"),
        Requirement::new(RequirementKind::Service, "pg", "postgres:16"),
    ];

    assert!(!decider.can_spawn(&debian(), JobId::new(1), &reqs).await);
}

#[tokio::test]
async fn test_listing_failure_refuses() {
    let provider = Arc::new(InMemoryProvider::new());
    provider.fail(ProviderOp::List, None);
    let decider = decider(provider);

    assert!(!decider.can_spawn(&debian(), JobId::new(1), &[]).await);
    assert!(!decider.recently_offered(JobId::new(1)));
}

#[tokio::test]
async fn test_concurrent_decisions_accept_once() {
    let decider = Arc::new(decider(Arc::new(InMemoryProvider::new())));
    let job = JobId::new(42);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let decider = decider.clone();
            tokio::spawn(async move { decider.can_spawn(&debian(), job, &[]).await })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
}

#[tokio::test]
async fn test_need_registration_follows_template_annotation() {
    let provider = Arc::new(InMemoryProvider::new());
    let decider = decider(provider.clone());
    let modified = chrono::Utc::now();
    let model = WorkerModel {
        name: "debian".to_string(),
        group: "shared.infra".to_string(),
        model_type: ModelType::VirtualMachine,
        image: "debian-12".to_string(),
        last_modified: Some(modified),
        ..Default::default()
    };

    // No template at all.
    assert!(decider.need_registration(&model).await.unwrap());

    let mut annotation = InstanceAnnotation {
        hatchery_name: HATCHERY.to_string(),
        worker_model_path: model.path(),
        model: true,
        worker_model_last_modified: Some(modified - chrono::Duration::hours(1)),
        ..Default::default()
    };
    provider.insert(ProviderInstance::template("debian-12").with_annotation(&annotation));
    assert!(decider.need_registration(&model).await.unwrap());

    annotation.worker_model_last_modified = Some(modified);
    provider.insert(ProviderInstance::template("debian-12").with_annotation(&annotation));
    assert!(!decider.need_registration(&model).await.unwrap());
}
