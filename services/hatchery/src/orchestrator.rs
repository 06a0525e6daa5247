//! Spawn orchestration.
//!
//! Consumes job IDs from intake and drives each one through fetch, model
//! resolution, spawn decision, booking and worker start. Booking success or
//! rejection resolves the intake claim; a refused spawn decision leaves the
//! claim to expire.

use std::sync::Arc;
use std::time::Duration;

use hatchery_id::JobId;
use hatchery_reconcile::PendingClaims;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{bounded, JobBackend};
use crate::config::DefaultModelV2;
use crate::error::{HatcheryError, HatcheryResult};
use crate::metrics::{Counter, MetricsSink};
use crate::model::{split_model_path, Job, ModelV2, SpawnModel};
use crate::spawn::{default_model_v2_name, SpawnDecider};
use crate::worker::WorkerSpawner;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Jobs handled concurrently.
    pub max_concurrent: usize,
    pub backend_timeout: Duration,
    pub default_models_v2: Vec<DefaultModelV2>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            backend_timeout: Duration::from_secs(10),
            default_models_v2: Vec::new(),
        }
    }
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// A worker instance was started.
    Spawned(String),
    /// The job is gone or no longer bookable.
    Gone,
    /// No model could be resolved for the job.
    NoModel,
    /// The spawn decision said no.
    Refused,
    /// Another hatchery booked the job first.
    Rejected,
}

pub struct SpawnOrchestrator {
    backend: Arc<dyn JobBackend>,
    decider: Arc<SpawnDecider>,
    spawner: WorkerSpawner,
    claims: Arc<PendingClaims>,
    metrics: Arc<dyn MetricsSink>,
    hatchery: String,
    config: OrchestratorConfig,
}

impl SpawnOrchestrator {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        decider: Arc<SpawnDecider>,
        spawner: WorkerSpawner,
        claims: Arc<PendingClaims>,
        metrics: Arc<dyn MetricsSink>,
        hatchery: impl Into<String>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            decider,
            spawner,
            claims,
            metrics,
            hatchery: hatchery.into(),
            config,
        }
    }

    /// Handle jobs until the intake channel closes or shutdown is signaled.
    #[instrument(skip_all, name = "orchestrator")]
    pub async fn run(
        self: Arc<Self>,
        mut jobs: mpsc::Receiver<JobId>,
        errors: mpsc::Sender<HatcheryError>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            max_concurrent = self.config.max_concurrent,
            "Starting spawn orchestrator"
        );

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                next = jobs.recv() => {
                    let Some(job_id) = next else {
                        info!("Job stream closed");
                        break;
                    };

                    let permit = tokio::select! {
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = shutdown.changed() => break,
                    };

                    let this = self.clone();
                    let errors = errors.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        match this.handle_job(job_id).await {
                            Ok(outcome) => debug!(job_id = %job_id, ?outcome, "Job handled"),
                            Err(e) if e.is_fatal() => {
                                error!(job_id = %job_id, error = %e, "Spawn failed");
                                let _ = errors.send(e).await;
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "Spawn failed"),
                        }
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Spawn orchestrator shutting down");
                        break;
                    }
                }
            }
        }

        // In-flight spawns are independent; the reaper cleans up anything
        // left half-created.
        tasks.shutdown().await;
    }

    /// Drive one job from fetch to a started worker.
    pub async fn handle_job(&self, job_id: JobId) -> HatcheryResult<SpawnOutcome> {
        let timeout = self.config.backend_timeout;

        let job = match bounded("get_job", timeout, self.backend.get_job(job_id)).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                self.claims.release(job_id);
                return Ok(SpawnOutcome::Gone);
            }
            Err(e) => return Err(e.into()),
        };
        if !job.is_bookable() {
            self.claims.release(job_id);
            return Ok(SpawnOutcome::Gone);
        }

        let Some(model) = self.resolve_model(&job).await? else {
            debug!(job_id = %job_id, "No model for job");
            return Ok(SpawnOutcome::NoModel);
        };

        if !self
            .decider
            .can_spawn(&model, job_id, &job.requirements)
            .await
        {
            self.metrics.incr(Counter::SpawnRefused, 1);
            return Ok(SpawnOutcome::Refused);
        }
        self.metrics.incr(Counter::SpawnAccepted, 1);

        match bounded(
            "take_job",
            timeout,
            self.backend.take_job(job_id, &self.hatchery),
        )
        .await
        {
            Ok(_) => {
                self.claims.release(job_id);
                self.metrics.incr(Counter::JobsBooked, 1);
            }
            Err(e) if e.is_rejected() || e.is_not_found() => {
                self.claims.release(job_id);
                debug!(job_id = %job_id, reason = %e, "Booking lost");
                return Ok(SpawnOutcome::Rejected);
            }
            Err(e) => {
                // Booking outcome unknown; let the decision be retried.
                self.decider.forget(job_id);
                return Err(e.into());
            }
        }

        let name = self.spawner.spawn_worker(&model, job_id).await?;
        Ok(SpawnOutcome::Spawned(name))
    }

    /// The model named by the job's model requirement, or the configured
    /// default v2 model when it names none.
    async fn resolve_model(&self, job: &Job) -> HatcheryResult<Option<SpawnModel>> {
        let provider_type = self.decider.model_type();

        let Some(requirement) = job.model_requirement() else {
            return Ok(
                default_model_v2_name(&self.config.default_models_v2, &job.requirements).map(
                    |name| {
                        SpawnModel::V2(ModelV2 {
                            name: name.to_string(),
                            model_type: provider_type,
                        })
                    },
                ),
            );
        };

        let reference = requirement
            .value
            .split_whitespace()
            .next()
            .unwrap_or_default();
        if !reference.contains('/') {
            return Ok(Some(SpawnModel::V2(ModelV2 {
                name: reference.to_string(),
                model_type: provider_type,
            })));
        }

        let (group, name) = split_model_path(reference)?;
        match bounded(
            "get_worker_model",
            self.config.backend_timeout,
            self.backend.get_worker_model(group, name),
        )
        .await
        {
            Ok(model) => Ok(Some(SpawnModel::V1(model))),
            Err(e) if e.is_not_found() => {
                warn!(job_id = %job.id, model = %reference, "Job requires an unknown model");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
