//! The assembled hatchery: shared state plus the long-running loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hatchery_reconcile::PendingClaims;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::{EventSource, JobBackend};
use crate::config::Config;
use crate::error::HatcheryError;
use crate::intake::QueuePoller;
use crate::metrics::MetricsSink;
use crate::orchestrator::SpawnOrchestrator;
use crate::provider::{bounded, ComputeProvider};
use crate::provisioning::ProvisioningManager;
use crate::reaper::FleetReaper;
use crate::spawn::SpawnDecider;
use crate::status::{PassClock, StatusReport};
use crate::worker::WorkerSpawner;

/// Handles of a started hatchery.
pub struct Running {
    pub tasks: Vec<(&'static str, JoinHandle<()>)>,
    /// Errors the loops could not recover from on their own.
    pub errors: mpsc::Receiver<HatcheryError>,
}

pub struct Hatchery {
    name: String,
    provider: Arc<dyn ComputeProvider>,
    claims: Arc<PendingClaims>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<PassClock>,
    poller: Arc<QueuePoller>,
    orchestrator: Arc<SpawnOrchestrator>,
    reaper: Arc<FleetReaper>,
    provisioning: Arc<ProvisioningManager>,
    job_buffer: usize,
    provider_timeout: Duration,
}

impl Hatchery {
    pub fn new(
        config: &Config,
        backend: Arc<dyn JobBackend>,
        events: Arc<dyn EventSource>,
        provider: Arc<dyn ComputeProvider>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let claims = Arc::new(PendingClaims::new(config.pending_claim_expiry));
        let clock = Arc::new(PassClock::new());
        let network = Arc::new(config.network_planner()?);
        let decider = Arc::new(SpawnDecider::new(provider.clone(), config.spawn()));

        let poller = QueuePoller::new(
            backend.clone(),
            events,
            claims.clone(),
            metrics.clone(),
            clock.clone(),
            config.intake(),
        );
        let spawner = WorkerSpawner::new(
            provider.clone(),
            network.clone(),
            &config.name,
            config.provider_timeout,
        );
        let orchestrator = SpawnOrchestrator::new(
            backend.clone(),
            decider.clone(),
            spawner,
            claims.clone(),
            metrics.clone(),
            &config.name,
            config.orchestrator(),
        );
        let reaper = FleetReaper::new(
            backend.clone(),
            provider.clone(),
            metrics.clone(),
            clock.clone(),
            &config.name,
            config.reaper(),
        );
        let provisioning = ProvisioningManager::new(
            backend,
            provider.clone(),
            decider,
            network,
            metrics.clone(),
            clock.clone(),
            &config.name,
            config.pools(),
        );

        Ok(Self {
            name: config.name.clone(),
            provider,
            claims,
            metrics,
            clock,
            poller: Arc::new(poller),
            orchestrator: Arc::new(orchestrator),
            reaper: Arc::new(reaper),
            provisioning: Arc::new(provisioning),
            job_buffer: config.max_concurrent_provisioning,
            provider_timeout: config.provider_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn every loop. Each one exits once `shutdown` flips to true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Running {
        let (jobs_tx, jobs_rx) = mpsc::channel(self.job_buffer.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(64);

        info!(hatchery = %self.name, "Starting hatchery loops");

        let intake = tokio::spawn({
            let poller = self.poller.clone();
            let errors = errors_tx.clone();
            let shutdown = shutdown.clone();
            async move { poller.run(jobs_tx, errors, shutdown).await }
        });

        let orchestrator = tokio::spawn(self.orchestrator.clone().run(
            jobs_rx,
            errors_tx.clone(),
            shutdown.clone(),
        ));

        let reaper = tokio::spawn({
            let reaper = self.reaper.clone();
            let errors = errors_tx.clone();
            let shutdown = shutdown.clone();
            async move { reaper.run(errors, shutdown).await }
        });

        let provisioning = tokio::spawn({
            let provisioning = self.provisioning.clone();
            async move { provisioning.run(errors_tx, shutdown).await }
        });

        Running {
            tasks: vec![
                ("intake", intake),
                ("orchestrator", orchestrator),
                ("reaper", reaper),
                ("provisioning", provisioning),
            ],
            errors: errors_rx,
        }
    }

    /// Current status, with a fresh inventory listing.
    pub async fn status(&self) -> StatusReport {
        let mut report = StatusReport::new(&self.name, &self.clock);
        report.pending_claims = self.claims.len();
        report.counters = self.metrics.snapshot();

        let queued = self.reaper.pending_deletion().len();
        match bounded(
            "list_instances",
            self.provider_timeout,
            self.provider.list_instances(),
        )
        .await
        {
            Ok(instances) => report.count_inventory(&instances, queued),
            Err(e) => {
                report.pending_deletion = queued;
                report.inventory_error = Some(e.to_string());
            }
        }
        report
    }
}
