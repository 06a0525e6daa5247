//! Fleet reaper.
//!
//! Reconciles the backend worker registry against the provider inventory
//! and removes instances that should no longer exist. The inventory is
//! re-listed at the start of every pass; nothing is carried over except the
//! deletion queue filled by the disabled-worker pass.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hatchery_id::names::{is_provision_name, is_register_name};
use hatchery_reconcile::DEFAULT_REAPER_INTERVAL;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{self, JobBackend};
use crate::error::{HatcheryError, HatcheryResult, ProviderError};
use crate::metrics::{Counter, MetricsSink};
use crate::model::WorkerStatus;
use crate::provider::{bounded, ComputeProvider, PowerState, ProviderInstance};
use crate::status::{LoopKind, PassClock};

/// Reaper settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Maximum lifetime of a powered-on worker.
    pub worker_ttl: Duration,
    /// Grace period for registration and for claimed pool instances to
    /// show up in the worker registry.
    pub registration_ttl: Duration,
    pub provider_timeout: Duration,
    pub backend_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REAPER_INTERVAL,
            worker_ttl: Duration::from_secs(10 * 60),
            registration_ttl: Duration::from_secs(10 * 60),
            provider_timeout: Duration::from_secs(60),
            backend_timeout: Duration::from_secs(10),
        }
    }
}

/// Why an instance is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    /// Queued by the disabled-worker pass or annotated `to_delete`.
    MarkedForDeletion,
    /// Powered on for longer than the worker TTL.
    Expired,
    /// A claimed pool instance whose worker never registered or is gone.
    Orphaned,
    /// A registration instance that outlived the registration TTL.
    StuckRegistration,
}

impl ReapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReapReason::MarkedForDeletion => "marked_for_deletion",
            ReapReason::Expired => "expired",
            ReapReason::Orphaned => "orphaned",
            ReapReason::StuckRegistration => "stuck_registration",
        }
    }
}

/// Outcome of one awol pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapStats {
    pub inspected: usize,
    pub reaped: usize,
    pub failed: usize,
}

pub struct FleetReaper {
    backend: Arc<dyn JobBackend>,
    provider: Arc<dyn ComputeProvider>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<PassClock>,
    hatchery: String,
    to_delete: Mutex<BTreeSet<String>>,
    config: ReaperConfig,
}

impl FleetReaper {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        provider: Arc<dyn ComputeProvider>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<PassClock>,
        hatchery: impl Into<String>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            backend,
            provider,
            metrics,
            clock,
            hatchery: hatchery.into(),
            to_delete: Mutex::new(BTreeSet::new()),
            config,
        }
    }

    fn queue(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.to_delete.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names waiting in the deletion queue.
    pub fn pending_deletion(&self) -> Vec<String> {
        self.queue().iter().cloned().collect()
    }

    /// Run both passes on an interval until shutdown.
    #[instrument(skip_all, name = "reaper")]
    pub async fn run(
        &self,
        errors: mpsc::Sender<HatcheryError>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            worker_ttl_secs = self.config.worker_ttl.as_secs(),
            "Starting fleet reaper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_pass().await {
                        Ok(stats) => {
                            consecutive_failures = 0;
                            self.clock.record(LoopKind::Reaper);
                            if stats.reaped > 0 || stats.failed > 0 {
                                info!(
                                    inspected = stats.inspected,
                                    reaped = stats.reaped,
                                    failed = stats.failed,
                                    "Reaper pass complete"
                                );
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures <= 3 {
                                warn!(error = %e, consecutive_failures, "Reaper pass failed");
                            } else {
                                error!(
                                    error = %e,
                                    consecutive_failures,
                                    "Reaper pass failed repeatedly"
                                );
                            }
                            if e.is_fatal() {
                                let _ = errors.send(e).await;
                            }
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Fleet reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One disabled-worker pass followed by one awol pass.
    pub async fn run_pass(&self) -> HatcheryResult<ReapStats> {
        if let Err(e) = self.kill_disabled_workers().await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(error = %e, "Disabled-worker pass failed");
        }
        self.kill_awol_servers().await
    }

    /// Queue the instances of disabled workers for deletion.
    ///
    /// Returns the number of names newly queued.
    pub async fn kill_disabled_workers(&self) -> HatcheryResult<usize> {
        let workers = backend::bounded(
            "list_workers",
            self.config.backend_timeout,
            self.backend.list_workers(),
        )
        .await?;

        let disabled: Vec<&str> = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Disabled)
            .map(|w| w.name.as_str())
            .collect();
        if disabled.is_empty() {
            return Ok(0);
        }

        let instances = self.list_instances().await?;
        let mut queued = 0;
        for name in disabled {
            let Some(instance) = instances.iter().find(|i| i.name == name && !i.is_template) else {
                continue;
            };
            if !instance.annotation().is_owned_by(&self.hatchery) {
                continue;
            }
            if self.queue().insert(instance.name.clone()) {
                debug!(instance = %instance.name, "Queued disabled worker for deletion");
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Shut down and destroy every instance that should no longer exist.
    ///
    /// A failure on one instance does not stop the pass.
    pub async fn kill_awol_servers(&self) -> HatcheryResult<ReapStats> {
        let instances = self.list_instances().await?;

        let registered = match backend::bounded(
            "list_workers",
            self.config.backend_timeout,
            self.backend.list_workers(),
        )
        .await
        {
            Ok(workers) => Some(workers.into_iter().map(|w| w.name).collect::<BTreeSet<_>>()),
            Err(e) if e.is_unauthorized() => return Err(e.into()),
            Err(e) => {
                // Without the registry nothing can be judged orphaned.
                warn!(error = %e, "Cannot list workers, skipping orphan checks");
                None
            }
        };

        let now = Utc::now();
        let mut stats = ReapStats::default();
        for instance in instances.iter().filter(|i| !i.is_template) {
            stats.inspected += 1;
            let Some(reason) = self.reap_reason(instance, registered.as_ref(), now).await else {
                continue;
            };
            match self.reap(instance, reason).await {
                Ok(()) => stats.reaped += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        instance = %instance.name,
                        reason = reason.as_str(),
                        error = %e,
                        "Failed to reap instance"
                    );
                }
            }
        }

        // Names that no longer exist cannot be reaped.
        let present: BTreeSet<&str> = instances.iter().map(|i| i.name.as_str()).collect();
        self.queue().retain(|name| present.contains(name.as_str()));

        Ok(stats)
    }

    async fn reap_reason(
        &self,
        instance: &ProviderInstance,
        registered: Option<&BTreeSet<String>>,
        now: DateTime<Utc>,
    ) -> Option<ReapReason> {
        let annotation = instance.annotation();
        if !annotation.is_owned_by(&self.hatchery) {
            return None;
        }
        if annotation.to_delete || self.queue().contains(&instance.name) {
            return Some(ReapReason::MarkedForDeletion);
        }

        if is_register_name(&instance.name) {
            return self
                .started_before(&instance.name, self.config.registration_ttl, now)
                .await
                .then_some(ReapReason::StuckRegistration);
        }

        if annotation.provisioning {
            if is_provision_name(&instance.name) {
                // Parked and unclaimed.
                return None;
            }
            let unregistered = registered.is_some_and(|r| !r.contains(&instance.name));
            if unregistered
                && self
                    .started_before(&instance.name, self.config.registration_ttl, now)
                    .await
            {
                return Some(ReapReason::Orphaned);
            }
        }

        if instance.is_powered_on()
            && self
                .started_before(&instance.name, self.config.worker_ttl, now)
                .await
        {
            return Some(ReapReason::Expired);
        }
        None
    }

    /// Returns true if the instance's last power-on is older than `limit`.
    /// Unknown start times never count as old.
    async fn started_before(&self, name: &str, limit: Duration, now: DateTime<Utc>) -> bool {
        let started = match bounded(
            "last_start_event",
            self.config.provider_timeout,
            self.provider.last_start_event(name),
        )
        .await
        {
            Ok(Some(started)) => started,
            Ok(None) => return false,
            Err(e) => {
                debug!(instance = %name, error = %e, "No start event");
                return false;
            }
        };
        let limit = chrono::Duration::from_std(limit).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(started) > limit
    }

    async fn reap(
        &self,
        instance: &ProviderInstance,
        reason: ReapReason,
    ) -> Result<(), ProviderError> {
        let timeout = self.config.provider_timeout;

        if instance.power_state != PowerState::PoweredOff {
            bounded(
                "shutdown_instance",
                timeout,
                self.provider.shutdown_instance(&instance.name),
            )
            .await?;
        }

        match bounded(
            "destroy_instance",
            timeout,
            self.provider.destroy_instance(&instance.name),
        )
        .await
        {
            Ok(()) | Err(ProviderError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.queue().remove(&instance.name);
        self.metrics.incr(Counter::InstancesReaped, 1);
        info!(
            instance = %instance.name,
            reason = reason.as_str(),
            "Reaped instance"
        );
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<ProviderInstance>, ProviderError> {
        bounded(
            "list_instances",
            self.config.provider_timeout,
            self.provider.list_instances(),
        )
        .await
    }
}
