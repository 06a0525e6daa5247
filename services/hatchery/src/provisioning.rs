//! Provisioning pool.
//!
//! Keeps a configured number of parked instances per model: cloned from the
//! model template, powered on until the guest reports an address, then
//! powered off. Parked instances are claimed by the worker spawner.

use std::sync::Arc;
use std::time::Duration;

use hatchery_id::names::{is_provision_name, provision_name};
use hatchery_reconcile::{pool_deficit, DEFAULT_PROVISIONING_INTERVAL};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::annotation::InstanceAnnotation;
use crate::backend::{self, JobBackend};
use crate::config::PoolEntry;
use crate::error::{HatcheryError, HatcheryResult, ProviderError};
use crate::metrics::{Counter, MetricsSink};
use crate::model::{split_model_path, ModelV2, SpawnModel};
use crate::network::NetworkPlanner;
use crate::provider::{bounded, find_template, CloneSpec, ComputeProvider, ProviderInstance};
use crate::spawn::SpawnDecider;
use crate::status::{LoopKind, PassClock};

/// Provisioning settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub interval: Duration,
    pub pools: Vec<PoolEntry>,
    /// Instances created per pool entry in one pass.
    pub max_per_pass: u32,
    /// How long a new instance may take to report an address.
    pub wait_ip_timeout: Duration,
    pub provider_timeout: Duration,
    pub backend_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PROVISIONING_INTERVAL,
            pools: Vec::new(),
            max_per_pass: 5,
            wait_ip_timeout: Duration::from_secs(300),
            provider_timeout: Duration::from_secs(60),
            backend_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-pass counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionStats {
    pub created: usize,
    pub failed: usize,
    pub skipped_pools: usize,
}

/// Pool instances of one model, split by state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolCount {
    /// Parked and powered off.
    pub ready: u32,
    /// Still baking.
    pub in_flight: u32,
}

/// Count unclaimed pool instances of `model` owned by `hatchery`.
pub fn count_pool(instances: &[ProviderInstance], hatchery: &str, model: &SpawnModel) -> PoolCount {
    let mut count = PoolCount::default();
    for instance in instances {
        if instance.is_template || !is_provision_name(&instance.name) {
            continue;
        }
        let annotation = instance.annotation();
        if !annotation.provisioning
            || annotation.to_delete
            || !annotation.is_owned_by(hatchery)
            || !annotation.matches_model(model)
        {
            continue;
        }
        if instance.is_powered_on() {
            count.in_flight += 1;
        } else {
            count.ready += 1;
        }
    }
    count
}

pub struct ProvisioningManager {
    backend: Arc<dyn JobBackend>,
    provider: Arc<dyn ComputeProvider>,
    decider: Arc<SpawnDecider>,
    network: Arc<NetworkPlanner>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<PassClock>,
    hatchery: String,
    config: PoolConfig,
}

impl ProvisioningManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn JobBackend>,
        provider: Arc<dyn ComputeProvider>,
        decider: Arc<SpawnDecider>,
        network: Arc<NetworkPlanner>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<PassClock>,
        hatchery: impl Into<String>,
        config: PoolConfig,
    ) -> Self {
        Self {
            backend,
            provider,
            decider,
            network,
            metrics,
            clock,
            hatchery: hatchery.into(),
            config,
        }
    }

    /// Run provisioning passes until shutdown. Returns immediately when no
    /// pool is configured.
    #[instrument(skip_all, name = "provisioning")]
    pub async fn run(
        &self,
        errors: mpsc::Sender<HatcheryError>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if self.config.pools.is_empty() {
            debug!("No provisioning pools configured");
            return;
        }
        info!(
            pools = self.config.pools.len(),
            interval_secs = self.config.interval.as_secs(),
            "Starting provisioning pool manager"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.provision().await {
                        Ok(stats) => {
                            consecutive_failures = 0;
                            if stats.created > 0 || stats.failed > 0 {
                                info!(
                                    created = stats.created,
                                    failed = stats.failed,
                                    skipped_pools = stats.skipped_pools,
                                    "Provisioning pass complete"
                                );
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures <= 3 {
                                warn!(error = %e, consecutive_failures, "Provisioning pass failed");
                            } else {
                                error!(
                                    error = %e,
                                    consecutive_failures,
                                    "Provisioning pass failed repeatedly"
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
                        info!("Provisioning pool manager shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every configured pool.
    ///
    /// Fails only when the inventory cannot be listed or on a fatal backend
    /// error; per-pool and per-instance failures are counted and logged.
    pub async fn provision(&self) -> HatcheryResult<ProvisionStats> {
        let mut stats = ProvisionStats::default();

        for entry in &self.config.pools {
            let Some(model) = self.resolve(entry).await? else {
                stats.skipped_pools += 1;
                continue;
            };

            let instances = self.list_instances().await?;
            let Some(template) = find_template(&instances, model.template_name()) else {
                warn!(
                    model = %model.path(),
                    template = %model.template_name(),
                    "No template for pool"
                );
                stats.skipped_pools += 1;
                continue;
            };

            let count = count_pool(&instances, &self.hatchery, &model);
            let missing = pool_deficit(
                entry.count,
                count.ready,
                count.in_flight,
                self.config.max_per_pass,
            );
            if missing == 0 {
                continue;
            }
            debug!(
                model = %model.path(),
                ready = count.ready,
                in_flight = count.in_flight,
                missing,
                "Pool below target"
            );

            for _ in 0..missing {
                match self.provision_one(&template.name, &model).await {
                    Ok(name) => {
                        stats.created += 1;
                        self.metrics.incr(Counter::InstancesProvisioned, 1);
                        info!(instance = %name, model = %model.path(), "Provisioned instance");
                    }
                    Err(e) => {
                        stats.failed += 1;
                        warn!(model = %model.path(), error = %e, "Failed to provision instance");
                    }
                }
            }
        }

        self.clock.record(LoopKind::Provisioning);
        Ok(stats)
    }

    /// Model for a pool entry, or `None` when the pool should be skipped
    /// this pass.
    async fn resolve(&self, entry: &PoolEntry) -> HatcheryResult<Option<SpawnModel>> {
        if let Some(name) = &entry.model_v2 {
            return Ok(Some(SpawnModel::V2(ModelV2 {
                name: name.clone(),
                model_type: self.decider.model_type(),
            })));
        }
        let Some(path) = &entry.model_path else {
            return Ok(None);
        };

        let (group, name) = split_model_path(path)?;
        let model = match backend::bounded(
            "get_worker_model",
            self.config.backend_timeout,
            self.backend.get_worker_model(group, name),
        )
        .await
        {
            Ok(model) => model,
            Err(e) if e.is_unauthorized() => return Err(e.into()),
            Err(e) => {
                warn!(model = %path, error = %e, "Cannot fetch pool model");
                return Ok(None);
            }
        };

        match self.decider.need_registration(&model).await {
            Ok(false) => Ok(Some(SpawnModel::V1(model))),
            Ok(true) => {
                debug!(model = %path, "Pool model needs registration");
                Ok(None)
            }
            Err(e) => {
                warn!(model = %path, error = %e, "Cannot check pool model registration");
                Ok(None)
            }
        }
    }

    /// Clone, power on, wait for an address, power off.
    async fn provision_one(&self, template: &str, model: &SpawnModel) -> HatcheryResult<String> {
        let timeout = self.config.provider_timeout;

        // Listing again picks up addresses taken since the pass started.
        let instances = self.list_instances().await?;
        let reservation = self.network.reserve(&instances)?;

        let name = provision_name();
        let spec = CloneSpec {
            name: name.clone(),
            annotation: InstanceAnnotation::for_provisioning(&self.hatchery, model).encode(),
            network: reservation.as_ref().map(|r| r.identity().clone()),
        };
        bounded(
            "clone_instance",
            timeout,
            self.provider.clone_instance(template, &spec),
        )
        .await?;

        if let Err(e) = self.bake(&name).await {
            self.discard(&name).await;
            return Err(e.into());
        }
        Ok(name)
    }

    async fn bake(&self, name: &str) -> Result<(), ProviderError> {
        let timeout = self.config.provider_timeout;
        bounded("power_on", timeout, self.provider.power_on(name)).await?;

        let address = self
            .provider
            .wait_for_address(name, self.config.wait_ip_timeout)
            .await?;
        debug!(instance = %name, %address, "Instance reported address");

        bounded("shutdown_instance", timeout, self.provider.shutdown_instance(name)).await
    }

    /// Best-effort removal of a half-provisioned instance.
    async fn discard(&self, name: &str) {
        let timeout = self.config.provider_timeout;
        let shutdown = bounded(
            "shutdown_instance",
            timeout,
            self.provider.shutdown_instance(name),
        );
        if let Err(e) = shutdown.await {
            debug!(instance = %name, error = %e, "Shutdown before discard failed");
        }
        let destroy = bounded(
            "destroy_instance",
            timeout,
            self.provider.destroy_instance(name),
        );
        if let Err(e) = destroy.await {
            warn!(
                instance = %name,
                error = %e,
                "Failed to discard instance, leaving it to the reaper"
            );
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelType;
    use crate::provider::PowerState;

    fn ubuntu() -> SpawnModel {
        SpawnModel::V2(ModelV2 {
            name: "ubuntu".to_string(),
            model_type: ModelType::VirtualMachine,
        })
    }

    fn pool_instance(name: &str, hatchery: &str, state: PowerState) -> ProviderInstance {
        ProviderInstance::new(name)
            .with_annotation(&InstanceAnnotation::for_provisioning(hatchery, &ubuntu()))
            .with_power_state(state)
    }

    #[test]
    fn test_count_pool_splits_ready_and_in_flight() {
        let mut claimed = pool_instance("ubuntu-7f3a", "hatch_a", PowerState::PoweredOn);
        claimed.annotation = {
            let mut a = claimed.annotation();
            a.job_id = Some(hatchery_id::JobId::new(4));
            a.encode()
        };
        let instances = vec![
            pool_instance("provision-1", "hatch_a", PowerState::PoweredOff),
            pool_instance("provision-2", "hatch_a", PowerState::PoweredOff),
            pool_instance("provision-3", "hatch_a", PowerState::PoweredOn),
            pool_instance("provision-4", "hatch_b", PowerState::PoweredOff),
            claimed,
            ProviderInstance::template("ubuntu"),
        ];

        let count = count_pool(&instances, "hatch_a", &ubuntu());
        assert_eq!(count, PoolCount { ready: 2, in_flight: 1 });
    }

    #[test]
    fn test_count_pool_ignores_other_models() {
        let other = SpawnModel::V2(ModelV2 {
            name: "alpine".to_string(),
            model_type: ModelType::VirtualMachine,
        });
        let instances = vec![pool_instance("provision-1", "hatch_a", PowerState::PoweredOff)];
        assert_eq!(count_pool(&instances, "hatch_a", &other), PoolCount::default());
    }
}
