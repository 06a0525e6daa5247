//! Starting worker instances for booked jobs.

use std::sync::Arc;
use std::time::Duration;

use hatchery_id::names::{is_provision_name, worker_name};
use hatchery_id::JobId;
use tracing::{info, warn};

use crate::annotation::InstanceAnnotation;
use crate::error::{HatcheryError, HatcheryResult, ProviderError};
use crate::model::SpawnModel;
use crate::network::NetworkPlanner;
use crate::provider::{bounded, find_template, CloneSpec, ComputeProvider, ProviderInstance};

/// Starts worker instances, preferring parked pool instances over fresh
/// clones.
pub struct WorkerSpawner {
    provider: Arc<dyn ComputeProvider>,
    network: Arc<NetworkPlanner>,
    hatchery: String,
    timeout: Duration,
}

impl WorkerSpawner {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        network: Arc<NetworkPlanner>,
        hatchery: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            network,
            hatchery: hatchery.into(),
            timeout,
        }
    }

    /// Start a worker for `job_id` and return its instance name.
    pub async fn spawn_worker(&self, model: &SpawnModel, job_id: JobId) -> HatcheryResult<String> {
        let instances =
            bounded("list_instances", self.timeout, self.provider.list_instances()).await?;

        if let Some(parked) = self.find_parked(&instances, model) {
            let name = worker_name(model.name());
            match self.claim_parked(parked, &name, model, job_id).await {
                Ok(()) => return Ok(name),
                Err(e) => {
                    // Someone else may have claimed it; fall back to a clone.
                    warn!(
                        job_id = %job_id,
                        instance = %parked.name,
                        error = %e,
                        "Failed to claim provisioned instance"
                    );
                }
            }
        }

        // A failed claim may still hold its name, so the clone gets its own.
        let name = worker_name(model.name());
        self.clone_worker(&instances, &name, model, job_id).await?;
        Ok(name)
    }

    fn find_parked<'a>(
        &self,
        instances: &'a [ProviderInstance],
        model: &SpawnModel,
    ) -> Option<&'a ProviderInstance> {
        instances.iter().find(|i| {
            if i.is_template || i.is_powered_on() || !is_provision_name(&i.name) {
                return false;
            }
            let annotation = i.annotation();
            annotation.provisioning
                && annotation.is_owned_by(&self.hatchery)
                && !annotation.to_delete
                && annotation.matches_model(model)
        })
    }

    async fn claim_parked(
        &self,
        parked: &ProviderInstance,
        name: &str,
        model: &SpawnModel,
        job_id: JobId,
    ) -> Result<(), ProviderError> {
        let mut annotation = parked.annotation();
        annotation.hatchery_name = self.hatchery.clone();
        annotation.job_id = Some(job_id);
        annotation.worker_name = name.to_string();

        bounded(
            "rename_instance",
            self.timeout,
            self.provider.rename_instance(&parked.name, name),
        )
        .await?;

        let claimed = async {
            bounded(
                "set_annotation",
                self.timeout,
                self.provider.set_annotation(name, &annotation.encode()),
            )
            .await?;
            bounded("power_on", self.timeout, self.provider.power_on(name)).await
        };
        if let Err(e) = claimed.await {
            self.unclaim(parked, name).await;
            return Err(e);
        }

        info!(
            job_id = %job_id,
            instance = %name,
            from = %parked.name,
            model = %model.path(),
            "Claimed provisioned instance"
        );
        Ok(())
    }

    /// Best-effort return of a half-claimed instance to the pool: powered
    /// off, original annotation, original name.
    async fn unclaim(&self, parked: &ProviderInstance, name: &str) {
        let timeout = self.timeout;
        if let Err(e) = bounded(
            "shutdown_instance",
            timeout,
            self.provider.shutdown_instance(name),
        )
        .await
        {
            warn!(instance = %name, error = %e, "Failed to power off half-claimed instance");
        }
        if let Err(e) = bounded(
            "set_annotation",
            timeout,
            self.provider.set_annotation(name, &parked.annotation),
        )
        .await
        {
            warn!(instance = %name, error = %e, "Failed to restore pool annotation");
        }
        match bounded(
            "rename_instance",
            timeout,
            self.provider.rename_instance(name, &parked.name),
        )
        .await
        {
            Ok(()) => info!(instance = %parked.name, "Returned instance to the pool"),
            Err(e) => warn!(instance = %name, error = %e, "Failed to restore pool instance name"),
        }
    }

    async fn clone_worker(
        &self,
        instances: &[ProviderInstance],
        name: &str,
        model: &SpawnModel,
        job_id: JobId,
    ) -> HatcheryResult<()> {
        let template = find_template(instances, model.template_name())
            .ok_or_else(|| HatcheryError::MissingTemplate(model.path()))?;

        let reservation = self.network.reserve(instances)?;
        let spec = CloneSpec {
            name: name.to_string(),
            annotation: InstanceAnnotation::for_worker(&self.hatchery, model, job_id, name)
                .encode(),
            network: reservation.as_ref().map(|r| r.identity().clone()),
        };

        bounded(
            "clone_instance",
            self.timeout,
            self.provider.clone_instance(&template.name, &spec),
        )
        .await?;
        if let Err(e) = bounded("power_on", self.timeout, self.provider.power_on(name)).await {
            let cleanup = bounded(
                "destroy_instance",
                self.timeout,
                self.provider.destroy_instance(name),
            );
            if let Err(cleanup) = cleanup.await {
                warn!(instance = %name, error = %cleanup, "Failed to clean up unstarted worker");
            }
            return Err(e.into());
        }

        info!(
            job_id = %job_id,
            instance = %name,
            template = %template.name,
            address = ?spec.network.as_ref().map(|n| n.address),
            "Spawned worker"
        );
        Ok(())
    }
}
