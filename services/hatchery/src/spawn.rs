//! Spawn decisions.
//!
//! `can_spawn` is optimistic: two hatcheries may both accept the same job,
//! and the backend's booking call picks the winner. The checks here only
//! cut down on wasted spawns.

use std::sync::Arc;
use std::time::Duration;

use hatchery_id::names::is_transient_for_model;
use hatchery_id::JobId;
use hatchery_reconcile::{ExpiringSet, DEFAULT_SPAWN_CACHE_TTL};
use tracing::{debug, warn};

use crate::config::DefaultModelV2;
use crate::error::ProviderError;
use crate::model::{ModelType, Requirement, RequirementKind, SpawnModel, WorkerModel};
use crate::provider::{bounded, find_template, ComputeProvider};

/// Spawn decision settings.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Lifetime of an entry in the recently-offered cache.
    pub cache_ttl: Duration,
    /// Bound on the inventory listing.
    pub list_timeout: Duration,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_SPAWN_CACHE_TTL,
            list_timeout: Duration::from_secs(10),
        }
    }
}

/// Decides whether a fresh instance may be started for a job.
pub struct SpawnDecider {
    provider: Arc<dyn ComputeProvider>,
    /// Jobs this process accepted recently. Separate from the intake
    /// claims: this one is cleared on a rolling basis only.
    offered: ExpiringSet<JobId>,
    config: SpawnConfig,
}

impl SpawnDecider {
    pub fn new(provider: Arc<dyn ComputeProvider>, config: SpawnConfig) -> Self {
        Self {
            provider,
            offered: ExpiringSet::new(config.cache_ttl),
            config,
        }
    }

    /// The model type the provider runs.
    pub fn model_type(&self) -> ModelType {
        self.provider.model_type()
    }

    /// Returns true if a new instance may be started for `job_id`.
    ///
    /// Accepting records the job in the recently-offered cache.
    pub async fn can_spawn(
        &self,
        model: &SpawnModel,
        job_id: JobId,
        requirements: &[Requirement],
    ) -> bool {
        if model.model_type() != self.provider.model_type() {
            debug!(job_id = %job_id, model = %model.path(), "Model type not supported by provider");
            return false;
        }
        if !requirements_match(model, requirements) {
            debug!(job_id = %job_id, model = %model.path(), "Requirements not satisfiable");
            return false;
        }

        let instances = match bounded(
            "list_instances",
            self.config.list_timeout,
            self.provider.list_instances(),
        )
        .await
        {
            Ok(instances) => instances,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Cannot list instances, refusing spawn");
                return false;
            }
        };

        for instance in instances.iter().filter(|i| !i.is_template) {
            if instance.annotation().job_id == Some(job_id) {
                debug!(job_id = %job_id, instance = %instance.name, "Job already has an instance");
                return false;
            }
        }

        if let Some(instance) = instances
            .iter()
            .find(|i| is_transient_for_model(&i.name, model.name()))
        {
            debug!(
                job_id = %job_id,
                instance = %instance.name,
                "Model build or registration in flight"
            );
            return false;
        }

        if !self.offered.insert_if_absent(job_id) {
            debug!(job_id = %job_id, "Job offered recently");
            return false;
        }
        true
    }

    /// Drop `job_id` from the recently-offered cache.
    pub fn forget(&self, job_id: JobId) -> bool {
        self.offered.remove(&job_id)
    }

    pub fn recently_offered(&self, job_id: JobId) -> bool {
        self.offered.contains(&job_id)
    }

    /// Returns true unless an up-to-date template exists for the model.
    ///
    /// A template is up to date when it carries the model flag and the
    /// model's last modification time.
    pub async fn need_registration(&self, model: &WorkerModel) -> Result<bool, ProviderError> {
        let instances = bounded(
            "list_instances",
            self.config.list_timeout,
            self.provider.list_instances(),
        )
        .await?;

        let Some(template) = find_template(&instances, model.template_name()) else {
            return Ok(true);
        };
        let annotation = template.annotation();
        Ok(!(annotation.model && annotation.built_at(model.last_modified)))
    }
}

/// Returns true if `model` can satisfy every requirement of a job.
///
/// Service, memory and hostname requirements are never satisfiable by a
/// cloned instance; a model requirement must name this model.
pub fn requirements_match(model: &SpawnModel, requirements: &[Requirement]) -> bool {
    requirements.iter().all(|r| {
        if r.kind.is_unsupported() {
            return false;
        }
        if r.kind == RequirementKind::Model {
            let wanted = r.value.split_whitespace().next().unwrap_or_default();
            return wanted == model.path() || wanted == model.name();
        }
        true
    })
}

/// Picks the default v2 model for a job that names no model.
///
/// Without binary requirements the first configured model wins; otherwise
/// the first model providing any required binary.
pub fn default_model_v2_name<'a>(
    defaults: &'a [DefaultModelV2],
    requirements: &[Requirement],
) -> Option<&'a str> {
    let binaries: Vec<&str> = requirements
        .iter()
        .filter(|r| r.kind == RequirementKind::Binary)
        .map(|r| r.value.as_str())
        .collect();

    if binaries.is_empty() {
        return defaults.first().map(|d| d.worker_model_v2.as_str());
    }

    defaults
        .iter()
        .find(|d| d.binaries.iter().any(|b| binaries.contains(&b.as_str())))
        .map(|d| d.worker_model_v2.as_str())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::model::ModelV2;

    fn model() -> SpawnModel {
        SpawnModel::V1(WorkerModel {
            name: "debian".to_string(),
            group: "shared.infra".to_string(),
            model_type: ModelType::VirtualMachine,
            ..Default::default()
        })
    }

    #[rstest]
    #[case(vec![], true)]
    #[case(vec![Requirement::new(RequirementKind::Model, "m", "shared.infra/debian")], true)]
    #[case(vec![Requirement::new(RequirementKind::Model, "m", "debian")], true)]
    #[case(vec![Requirement::new(RequirementKind::Model, "m", "shared.infra/debian --net host")], true)]
    #[case(vec![Requirement::new(RequirementKind::Model, "m", "shared.infra/ubuntu")], false)]
    #[case(vec![Requirement::new(RequirementKind::Binary, "git", "git")], true)]
    #[case(vec![Requirement::new(RequirementKind::Service, "pg", "postgres:16")], false)]
    #[case(vec![Requirement::new(RequirementKind::Memory, "mem", "4096")], false)]
    #[case(vec![Requirement::new(RequirementKind::Hostname, "host", "build-01")], false)]
    fn test_requirements_match(#[case] requirements: Vec<Requirement>, #[case] expected: bool) {
        assert_eq!(requirements_match(&model(), &requirements), expected);
    }

    #[test]
    fn test_v2_model_requirement() {
        let v2 = SpawnModel::V2(ModelV2 {
            name: "ubuntu-2404".to_string(),
            model_type: ModelType::VirtualMachine,
        });
        let reqs = vec![Requirement::new(RequirementKind::Model, "m", "ubuntu-2404")];
        assert!(requirements_match(&v2, &reqs));
    }

    fn defaults() -> Vec<DefaultModelV2> {
        vec![
            DefaultModelV2 {
                worker_model_v2: "ubuntu".to_string(),
                binaries: vec!["git".to_string(), "docker".to_string()],
            },
            DefaultModelV2 {
                worker_model_v2: "alpine".to_string(),
                binaries: vec!["apk".to_string()],
            },
        ]
    }

    #[rstest]
    #[case(vec![], Some("ubuntu"))]
    #[case(vec!["apk"], Some("alpine"))]
    #[case(vec!["make", "docker"], Some("ubuntu"))]
    #[case(vec!["cargo"], None)]
    fn test_default_model_v2_name(#[case] binaries: Vec<&str>, #[case] expected: Option<&str>) {
        let reqs: Vec<Requirement> = binaries
            .into_iter()
            .map(|b| Requirement::new(RequirementKind::Binary, b, b))
            .collect();
        assert_eq!(default_model_v2_name(&defaults(), &reqs), expected);
    }

    #[test]
    fn test_default_model_v2_name_without_defaults() {
        assert_eq!(default_model_v2_name(&[], &[]), None);
    }
}
