//! Backend domain types: jobs, requirements, worker models and workers.

use chrono::{DateTime, Utc};
use hatchery_id::JobId;
use hatchery_reconcile::QueueEntry;
use serde::{Deserialize, Serialize};

use crate::error::HatcheryError;

// ============================================================================
// Jobs
// ============================================================================

/// Job state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum JobStatus {
    Waiting,
    Building,
    Success,
    Fail,
    Stopped,
    #[serde(other)]
    Unknown,
}

/// Kind of a job requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    Model,
    Binary,
    Service,
    Memory,
    Hostname,
    Os,
    Arch,
    #[serde(other)]
    Other,
}

impl RequirementKind {
    /// Kinds a VM hatchery can never satisfy.
    pub fn is_unsupported(self) -> bool {
        matches!(
            self,
            RequirementKind::Service | RequirementKind::Memory | RequirementKind::Hostname
        )
    }
}

/// A constraint a job places on the worker that runs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RequirementKind,
    pub value: String,
}

impl Requirement {
    pub fn new(kind: RequirementKind, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            value: value.into(),
        }
    }
}

/// A pending job as listed or fetched from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub priority: i64,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booked_by: Option<String>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

impl Job {
    /// A waiting job with no requirements.
    pub fn waiting(id: JobId, priority: i64, queued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Waiting,
            priority,
            queued_at,
            booked_by: None,
            requirements: Vec::new(),
        }
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Returns true if the job can still be booked by someone.
    pub fn is_bookable(&self) -> bool {
        self.status == JobStatus::Waiting && self.booked_by.is_none()
    }

    /// The model requirement, if the job names one.
    pub fn model_requirement(&self) -> Option<&Requirement> {
        self.requirements
            .iter()
            .find(|r| r.kind == RequirementKind::Model)
    }
}

impl QueueEntry for Job {
    fn priority(&self) -> i64 {
        self.priority
    }

    fn queued_at(&self) -> DateTime<Utc> {
        self.queued_at
    }
}

// ============================================================================
// Worker models
// ============================================================================

/// Kind of compute a model runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    VirtualMachine,
    Container,
    BareMetal,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A registered worker model (v1): a named template within a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerModel {
    pub name: String,
    pub group: String,
    #[serde(rename = "type", default)]
    pub model_type: ModelType,
    /// Template image the provider clones. Defaults to the model name.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub post_cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl WorkerModel {
    /// `group/name` path identifying the model.
    pub fn path(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }

    /// Name of the provider template backing this model.
    pub fn template_name(&self) -> &str {
        if self.image.is_empty() {
            &self.name
        } else {
            &self.image
        }
    }
}

/// Splits a `group/name` model path.
pub fn split_model_path(path: &str) -> Result<(&str, &str), HatcheryError> {
    match path.split_once('/') {
        Some((group, name)) if !group.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((group, name))
        }
        _ => Err(HatcheryError::InvalidModelPath(path.to_string())),
    }
}

/// A versioned model reference (v2): the template name is the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelV2 {
    pub name: String,
    #[serde(rename = "type", default)]
    pub model_type: ModelType,
}

/// The model a worker is spawned from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnModel {
    V1(WorkerModel),
    V2(ModelV2),
}

impl SpawnModel {
    /// Short name used to derive instance names.
    pub fn name(&self) -> &str {
        match self {
            SpawnModel::V1(m) => &m.name,
            SpawnModel::V2(m) => &m.name,
        }
    }

    /// Path recorded in instance annotations.
    pub fn path(&self) -> String {
        match self {
            SpawnModel::V1(m) => m.path(),
            SpawnModel::V2(m) => m.name.clone(),
        }
    }

    pub fn template_name(&self) -> &str {
        match self {
            SpawnModel::V1(m) => m.template_name(),
            SpawnModel::V2(m) => &m.name,
        }
    }

    pub fn model_type(&self) -> ModelType {
        match self {
            SpawnModel::V1(m) => m.model_type,
            SpawnModel::V2(m) => m.model_type,
        }
    }

    pub fn is_v2(&self) -> bool {
        matches!(self, SpawnModel::V2(_))
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        match self {
            SpawnModel::V1(m) => m.last_modified,
            SpawnModel::V2(_) => None,
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

/// Worker state in the backend registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum WorkerStatus {
    Waiting,
    Building,
    Checking,
    Registering,
    Disabled,
    #[serde(other)]
    Unknown,
}

/// A worker registered with the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
}

impl Worker {
    pub fn new(name: impl Into<String>, status: WorkerStatus) -> Self {
        Self {
            name: name.into(),
            status,
            model_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_wire_format() {
        let json = r#"{
            "id": "42",
            "status": "Waiting",
            "queued_at": "2026-01-01T00:00:00Z",
            "requirements": [
                {"name": "debian", "type": "model", "value": "shared.infra/debian"},
                {"name": "pg", "type": "service", "value": "postgres:16"},
                {"name": "gpu", "type": "accelerator", "value": "a100"}
            ]
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();
        assert_eq!(job.id, JobId::new(42));
        assert_eq!(job.priority, 0);
        assert!(job.is_bookable());
        assert_eq!(job.requirements[2].kind, RequirementKind::Other);
        assert_eq!(
            job.model_requirement().map(|r| r.value.as_str()),
            Some("shared.infra/debian")
        );
    }

    #[test]
    fn test_unknown_status_is_not_bookable() {
        let json = r#"{"id": 1, "status": "Crashed", "queued_at": "2026-01-01T00:00:00Z"}"#;
        let job: Job = serde_json::from_str(json).unwrap();
        assert_eq!(job.status, JobStatus::Unknown);
        assert!(!job.is_bookable());
    }

    #[test]
    fn test_booked_job_is_not_bookable() {
        let mut job = Job::waiting(JobId::new(1), 0, Utc::now());
        job.booked_by = Some("other-hatchery".to_string());
        assert!(!job.is_bookable());
    }

    #[test]
    fn test_split_model_path() {
        assert_eq!(
            split_model_path("shared.infra/debian").unwrap(),
            ("shared.infra", "debian")
        );
        assert!(split_model_path("debian").is_err());
        assert!(split_model_path("/debian").is_err());
        assert!(split_model_path("a/b/c").is_err());
    }

    #[test]
    fn test_template_name_falls_back_to_model_name() {
        let mut model = WorkerModel {
            name: "debian".to_string(),
            group: "shared.infra".to_string(),
            model_type: ModelType::VirtualMachine,
            ..Default::default()
        };
        assert_eq!(model.template_name(), "debian");

        model.image = "debian-12-base".to_string();
        assert_eq!(model.template_name(), "debian-12-base");
        assert_eq!(SpawnModel::V1(model).path(), "shared.infra/debian");
    }
}
