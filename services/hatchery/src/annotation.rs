//! Instance annotations.
//!
//! The provider stores one free-form annotation string per instance. The
//! hatchery writes a JSON document there so that ownership, the job an
//! instance runs, and pool membership survive restarts. Instances created
//! by other tools carry arbitrary text, so decoding is lenient: anything
//! that is not our document reads as an empty annotation.

use chrono::{DateTime, Utc};
use hatchery_id::JobId;
use serde::{Deserialize, Deserializer, Serialize};

use crate::model::SpawnModel;

/// Typed view of the annotation the hatchery writes on its instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAnnotation {
    /// Name of the hatchery that created the instance.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hatchery_name: String,

    /// Job the instance was spawned for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    /// Worker name the instance registers under.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker_name: String,

    /// `group/name` path of a v1 model.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker_model_path: String,

    /// Name of a v2 model.
    #[serde(default, alias = "vmware_model_path", skip_serializing_if = "String::is_empty")]
    pub model_v2_path: String,

    /// Set on model templates and registration instances.
    #[serde(default)]
    pub model: bool,

    /// Set on instances created by the provisioning loop.
    #[serde(default)]
    pub provisioning: bool,

    /// Marks the instance for deletion by the next reaper pass.
    #[serde(default)]
    pub to_delete: bool,

    /// Last modification of the model when the instance was created.
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub worker_model_last_modified: Option<DateTime<Utc>>,

    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created: Option<DateTime<Utc>>,

    /// Set when the decoded document carried any hatchery key, whatever
    /// its value.
    #[serde(skip)]
    pub keyed: bool,
}

/// Keys the hatchery writes. Any one of them marks a document as ours.
const HATCHERY_KEYS: &[&str] = &[
    "hatchery_name",
    "job_id",
    "worker_name",
    "worker_model_path",
    "model_v2_path",
    "vmware_model_path",
    "model",
    "provisioning",
    "to_delete",
    "worker_model_last_modified",
    "created",
];

/// Accepts RFC 3339 text, or unix seconds as a number or a numeric string.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(i64),
        Text(String),
    }

    let seconds = |s: i64| {
        DateTime::from_timestamp(s, 0)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", s)))
    };

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Seconds(s)) => seconds(s),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => match text.trim().parse::<i64>() {
            Ok(s) => seconds(s),
            Err(_) => DateTime::parse_from_rfc3339(text.trim())
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        },
    }
}

impl InstanceAnnotation {
    /// Strict decode. An empty annotation is a valid empty document.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let keyed = value
            .as_object()
            .is_some_and(|map| HATCHERY_KEYS.iter().any(|key| map.contains_key(*key)));
        let mut annotation: Self = serde_json::from_value(value)?;
        annotation.keyed = keyed;
        Ok(annotation)
    }

    /// Decode, falling back to an empty annotation on malformed input.
    pub fn decode_lenient(instance: &str, raw: &str) -> Self {
        match Self::decode(raw) {
            Ok(annotation) => annotation,
            Err(e) => {
                tracing::debug!(
                    instance = %instance,
                    error = %e,
                    "ignoring unparseable instance annotation"
                );
                Self::default()
            }
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Annotation for a worker spawned to run `job_id`.
    pub fn for_worker(
        hatchery: &str,
        model: &SpawnModel,
        job_id: JobId,
        worker_name: &str,
    ) -> Self {
        let mut annotation = Self::for_model(hatchery, model);
        annotation.job_id = Some(job_id);
        annotation.worker_name = worker_name.to_string();
        annotation
    }

    /// Annotation for a provisioning-pool instance.
    pub fn for_provisioning(hatchery: &str, model: &SpawnModel) -> Self {
        let mut annotation = Self::for_model(hatchery, model);
        annotation.provisioning = true;
        annotation
    }

    fn for_model(hatchery: &str, model: &SpawnModel) -> Self {
        let mut annotation = Self {
            hatchery_name: hatchery.to_string(),
            worker_model_last_modified: model.last_modified(),
            created: Some(Utc::now()),
            keyed: true,
            ..Self::default()
        };
        if model.is_v2() {
            annotation.model_v2_path = model.path();
        } else {
            annotation.worker_model_path = model.path();
        }
        annotation
    }

    /// Returns true if the hatchery named `hatchery` manages this instance.
    ///
    /// Annotations written before names were recorded carry no name; those
    /// are ours if any hatchery key is set at all.
    pub fn is_owned_by(&self, hatchery: &str) -> bool {
        if !self.hatchery_name.is_empty() {
            return self.hatchery_name == hatchery;
        }
        self.keyed
    }

    /// Model path recorded on the instance, v1 or v2.
    pub fn model_path(&self) -> Option<&str> {
        if !self.worker_model_path.is_empty() {
            Some(&self.worker_model_path)
        } else if !self.model_v2_path.is_empty() {
            Some(&self.model_v2_path)
        } else {
            None
        }
    }

    /// Returns true if the recorded model modification time matches `at`
    /// to the second.
    pub fn built_at(&self, at: Option<DateTime<Utc>>) -> bool {
        match (self.worker_model_last_modified, at) {
            (Some(recorded), Some(at)) => recorded.timestamp() == at.timestamp(),
            _ => false,
        }
    }

    /// Returns true if the instance was built from `model`.
    pub fn matches_model(&self, model: &SpawnModel) -> bool {
        self.model_path() == Some(model.path().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelType, ModelV2, WorkerModel};

    fn v1_model() -> SpawnModel {
        SpawnModel::V1(WorkerModel {
            name: "debian".to_string(),
            group: "shared.infra".to_string(),
            model_type: ModelType::VirtualMachine,
            ..Default::default()
        })
    }

    #[test]
    fn test_job_id_accepts_string_and_integer() {
        let int = InstanceAnnotation::decode(r#"{"job_id": 7}"#).unwrap();
        let string = InstanceAnnotation::decode(r#"{"job_id": "7"}"#).unwrap();
        assert_eq!(int.job_id, Some(JobId::new(7)));
        assert_eq!(int, string);
    }

    #[test]
    fn test_last_modified_formats() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for raw in [
            r#"{"worker_model_last_modified": "1700000000"}"#,
            r#"{"worker_model_last_modified": 1700000000}"#,
            r#"{"worker_model_last_modified": "2023-11-14T22:13:20Z"}"#,
        ] {
            let annotation = InstanceAnnotation::decode(raw).unwrap();
            assert!(annotation.built_at(Some(at)), "{}", raw);
        }

        let empty = InstanceAnnotation::decode(r#"{"worker_model_last_modified": ""}"#).unwrap();
        assert!(!empty.built_at(Some(at)));
    }

    #[test]
    fn test_lenient_decode_of_foreign_annotation() {
        let annotation =
            InstanceAnnotation::decode_lenient("legacy-vm", "built by hand, do not touch");
        assert_eq!(annotation, InstanceAnnotation::default());
        assert!(!annotation.is_owned_by("hatch-a"));
    }

    #[test]
    fn test_ownership() {
        let model = v1_model();
        let ours = InstanceAnnotation::for_worker("hatch-a", &model, JobId::new(1), "debian-1");
        assert!(ours.is_owned_by("hatch-a"));
        assert!(!ours.is_owned_by("hatch-b"));

        let unnamed = InstanceAnnotation::decode(r#"{"provisioning": true}"#).unwrap();
        assert!(unnamed.is_owned_by("hatch-a"));
        assert!(!InstanceAnnotation::default().is_owned_by("hatch-a"));

        // Presence of a key is enough, even with a false value.
        let falsy = InstanceAnnotation::decode(r#"{"model": false}"#).unwrap();
        assert!(falsy.is_owned_by("hatch-a"));
        let foreign = InstanceAnnotation::decode(r#"{"owner": "ops"}"#).unwrap();
        assert!(!foreign.is_owned_by("hatch-a"));
    }

    #[test]
    fn test_model_paths() {
        let v1 = InstanceAnnotation::for_provisioning("hatch-a", &v1_model());
        assert!(v1.provisioning);
        assert_eq!(v1.model_path(), Some("shared.infra/debian"));
        assert!(v1.matches_model(&v1_model()));

        let v2_model = SpawnModel::V2(ModelV2 {
            name: "ubuntu-2404".to_string(),
            model_type: ModelType::VirtualMachine,
        });
        let v2 = InstanceAnnotation::for_provisioning("hatch-a", &v2_model);
        assert!(v2.worker_model_path.is_empty());
        assert_eq!(v2.model_path(), Some("ubuntu-2404"));
        assert!(!v2.matches_model(&v1_model()));
    }

    #[test]
    fn test_encode_skips_empty_fields() {
        let annotation = InstanceAnnotation {
            to_delete: true,
            ..Default::default()
        };
        let raw = annotation.encode();
        assert!(!raw.contains("job_id"));
        let decoded = InstanceAnnotation::decode(&raw).unwrap();
        assert!(decoded.to_delete);
        assert_eq!(decoded.job_id, None);
        assert!(decoded.is_owned_by("hatch-a"));
    }
}
