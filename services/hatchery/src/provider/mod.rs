//! Compute provider abstraction.
//!
//! A provider knows instances only by name and exposes the handful of
//! operations the hatchery needs: list, clone from a template, power
//! management, destroy, and annotation updates. Every call made through
//! [`bounded`] is cut off after a timeout so that a hung provider cannot
//! stall a loop.

mod memory;

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hatchery_networking::NetworkIdentity;
use serde::Serialize;

use crate::annotation::InstanceAnnotation;
use crate::error::ProviderError;
use crate::model::ModelType;

pub use memory::{InMemoryProvider, ProviderCall, ProviderOp};

/// Power state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    Unknown,
}

/// An instance (or template) as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInstance {
    pub name: String,
    pub is_template: bool,
    pub power_state: PowerState,
    /// Raw annotation text.
    pub annotation: String,
    pub address: Option<Ipv4Addr>,
}

impl ProviderInstance {
    /// A powered-off instance with no annotation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_template: false,
            power_state: PowerState::PoweredOff,
            annotation: String::new(),
            address: None,
        }
    }

    /// A template instance.
    pub fn template(name: impl Into<String>) -> Self {
        Self {
            is_template: true,
            ..Self::new(name)
        }
    }

    pub fn with_annotation(mut self, annotation: &InstanceAnnotation) -> Self {
        self.annotation = annotation.encode();
        self
    }

    pub fn with_power_state(mut self, state: PowerState) -> Self {
        self.power_state = state;
        self
    }

    pub fn with_address(mut self, address: Ipv4Addr) -> Self {
        self.address = Some(address);
        self
    }

    /// Typed annotation, empty if the text is not ours.
    pub fn annotation(&self) -> InstanceAnnotation {
        InstanceAnnotation::decode_lenient(&self.name, &self.annotation)
    }

    pub fn is_powered_on(&self) -> bool {
        self.power_state == PowerState::PoweredOn
    }
}

/// Parameters of a template clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSpec {
    /// Name of the new instance.
    pub name: String,
    /// Annotation text written on the clone.
    pub annotation: String,
    /// Static network identity; `None` lets the provider assign one.
    pub network: Option<NetworkIdentity>,
}

/// Operations the hatchery needs from a compute provider.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// The model type this provider can run.
    fn model_type(&self) -> ModelType;

    /// List all instances and templates.
    async fn list_instances(&self) -> Result<Vec<ProviderInstance>, ProviderError>;

    /// Clone `template` into a new powered-off instance with the network
    /// identity applied.
    async fn clone_instance(
        &self,
        template: &str,
        spec: &CloneSpec,
    ) -> Result<ProviderInstance, ProviderError>;

    async fn power_on(&self, name: &str) -> Result<(), ProviderError>;

    /// Power the instance off. Powering off an instance that is already off
    /// is not an error.
    async fn shutdown_instance(&self, name: &str) -> Result<(), ProviderError>;

    /// Destroy a powered-off instance.
    async fn destroy_instance(&self, name: &str) -> Result<(), ProviderError>;

    /// Rename an instance.
    async fn rename_instance(&self, name: &str, new_name: &str) -> Result<(), ProviderError>;

    /// Replace the annotation text of an instance.
    async fn set_annotation(&self, name: &str, annotation: &str) -> Result<(), ProviderError>;

    /// Wait until the instance reports an address.
    async fn wait_for_address(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Ipv4Addr, ProviderError>;

    /// Time of the most recent power-on of the instance, if known.
    async fn last_start_event(&self, name: &str)
        -> Result<Option<DateTime<Utc>>, ProviderError>;
}

/// Runs a provider call, failing with [`ProviderError::Timeout`] once
/// `limit` elapses.
pub async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            operation,
            elapsed: limit,
        }),
    }
}

/// Finds a template by name.
pub fn find_template<'a>(
    instances: &'a [ProviderInstance],
    name: &str,
) -> Option<&'a ProviderInstance> {
    instances.iter().find(|i| i.is_template && i.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        };
        let result: Result<(), ProviderError> =
            bounded("list_instances", Duration::from_secs(5), slow).await;

        assert!(matches!(
            result,
            Err(ProviderError::Timeout {
                operation: "list_instances",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded("power_on", Duration::from_secs(5), async {
            Err::<(), _>(ProviderError::NotFound("vm".into()))
        })
        .await;
        assert_eq!(result, Err(ProviderError::NotFound("vm".into())));
    }

    #[test]
    fn test_find_template_ignores_instances() {
        let instances = vec![
            ProviderInstance::new("debian"),
            ProviderInstance::template("debian"),
        ];
        assert!(find_template(&instances, "debian").unwrap().is_template);
        assert!(find_template(&instances, "ubuntu").is_none());
    }
}
