//! In-memory provider for tests and local development.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{CloneSpec, ComputeProvider, PowerState, ProviderInstance};
use crate::error::ProviderError;
use crate::model::ModelType;

/// Provider operations, used to inject failures and delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderOp {
    List,
    Clone,
    PowerOn,
    Shutdown,
    Destroy,
    Rename,
    SetAnnotation,
    WaitForAddress,
    LastStartEvent,
}

/// A call recorded by [`InMemoryProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    List,
    Clone { template: String, name: String },
    PowerOn(String),
    Shutdown(String),
    Destroy(String),
    Rename { from: String, to: String },
    SetAnnotation(String),
    WaitForAddress(String),
    LastStartEvent(String),
}

impl ProviderCall {
    /// Instance the call targeted, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            ProviderCall::List => None,
            ProviderCall::Clone { name, .. } => Some(name),
            ProviderCall::Rename { from, .. } => Some(from),
            ProviderCall::PowerOn(name)
            | ProviderCall::Shutdown(name)
            | ProviderCall::Destroy(name)
            | ProviderCall::SetAnnotation(name)
            | ProviderCall::WaitForAddress(name)
            | ProviderCall::LastStartEvent(name) => Some(name),
        }
    }
}

#[derive(Default)]
struct State {
    instances: BTreeMap<String, ProviderInstance>,
    started_at: BTreeMap<String, DateTime<Utc>>,
    calls: Vec<ProviderCall>,
    failures: BTreeSet<(ProviderOp, Option<String>)>,
    delays: BTreeMap<ProviderOp, Duration>,
    next_host: u32,
}

/// Provider that keeps instances in memory and records every call.
pub struct InMemoryProvider {
    model_type: ModelType,
    state: Mutex<State>,
}

impl InMemoryProvider {
    /// Create an empty virtual machine provider.
    pub fn new() -> Self {
        Self::with_model_type(ModelType::VirtualMachine)
    }

    pub fn with_model_type(model_type: ModelType) -> Self {
        Self {
            model_type,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace an instance.
    pub fn insert(&self, instance: ProviderInstance) {
        self.lock().instances.insert(instance.name.clone(), instance);
    }

    /// Record a power-on event time for an instance.
    pub fn set_started_at(&self, name: &str, at: DateTime<Utc>) {
        self.lock().started_at.insert(name.to_string(), at);
    }

    /// Make `op` fail, for one instance or for all of them.
    pub fn fail(&self, op: ProviderOp, name: Option<&str>) {
        self.lock()
            .failures
            .insert((op, name.map(str::to_string)));
    }

    /// Make `op` take `delay` before it completes.
    pub fn delay(&self, op: ProviderOp, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    pub fn instance(&self, name: &str) -> Option<ProviderInstance> {
        self.lock().instances.get(name).cloned()
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.lock().instances.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Calls that targeted `name`, in order.
    pub fn calls_for(&self, name: &str) -> Vec<ProviderCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.target() == Some(name))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    async fn enter(&self, op: ProviderOp, call: ProviderCall) -> Result<(), ProviderError> {
        let delay = {
            let mut state = self.lock();
            let target = call.target().map(str::to_string);
            state.calls.push(call);

            if state.failures.contains(&(op, None))
                || state.failures.contains(&(op, target.clone()))
            {
                return Err(ProviderError::Api(format!(
                    "injected {:?} failure for {}",
                    op,
                    target.as_deref().unwrap_or("*")
                )));
            }
            state.delays.get(&op).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(name: &str) -> ProviderError {
    ProviderError::NotFound(name.to_string())
}

#[async_trait]
impl ComputeProvider for InMemoryProvider {
    fn model_type(&self) -> ModelType {
        self.model_type
    }

    async fn list_instances(&self) -> Result<Vec<ProviderInstance>, ProviderError> {
        self.enter(ProviderOp::List, ProviderCall::List).await?;
        Ok(self.lock().instances.values().cloned().collect())
    }

    async fn clone_instance(
        &self,
        template: &str,
        spec: &CloneSpec,
    ) -> Result<ProviderInstance, ProviderError> {
        self.enter(
            ProviderOp::Clone,
            ProviderCall::Clone {
                template: template.to_string(),
                name: spec.name.clone(),
            },
        )
        .await?;

        let mut state = self.lock();
        match state.instances.get(template) {
            Some(t) if t.is_template => {}
            _ => return Err(not_found(template)),
        }
        if state.instances.contains_key(&spec.name) {
            return Err(ProviderError::Refused(format!(
                "instance {} already exists",
                spec.name
            )));
        }

        let instance = ProviderInstance {
            name: spec.name.clone(),
            is_template: false,
            power_state: PowerState::PoweredOff,
            annotation: spec.annotation.clone(),
            address: spec.network.as_ref().map(|n| n.address),
        };
        state.instances.insert(spec.name.clone(), instance.clone());
        info!(template = %template, instance = %spec.name, "Cloned instance");
        Ok(instance)
    }

    async fn power_on(&self, name: &str) -> Result<(), ProviderError> {
        self.enter(ProviderOp::PowerOn, ProviderCall::PowerOn(name.to_string()))
            .await?;

        let mut state = self.lock();
        let host = state.next_host;
        let instance = state.instances.get_mut(name).ok_or_else(|| not_found(name))?;
        instance.power_state = PowerState::PoweredOn;
        if instance.address.is_none() {
            instance.address = Some(Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 254, 0, 1)) + host));
            state.next_host += 1;
        }
        state.started_at.insert(name.to_string(), Utc::now());
        Ok(())
    }

    async fn shutdown_instance(&self, name: &str) -> Result<(), ProviderError> {
        self.enter(ProviderOp::Shutdown, ProviderCall::Shutdown(name.to_string()))
            .await?;

        let mut state = self.lock();
        let instance = state.instances.get_mut(name).ok_or_else(|| not_found(name))?;
        instance.power_state = PowerState::PoweredOff;
        Ok(())
    }

    async fn destroy_instance(&self, name: &str) -> Result<(), ProviderError> {
        self.enter(ProviderOp::Destroy, ProviderCall::Destroy(name.to_string()))
            .await?;

        let mut state = self.lock();
        let instance = state.instances.get(name).ok_or_else(|| not_found(name))?;
        if instance.is_powered_on() {
            return Err(ProviderError::Refused(format!(
                "instance {} is powered on",
                name
            )));
        }
        state.instances.remove(name);
        state.started_at.remove(name);
        Ok(())
    }

    async fn rename_instance(&self, name: &str, new_name: &str) -> Result<(), ProviderError> {
        self.enter(
            ProviderOp::Rename,
            ProviderCall::Rename {
                from: name.to_string(),
                to: new_name.to_string(),
            },
        )
        .await?;

        let mut state = self.lock();
        if state.instances.contains_key(new_name) {
            return Err(ProviderError::Refused(format!(
                "instance {} already exists",
                new_name
            )));
        }
        let mut instance = state.instances.remove(name).ok_or_else(|| not_found(name))?;
        instance.name = new_name.to_string();
        state.instances.insert(new_name.to_string(), instance);
        if let Some(started) = state.started_at.remove(name) {
            state.started_at.insert(new_name.to_string(), started);
        }
        Ok(())
    }

    async fn set_annotation(&self, name: &str, annotation: &str) -> Result<(), ProviderError> {
        self.enter(
            ProviderOp::SetAnnotation,
            ProviderCall::SetAnnotation(name.to_string()),
        )
        .await?;

        let mut state = self.lock();
        let instance = state.instances.get_mut(name).ok_or_else(|| not_found(name))?;
        instance.annotation = annotation.to_string();
        Ok(())
    }

    async fn wait_for_address(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Ipv4Addr, ProviderError> {
        self.enter(
            ProviderOp::WaitForAddress,
            ProviderCall::WaitForAddress(name.to_string()),
        )
        .await?;

        let state = self.lock();
        let instance = state.instances.get(name).ok_or_else(|| not_found(name))?;
        match (instance.power_state, instance.address) {
            (PowerState::PoweredOn, Some(address)) => Ok(address),
            _ => Err(ProviderError::Timeout {
                operation: "wait_for_address",
                elapsed: timeout,
            }),
        }
    }

    async fn last_start_event(
        &self,
        name: &str,
    ) -> Result<Option<DateTime<Utc>>, ProviderError> {
        self.enter(
            ProviderOp::LastStartEvent,
            ProviderCall::LastStartEvent(name.to_string()),
        )
        .await?;

        Ok(self.lock().started_at.get(name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> CloneSpec {
        CloneSpec {
            name: name.to_string(),
            annotation: String::new(),
            network: None,
        }
    }

    #[tokio::test]
    async fn test_clone_requires_template() {
        let provider = InMemoryProvider::new();
        provider.insert(ProviderInstance::new("debian"));

        let result = provider.clone_instance("debian", &spec("w1")).await;
        assert_eq!(result, Err(ProviderError::NotFound("debian".into())));

        provider.insert(ProviderInstance::template("debian"));
        let clone = provider.clone_instance("debian", &spec("w1")).await.unwrap();
        assert_eq!(clone.power_state, PowerState::PoweredOff);
    }

    #[tokio::test]
    async fn test_destroy_refuses_running_instance() {
        let provider = InMemoryProvider::new();
        provider.insert(ProviderInstance::new("w1").with_power_state(PowerState::PoweredOn));

        assert!(matches!(
            provider.destroy_instance("w1").await,
            Err(ProviderError::Refused(_))
        ));

        provider.shutdown_instance("w1").await.unwrap();
        provider.destroy_instance("w1").await.unwrap();
        assert!(provider.instance("w1").is_none());
    }

    #[tokio::test]
    async fn test_power_on_assigns_address_and_start_event() {
        let provider = InMemoryProvider::new();
        provider.insert(ProviderInstance::new("w1"));

        provider.power_on("w1").await.unwrap();
        let address = provider
            .wait_for_address("w1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(address, Ipv4Addr::new(10, 254, 0, 1));
        assert!(provider.last_start_event("w1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rename_keeps_start_event() {
        let provider = InMemoryProvider::new();
        provider.insert(ProviderInstance::new("provision-1"));
        provider.power_on("provision-1").await.unwrap();

        provider.rename_instance("provision-1", "debian-1").await.unwrap();
        assert!(provider.instance("provision-1").is_none());
        assert!(provider.last_start_event("debian-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_injected_failure_is_recorded() {
        let provider = InMemoryProvider::new();
        provider.insert(ProviderInstance::new("w1"));
        provider.insert(ProviderInstance::new("w2"));
        provider.fail(ProviderOp::Shutdown, Some("w1"));

        assert!(provider.shutdown_instance("w1").await.is_err());
        assert!(provider.shutdown_instance("w2").await.is_ok());
        assert_eq!(
            provider.calls_for("w1"),
            vec![ProviderCall::Shutdown("w1".into())]
        );
    }
}
