//! Operator status report.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use hatchery_id::names::is_provision_name;
use serde::Serialize;

use crate::metrics::Counter;
use crate::provider::ProviderInstance;

/// The periodic loops whose last completed pass is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopKind {
    Intake,
    Reaper,
    Provisioning,
}

#[derive(Default)]
struct ClockState {
    passes: BTreeMap<LoopKind, DateTime<Utc>>,
    oldest_retained_job: Option<DateTime<Utc>>,
}

/// Timestamps of the last completed pass of each loop.
#[derive(Default)]
pub struct PassClock {
    state: Mutex<ClockState>,
}

impl PassClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, kind: LoopKind) {
        self.lock().passes.insert(kind, Utc::now());
    }

    pub fn last(&self, kind: LoopKind) -> Option<DateTime<Utc>> {
        self.lock().passes.get(&kind).copied()
    }

    /// Record the low-water mark of the last shrunk queue.
    pub fn record_low_water(&self, low_water: Option<DateTime<Utc>>) {
        self.lock().oldest_retained_job = low_water;
    }

    pub fn low_water(&self) -> Option<DateTime<Utc>> {
        self.lock().oldest_retained_job
    }
}

/// Snapshot of the hatchery served on `/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub hatchery: String,
    /// Non-template instances owned by this hatchery.
    pub instances: usize,
    pub templates: usize,
    /// Owned instances running or waiting for a job.
    pub workers: usize,
    pub provisioned_unclaimed: usize,
    pub pending_deletion: usize,
    pub pending_claims: usize,
    pub last_intake_poll: Option<DateTime<Utc>>,
    pub last_reaper_pass: Option<DateTime<Utc>>,
    pub last_provisioning_pass: Option<DateTime<Utc>>,
    pub oldest_retained_job: Option<DateTime<Utc>>,
    pub counters: BTreeMap<Counter, u64>,
    /// Set when the inventory could not be listed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_error: Option<String>,
}

impl StatusReport {
    pub fn new(hatchery: impl Into<String>, clock: &PassClock) -> Self {
        Self {
            hatchery: hatchery.into(),
            last_intake_poll: clock.last(LoopKind::Intake),
            last_reaper_pass: clock.last(LoopKind::Reaper),
            last_provisioning_pass: clock.last(LoopKind::Provisioning),
            oldest_retained_job: clock.low_water(),
            ..Self::default()
        }
    }

    /// Fill inventory counts from a provider listing. `queued` is the
    /// number of names waiting in the deletion queue.
    pub fn count_inventory(&mut self, instances: &[ProviderInstance], queued: usize) {
        let mut marked = 0;
        for instance in instances {
            if instance.is_template {
                self.templates += 1;
                continue;
            }
            let annotation = instance.annotation();
            if !annotation.is_owned_by(&self.hatchery) {
                continue;
            }
            self.instances += 1;
            if annotation.to_delete {
                marked += 1;
            } else if annotation.provisioning && is_provision_name(&instance.name) {
                self.provisioned_unclaimed += 1;
            } else if !annotation.model {
                self.workers += 1;
            }
        }
        self.pending_deletion = marked + queued;
    }
}
