//! VM hatchery.
//!
//! Turns pending CI jobs into ephemeral worker instances and keeps the
//! instance fleet consistent with job demand and provider truth. Several
//! hatcheries may run against the same backlog; they coordinate only
//! through soft local claims and the backend's booking call.
//!
//! ## Architecture
//!
//! - **Intake** ([`intake`]): merges the event stream and a periodic queue
//!   poll into one channel of job IDs, deduplicated by pending claims
//! - **Spawn orchestration** ([`orchestrator`]): fetches, decides, books and
//!   starts a worker for each job
//! - **Reaper** ([`reaper`]): destroys disabled, expired and orphaned
//!   instances
//! - **Provisioning** ([`provisioning`]): keeps parked instances ready per
//!   configured model
//!
//! The backend and the compute provider are reached through the
//! [`backend::JobBackend`] and [`provider::ComputeProvider`] traits.

pub mod annotation;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod hatchery;
pub mod intake;
pub mod metrics;
pub mod model;
pub mod network;
pub mod orchestrator;
pub mod provider;
pub mod provisioning;
pub mod reaper;
pub mod spawn;
pub mod status;
pub mod worker;

pub use error::{BackendError, HatcheryError, HatcheryResult, ProviderError};
pub use hatchery::{Hatchery, Running};
