//! Identity types for the hatchery.
//!
//! This crate provides:
//! - `JobId`: the backend's opaque integer job identity
//! - `HatcheryId`: a prefixed ULID identifying one hatchery process
//! - Generated instance names for workers, provisioning-pool instances and
//!   model registration instances
//!
//! ## Invariants
//!
//! - A `JobId` decodes from either a JSON integer or a numeric JSON string,
//!   because instance annotations written by older hatcheries used strings
//! - Generated names are lowercase and unique (ULID suffix)
//!
//! ## Name Format
//!
//! - Worker: `{model}-{ulid}`
//! - Provisioning pool: `provision-{ulid}`
//! - Registration: `register-{model}-{ulid}`
//! - Model build scratch instance: `{model}-tmp`

mod error;
pub mod names;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
