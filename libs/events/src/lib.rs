//! # hatchery-events
//!
//! Types for the backend's live event stream as seen by a hatchery.
//!
//! ## Delivery Model
//!
//! - The stream is best-effort: events can be lost and are never redelivered
//! - Subscribers declare a filter set; the backend only pushes matching events
//! - A subscription that drops abnormally is re-established by re-sending the
//!   filter set, not by reconnecting from a cursor
//!
//! Because delivery is not guaranteed, every consumer of this stream also
//! polls the backend queue. This crate only models the stream side.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
