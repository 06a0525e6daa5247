//! Job backend and event stream abstractions.
//!
//! The backend owns the job queue, the worker registry and worker models.
//! The event source pushes job transitions so the hatchery does not have to
//! wait for the next poll to see new work.

mod http;
mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hatchery_events::{EventFilter, StreamError, StreamEvent};
use hatchery_id::JobId;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::model::{Job, Worker, WorkerModel};

pub use http::{status_error, HttpBackend, HttpEventSource};
pub use memory::{BackendOp, ChannelEventSource, EventInjector, InMemoryBackend};

/// Job queue and worker registry operations.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Jobs waiting for a worker, optionally only those queued at or after
    /// `since`.
    async fn list_pending_jobs(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Job>, BackendError>;

    /// Fetch the current state of one job.
    async fn get_job(&self, id: JobId) -> Result<Job, BackendError>;

    /// Book a job for this hatchery. Fails with [`BackendError::Rejected`]
    /// when another hatchery already booked it.
    async fn take_job(&self, id: JobId, hatchery: &str) -> Result<Job, BackendError>;

    /// All registered workers.
    async fn list_workers(&self) -> Result<Vec<Worker>, BackendError>;

    /// Fetch a v1 worker model by group and name.
    async fn get_worker_model(&self, group: &str, name: &str)
        -> Result<WorkerModel, BackendError>;
}

/// Push channel for backend events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Stream events until `filters` closes or `events` is dropped.
    ///
    /// Every filter set received replaces the current subscription. After a
    /// disconnection is reported on `errors`, the source waits for the filter
    /// set to be sent again before reconnecting.
    async fn listen(
        &self,
        filters: mpsc::Receiver<Vec<EventFilter>>,
        events: mpsc::Sender<StreamEvent>,
        errors: mpsc::Sender<StreamError>,
    );
}

/// Runs a backend call, failing with [`BackendError::Timeout`] once `limit`
/// elapses.
pub async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            operation,
            elapsed: limit,
        }),
    }
}
