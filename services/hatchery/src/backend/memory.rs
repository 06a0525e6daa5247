//! In-memory backend and event source for tests and local development.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hatchery_events::{EventFilter, StreamError, StreamEvent};
use hatchery_id::JobId;
use tokio::sync::mpsc;

use super::{EventSource, JobBackend};
use crate::error::BackendError;
use crate::model::{Job, Worker, WorkerModel};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Backend operations, used to inject failures and delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendOp {
    ListPendingJobs,
    GetJob,
    TakeJob,
    ListWorkers,
    GetWorkerModel,
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    workers: Vec<Worker>,
    models: BTreeMap<String, WorkerModel>,
    failures: BTreeMap<BackendOp, BackendError>,
    delays: BTreeMap<BackendOp, Duration>,
    list_since: Vec<Option<DateTime<Utc>>>,
    bookings: Vec<(JobId, String)>,
}

/// Backend holding jobs, workers and models in memory.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&self, job: Job) {
        lock(&self.state).jobs.insert(job.id, job);
    }

    pub fn remove_job(&self, id: JobId) {
        lock(&self.state).jobs.remove(&id);
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        lock(&self.state).jobs.get(&id).cloned()
    }

    pub fn add_worker(&self, worker: Worker) {
        lock(&self.state).workers.push(worker);
    }

    pub fn add_model(&self, model: WorkerModel) {
        lock(&self.state).models.insert(model.path(), model);
    }

    /// Make every call of `op` fail with `error`.
    pub fn fail(&self, op: BackendOp, error: BackendError) {
        lock(&self.state).failures.insert(op, error);
    }

    pub fn clear_failure(&self, op: BackendOp) {
        lock(&self.state).failures.remove(&op);
    }

    /// Make `op` take `delay` before it completes.
    pub fn delay(&self, op: BackendOp, delay: Duration) {
        lock(&self.state).delays.insert(op, delay);
    }

    /// `since` arguments of every pending-jobs listing, in order.
    pub fn list_calls(&self) -> Vec<Option<DateTime<Utc>>> {
        lock(&self.state).list_since.clone()
    }

    /// Successful bookings as `(job, hatchery)` pairs.
    pub fn bookings(&self) -> Vec<(JobId, String)> {
        lock(&self.state).bookings.clone()
    }

    async fn enter(&self, op: BackendOp) -> Result<(), BackendError> {
        let delay = {
            let state = lock(&self.state);
            if let Some(err) = state.failures.get(&op) {
                return Err(err.clone());
            }
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl JobBackend for InMemoryBackend {
    async fn list_pending_jobs(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Job>, BackendError> {
        lock(&self.state).list_since.push(since);
        self.enter(BackendOp::ListPendingJobs).await?;

        Ok(lock(&self.state)
            .jobs
            .values()
            .filter(|job| job.is_bookable())
            .filter(|job| since.is_none_or(|since| job.queued_at >= since))
            .cloned()
            .collect())
    }

    async fn get_job(&self, id: JobId) -> Result<Job, BackendError> {
        self.enter(BackendOp::GetJob).await?;
        lock(&self.state)
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("job {}", id)))
    }

    async fn take_job(&self, id: JobId, hatchery: &str) -> Result<Job, BackendError> {
        self.enter(BackendOp::TakeJob).await?;

        let mut state = lock(&self.state);
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| BackendError::NotFound(format!("job {}", id)))?;

        if let Some(owner) = &job.booked_by {
            return Err(BackendError::Rejected(format!(
                "job {} already booked by {}",
                id, owner
            )));
        }
        job.booked_by = Some(hatchery.to_string());
        let job = job.clone();
        state.bookings.push((id, hatchery.to_string()));
        Ok(job)
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, BackendError> {
        self.enter(BackendOp::ListWorkers).await?;
        Ok(lock(&self.state).workers.clone())
    }

    async fn get_worker_model(
        &self,
        group: &str,
        name: &str,
    ) -> Result<WorkerModel, BackendError> {
        self.enter(BackendOp::GetWorkerModel).await?;
        let path = format!("{}/{}", group, name);
        lock(&self.state)
            .models
            .get(&path)
            .cloned()
            .ok_or(BackendError::NotFound(format!("worker model {}", path)))
    }
}

/// Event source fed by an [`EventInjector`].
pub struct ChannelEventSource {
    injected: Mutex<Option<mpsc::UnboundedReceiver<Result<StreamEvent, StreamError>>>>,
    subscriptions: Arc<Mutex<Vec<Vec<EventFilter>>>>,
}

/// Test handle pushing events and transport errors into a
/// [`ChannelEventSource`].
#[derive(Clone)]
pub struct EventInjector {
    tx: mpsc::UnboundedSender<Result<StreamEvent, StreamError>>,
    subscriptions: Arc<Mutex<Vec<Vec<EventFilter>>>>,
}

impl ChannelEventSource {
    pub fn new() -> (Self, EventInjector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let source = Self {
            injected: Mutex::new(Some(rx)),
            subscriptions: subscriptions.clone(),
        };
        (source, EventInjector { tx, subscriptions })
    }
}

impl EventInjector {
    pub fn send_event(&self, event: StreamEvent) {
        let _ = self.tx.send(Ok(event));
    }

    pub fn send_error(&self, error: StreamError) {
        let _ = self.tx.send(Err(error));
    }

    /// Every filter set received so far, in order.
    pub fn subscriptions(&self) -> Vec<Vec<EventFilter>> {
        lock(&self.subscriptions).clone()
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn listen(
        &self,
        mut filters: mpsc::Receiver<Vec<EventFilter>>,
        events: mpsc::Sender<StreamEvent>,
        errors: mpsc::Sender<StreamError>,
    ) {
        let Some(mut injected) = lock(&self.injected).take() else {
            return;
        };
        let mut subscribed = false;

        loop {
            tokio::select! {
                set = filters.recv() => match set {
                    Some(set) => {
                        lock(&self.subscriptions).push(set);
                        subscribed = true;
                    }
                    None => return,
                },
                item = injected.recv(), if subscribed => match item {
                    Some(Ok(event)) => {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        subscribed = !error.should_resubscribe();
                        if errors.send(error).await.is_err() {
                            return;
                        }
                    }
                    None => subscribed = false,
                },
            }
        }
    }
}
