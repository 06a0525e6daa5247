//! Job intake.
//!
//! Merges the live event stream and a periodic snapshot poll of the backend
//! queue into one channel of job IDs to attempt. The two sources overlap on
//! purpose: stream delivery is best-effort, and the poll catches whatever
//! the stream missed. Duplicate suppression goes through the shared
//! [`PendingClaims`] set; no ordering is kept between the sources.

use std::sync::Arc;
use std::time::Duration;

use hatchery_events::{EventFilter, StreamError, StreamEvent};
use hatchery_id::JobId;
use hatchery_reconcile::{shrink_queue, PendingClaims};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{bounded, EventSource, JobBackend};
use crate::error::{HatcheryError, HatcheryResult};
use crate::metrics::{Counter, MetricsSink};
use crate::model::Job;
use crate::status::{LoopKind, PassClock};

/// Intake loop settings.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Time between queue snapshots.
    pub poll_interval: Duration,
    /// Concurrent spawn capacity; the retained queue window is twice this.
    pub capacity: usize,
    /// Bound on one queue snapshot.
    pub snapshot_timeout: Duration,
    /// Bound on fetching one job after a stream event.
    pub fetch_timeout: Duration,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            capacity: 10,
            snapshot_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Produces job IDs worth a spawn attempt.
pub struct QueuePoller {
    backend: Arc<dyn JobBackend>,
    events: Arc<dyn EventSource>,
    claims: Arc<PendingClaims>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<PassClock>,
    config: IntakeConfig,
}

impl QueuePoller {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        events: Arc<dyn EventSource>,
        claims: Arc<PendingClaims>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<PassClock>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            backend,
            events,
            claims,
            metrics,
            clock,
            config,
        }
    }

    /// Run until shutdown is signaled or the consumer goes away.
    ///
    /// `jobs` is dropped on return, so the consumer sees the channel close.
    #[instrument(skip_all, name = "intake")]
    pub async fn run(
        &self,
        jobs: mpsc::Sender<JobId>,
        errors: mpsc::Sender<HatcheryError>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            capacity = self.config.capacity,
            "Starting job intake"
        );

        let (filters_tx, filters_rx) = mpsc::channel::<Vec<EventFilter>>(4);
        let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(64);
        let (stream_err_tx, mut stream_err_rx) = mpsc::channel::<StreamError>(16);

        let source = self.events.clone();
        let listener = tokio::spawn(async move {
            source.listen(filters_rx, event_tx, stream_err_tx).await;
        });
        subscribe(&filters_tx).await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    match self.on_event(event).await {
                        Ok(Some(id)) => {
                            if !self.emit(&jobs, id).await {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(HatcheryError::Event(e)) => {
                            warn!(error = %e, "Skipping malformed job event");
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to fetch job from event");
                            report(&errors, e).await;
                        }
                    }
                }
                Some(err) = stream_err_rx.recv() => {
                    if err.should_resubscribe() {
                        info!(reason = %err, "Event stream dropped, resubscribing");
                        subscribe(&filters_tx).await;
                    } else {
                        warn!(error = %err, "Event stream error");
                        report(&errors, err.into()).await;
                    }
                }
                _ = ticker.tick() => {
                    match self.poll().await {
                        Ok(ids) => {
                            consecutive_failures = 0;
                            let mut open = true;
                            for id in ids {
                                if !self.emit(&jobs, id).await {
                                    open = false;
                                    break;
                                }
                            }
                            if !open {
                                break;
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures <= 3 {
                                warn!(error = %e, consecutive_failures, "Queue poll failed");
                            } else {
                                error!(
                                    error = %e,
                                    consecutive_failures,
                                    "Queue poll failed repeatedly"
                                );
                            }
                            if e.is_fatal() {
                                report(&errors, e).await;
                            }
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Job intake shutting down");
                        break;
                    }
                }
            }
        }

        drop(filters_tx);
        listener.abort();
    }

    /// Handle one stream event, returning the job to emit, if any.
    pub async fn on_event(&self, event: StreamEvent) -> HatcheryResult<Option<JobId>> {
        if !event.is_job_waiting() {
            return Ok(None);
        }
        self.metrics.incr(Counter::JobsReceivedStream, 1);

        let payload = event.decode_job()?;
        if self.claims.is_pending(payload.id) {
            return Ok(None);
        }

        let job = match bounded(
            "get_job",
            self.config.fetch_timeout,
            self.backend.get_job(payload.id),
        )
        .await
        {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                debug!(job_id = %payload.id, "Job vanished before fetch");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if !job.is_bookable() || !self.claims.try_claim(job.id) {
            return Ok(None);
        }
        Ok(Some(job.id))
    }

    /// Take one queue snapshot, returning the jobs to emit in rank order.
    pub async fn poll(&self) -> HatcheryResult<Vec<JobId>> {
        let released = self.claims.prune_expired();
        if released > 0 {
            info!(released, "Released expired pending claims");
        }

        let snapshot = bounded(
            "list_pending_jobs",
            self.config.snapshot_timeout,
            self.backend.list_pending_jobs(None),
        )
        .await?;
        self.metrics
            .incr(Counter::JobsReceivedPoll, snapshot.len() as u64);

        let fresh: Vec<Job> = snapshot
            .into_iter()
            .filter(|job| job.is_bookable() && !self.claims.is_pending(job.id))
            .collect();

        let shrunk = shrink_queue(&fresh, self.config.capacity);
        self.clock.record_low_water(shrunk.low_water);
        self.clock.record(LoopKind::Intake);

        if shrunk.dropped > 0 {
            debug!(
                retained = shrunk.retained.len(),
                dropped = shrunk.dropped,
                "Trimmed queue snapshot"
            );
        }

        Ok(shrunk
            .retained
            .iter()
            .filter(|job| self.claims.try_claim(job.id))
            .map(|job| job.id)
            .collect())
    }

    async fn emit(&self, jobs: &mpsc::Sender<JobId>, id: JobId) -> bool {
        if jobs.send(id).await.is_err() {
            // Nobody will ever act on it.
            self.claims.release(id);
            info!("Job consumer closed, stopping intake");
            return false;
        }
        self.metrics.incr(Counter::JobsEmitted, 1);
        debug!(job_id = %id, "Emitted job");
        true
    }
}

async fn subscribe(filters: &mpsc::Sender<Vec<EventFilter>>) {
    if filters.send(EventFilter::intake_set()).await.is_err() {
        warn!("Event listener stopped, continuing on polls only");
    }
}

async fn report(errors: &mpsc::Sender<HatcheryError>, err: HatcheryError) {
    if errors.send(err).await.is_err() {
        debug!("Error channel closed");
    }
}
