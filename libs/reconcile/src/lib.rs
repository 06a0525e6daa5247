//! Reconciliation primitives for the hatchery.
//!
//! Several hatchery processes can watch the same job backlog and the same
//! compute provider. None of them holds a lock; instead each keeps soft,
//! process-local reservations and lets the backend arbitrate bookings.
//! This library provides the pieces of that scheme that are independent of
//! any transport:
//!
//! - **Queue shrinking**: bound a pending-job snapshot to what this process
//!   can actually start, oldest and most urgent first.
//! - **Pending claims**: remember which jobs were already handed to the
//!   spawn path so they are not announced twice.
//! - **Expiring sets**: short-lived caches that forget entries on a rolling
//!   basis.
//! - **Pool arithmetic**: how many pre-warmed instances are missing.
//!
//! # Invariants
//!
//! - Shrinking is deterministic given the same input and never mutates it
//! - A claimed job is not claimable again until released or expired
//! - Check-and-insert on claims is atomic

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hatchery_id::JobId;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned cache is still a valid cache: entries are plain values.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Queue Shrinking
// =============================================================================

/// An entry of the pending-job queue as far as ordering is concerned.
pub trait QueueEntry {
    /// Lower values are served first.
    fn priority(&self) -> i64;

    /// When the job entered the queue.
    fn queued_at(&self) -> DateTime<Utc>;
}

/// Result of shrinking a queue snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ShrunkQueue<T> {
    /// Retained entries, in service order.
    pub retained: Vec<T>,

    /// Oldest `queued_at` among the retained entries.
    pub low_water: Option<DateTime<Utc>>,

    /// Number of entries dropped by truncation.
    pub dropped: usize,
}

/// Number of entries kept for a given spawn capacity.
///
/// The capacity is clamped to at least one and doubled, so that churn
/// between two polls (jobs booked by other hatcheries) still leaves work.
pub fn retained_window(capacity: usize) -> usize {
    capacity.max(1) * 2
}

/// Sort a snapshot by priority then age, and keep the first
/// [`retained_window`] entries.
///
/// Operates on a private copy of the input.
pub fn shrink_queue<T>(queue: &[T], capacity: usize) -> ShrunkQueue<T>
where
    T: QueueEntry + Clone,
{
    let mut retained = queue.to_vec();

    // `sort_by` is stable: ties keep their snapshot order.
    retained.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| a.queued_at().cmp(&b.queued_at()))
    });

    let window = retained_window(capacity);
    let dropped = retained.len().saturating_sub(window);
    retained.truncate(window);

    let low_water = retained.iter().map(QueueEntry::queued_at).min();

    ShrunkQueue {
        retained,
        low_water,
        dropped,
    }
}

// =============================================================================
// Pending Claims
// =============================================================================

/// Jobs this process has offered to the spawn path and not yet resolved.
///
/// Entries are removed by the caller once the backend gives a definitive
/// booking answer. An optional expiry bounds how long an unresolved entry
/// can block a job, so a backend outage cannot pin jobs forever.
#[derive(Debug)]
pub struct PendingClaims {
    entries: Mutex<BTreeMap<JobId, Instant>>,
    expiry: Option<Duration>,
}

impl PendingClaims {
    /// Create a tracker. `None` disables expiry.
    pub fn new(expiry: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            expiry,
        }
    }

    /// Returns true if the job is currently claimed.
    pub fn is_pending(&self, job_id: JobId) -> bool {
        self.is_pending_at(job_id, Instant::now())
    }

    fn is_pending_at(&self, job_id: JobId, now: Instant) -> bool {
        let entries = lock(&self.entries);
        match entries.get(&job_id) {
            Some(inserted) => !self.is_expired(*inserted, now),
            None => false,
        }
    }

    /// Record a claim and return the number of claims held.
    ///
    /// An existing live claim keeps its original insertion time.
    pub fn mark_pending(&self, job_id: JobId) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let expired = entries
            .get(&job_id)
            .is_some_and(|inserted| self.is_expired(*inserted, now));
        if expired || !entries.contains_key(&job_id) {
            entries.insert(job_id, now);
        }
        entries.len()
    }

    /// Claim the job if nobody holds a live claim on it.
    ///
    /// Returns true if this call created the claim.
    pub fn try_claim(&self, job_id: JobId) -> bool {
        self.try_claim_at(job_id, Instant::now())
    }

    fn try_claim_at(&self, job_id: JobId, now: Instant) -> bool {
        let mut entries = lock(&self.entries);
        if let Some(inserted) = entries.get(&job_id) {
            if !self.is_expired(*inserted, now) {
                return false;
            }
        }
        entries.insert(job_id, now);
        true
    }

    /// Drop the claim once booking succeeded or was rejected.
    pub fn release(&self, job_id: JobId) -> bool {
        lock(&self.entries).remove(&job_id).is_some()
    }

    /// Remove expired claims and return how many were dropped.
    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(Instant::now())
    }

    fn prune_expired_at(&self, now: Instant) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, inserted| !self.is_expired(*inserted, now));
        before - entries.len()
    }

    /// Number of claims held, including ones not yet pruned.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, inserted: Instant, now: Instant) -> bool {
        match self.expiry {
            Some(expiry) => now.saturating_duration_since(inserted) >= expiry,
            None => false,
        }
    }
}

impl Default for PendingClaims {
    fn default() -> Self {
        Self::new(Some(DEFAULT_CLAIM_EXPIRY))
    }
}

// =============================================================================
// Expiring Set
// =============================================================================

/// A set whose entries disappear `ttl` after insertion.
#[derive(Debug)]
pub struct ExpiringSet<K> {
    entries: Mutex<BTreeMap<K, Instant>>,
    ttl: Duration,
}

impl<K: Ord + Clone> ExpiringSet<K> {
    /// Create a set with the given entry lifetime.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            ttl,
        }
    }

    /// Returns true if `key` was inserted less than `ttl` ago.
    pub fn contains(&self, key: &K) -> bool {
        self.contains_at(key, Instant::now())
    }

    fn contains_at(&self, key: &K, now: Instant) -> bool {
        let mut entries = lock(&self.entries);
        entries.retain(|_, inserted| now.saturating_duration_since(*inserted) < self.ttl);
        entries.contains_key(key)
    }

    /// Insert `key`, refreshing its lifetime. Returns false if it was live.
    pub fn insert(&self, key: K) -> bool {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let live = entries
            .get(&key)
            .is_some_and(|inserted| now.saturating_duration_since(*inserted) < self.ttl);
        entries.insert(key, now);
        !live
    }

    /// Insert `key` unless it is live. Returns true if inserted.
    pub fn insert_if_absent(&self, key: K) -> bool {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        entries.retain(|_, inserted| now.saturating_duration_since(*inserted) < self.ttl);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, now);
        true
    }

    pub fn remove(&self, key: &K) -> bool {
        lock(&self.entries).remove(key).is_some()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .values()
            .filter(|inserted| now.saturating_duration_since(**inserted) < self.ttl)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Pool Arithmetic
// =============================================================================

/// Number of instances to create so that `ready + in_flight` reaches
/// `desired`, never more than `max_per_pass`.
pub fn pool_deficit(desired: u32, ready: u32, in_flight: u32, max_per_pass: u32) -> u32 {
    desired
        .saturating_sub(ready.saturating_add(in_flight))
        .min(max_per_pass)
}

/// Default interval between two reaper passes.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval between two provisioning passes.
pub const DEFAULT_PROVISIONING_INTERVAL: Duration = Duration::from_secs(60);

/// Default expiry of a pending claim with no booking answer.
pub const DEFAULT_CLAIM_EXPIRY: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Default lifetime of the spawn path's recently-offered job cache.
pub const DEFAULT_SPAWN_CACHE_TTL: Duration = Duration::from_secs(30);
