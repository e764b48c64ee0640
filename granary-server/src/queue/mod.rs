//! Per-placement prioritized repair job queue
//!
//! Jobs wait in a primary heap ordered by segment health (lower health =
//! repair sooner, ties to the older insert) and a secondary retry heap
//! holding jobs whose last attempt was too recent. Both heaps share one
//! bounded element budget; when it runs out the lowest-priority element is
//! evicted, which may be the job being pushed. Every queue carries a
//! replaceable time source so tests control the clock.

mod heap;

pub use heap::Heap;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use granary_core::clock::{system_clock, Clock};
use granary_core::{Error, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

/// Fixed in-memory footprint of one job record; byte-denominated queue
/// configuration divides by this to get element counts.
pub const RECORD_SIZE: usize = 64;

/// How long the backing storage must stay oversized before it is released.
const RELEASE_WINDOW_SECS: u64 = 60;

/// Upper bounds of the health histogram buckets.
pub const HEALTH_BUCKET_BOUNDS: [f64; 8] =
    [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, f64::INFINITY];

/// One segment repair work item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Job {
    /// Stream the segment belongs to.
    pub stream_id: [u8; 16],
    /// Segment position within the stream.
    pub position: u64,
    /// Segment health; lower means repair sooner.
    pub segment_health: f64,
    /// Placement this job is constrained to.
    pub placement: u16,
    /// When the job entered a queue (unix seconds); 0 lets the queue stamp
    /// it.
    pub inserted_at: u64,
    /// Last time the job's record changed (unix seconds).
    pub updated_at: u64,
    /// Last repair attempt (unix seconds); 0 = never attempted.
    pub last_attempted_at: u64,
}

impl Job {
    /// The identity a job keeps while queued.
    pub fn id(&self) -> ([u8; 16], u64) {
        (self.stream_id, self.position)
    }
}

fn repair_less(a: &Job, b: &Job) -> bool {
    if a.segment_health != b.segment_health {
        return a.segment_health < b.segment_health;
    }
    a.inserted_at < b.inserted_at
}

fn retry_less(a: &Job, b: &Job) -> bool {
    if a.last_attempted_at != b.last_attempted_at {
        return a.last_attempted_at < b.last_attempted_at;
    }
    a.inserted_at < b.inserted_at
}

/// Result of a batch push.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Jobs stored.
    pub pushed: u64,
    /// Jobs evicted to make room.
    pub evicted: Vec<Job>,
    /// Jobs rejected because they did not outrank any stored job.
    pub rejected: u64,
    /// Jobs rejected because their identity was already queued.
    pub conflicts: u64,
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStat {
    /// Jobs across both heaps.
    pub count: u64,
    /// Smallest health present; 0 when empty.
    pub min_health: f64,
    /// Largest health present; 0 when empty.
    pub max_health: f64,
    /// Health histogram as (upper bound, count) pairs.
    pub histogram: Vec<(f64, u64)>,
}

struct Inner {
    repair: Heap<Job>,
    retry: Heap<Job>,
    index: HashSet<([u8; 16], u64)>,
    excess_since: Option<u64>,
}

/// One placement's queue. Safe for concurrent callers; not shared across
/// placements.
pub struct Queue {
    placement: u16,
    retry_after: Duration,
    max_elements: usize,
    mem_release_threshold: usize,
    inner: Mutex<Inner>,
    arrived: Condvar,
    clock: RwLock<Arc<dyn Clock>>,
}

impl Queue {
    /// Create a queue. `init_elements` pre-reserves backing storage,
    /// `max_elements` bounds both heaps together, and
    /// `mem_release_threshold` (elements) controls when slack storage is
    /// returned.
    pub fn new(
        placement: u16,
        retry_after: Duration,
        init_elements: usize,
        max_elements: usize,
        mem_release_threshold: usize,
    ) -> Queue {
        info!(
            placement,
            init_elements, max_elements, "created repair queue"
        );
        Queue {
            placement,
            retry_after,
            max_elements: max_elements.max(1),
            mem_release_threshold,
            inner: Mutex::new(Inner {
                repair: Heap::with_capacity(init_elements, repair_less),
                retry: Heap::new(retry_less),
                index: HashSet::new(),
                excess_since: None,
            }),
            arrived: Condvar::new(),
            clock: RwLock::new(system_clock()),
        }
    }

    /// Placement this queue serves.
    pub fn placement(&self) -> u16 {
        self.placement
    }

    /// Replace the time source. Queues created later still start on the
    /// wall clock.
    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        *self.clock.write() = clock;
    }

    fn now(&self) -> u64 {
        self.clock.read().now_secs()
    }

    /// Push one job. `Ok(None)` when stored outright, `Ok(Some(job))` when
    /// storing evicted a lower-priority job, `Err(Capacity)` when the
    /// queue is full and the pushed job does not outrank any stored one.
    pub fn push(&self, job: Job) -> Result<Option<Job>> {
        let now = self.now();
        let mut inner = self.inner.lock();
        self.push_locked(&mut inner, job, now)
    }

    /// Push many jobs under one lock.
    pub fn push_batch(&self, jobs: Vec<Job>) -> BatchOutcome {
        let now = self.now();
        let mut inner = self.inner.lock();
        let mut outcome = BatchOutcome::default();
        for job in jobs {
            match self.push_locked(&mut inner, job, now) {
                Ok(None) => outcome.pushed += 1,
                Ok(Some(evicted)) => {
                    outcome.pushed += 1;
                    outcome.evicted.push(evicted);
                }
                Err(Error::Capacity(_)) => outcome.rejected += 1,
                Err(Error::Conflict(_)) => outcome.conflicts += 1,
                Err(_) => outcome.rejected += 1,
            }
        }
        outcome
    }

    fn push_locked(&self, inner: &mut Inner, mut job: Job, now: u64) -> Result<Option<Job>> {
        if inner.index.contains(&job.id()) {
            return Err(Error::Conflict(format!(
                "job for stream {} position {} already queued",
                hex::encode(job.stream_id),
                job.position
            )));
        }
        if job.inserted_at == 0 {
            job.inserted_at = now;
        }
        job.updated_at = now;

        let mut evicted = None;
        if inner.repair.len() + inner.retry.len() >= self.max_elements {
            evicted = Some(self.evict_for(inner, &job)?);
        }

        let to_retry = job.last_attempted_at != 0
            && now.saturating_sub(job.last_attempted_at) < self.retry_after.as_secs();
        if to_retry {
            inner.retry.push(job);
        } else {
            inner.repair.push(job);
            self.arrived.notify_one();
        }
        inner.index.insert(job.id());
        Ok(evicted)
    }

    /// Drop the lowest-priority stored job to make room for `incoming`,
    /// or fail if `incoming` itself is the lowest priority. Ties retain
    /// the older insert.
    fn evict_for(&self, inner: &mut Inner, incoming: &Job) -> Result<Job> {
        let repair_worst = inner.repair.max_index();
        let retry_worst = inner.retry.max_index_by(repair_less);

        let (from_repair, worst_idx) = match (repair_worst, retry_worst) {
            (Some(r), Some(t)) => {
                if repair_less(inner.repair.get(r), inner.retry.get(t)) {
                    (false, t)
                } else {
                    (true, r)
                }
            }
            (Some(r), None) => (true, r),
            (None, Some(t)) => (false, t),
            (None, None) => {
                return Err(Error::Capacity("queue capacity is zero".to_string()))
            }
        };

        let worst = if from_repair {
            *inner.repair.get(worst_idx)
        } else {
            *inner.retry.get(worst_idx)
        };
        if !repair_less(incoming, &worst) {
            return Err(Error::Capacity(format!(
                "queue full and health {} does not outrank stored jobs",
                incoming.segment_health
            )));
        }

        let evicted = if from_repair {
            inner.repair.remove(worst_idx)
        } else {
            inner.retry.remove(worst_idx)
        };
        inner.index.remove(&evicted.id());
        debug!(
            placement = self.placement,
            health = evicted.segment_health,
            "evicted lowest-priority job"
        );
        Ok(evicted)
    }

    /// Move every retry-heap job whose delay has run out into the repair
    /// heap.
    fn promote_locked(&self, inner: &mut Inner, now: u64) {
        let retry_after = self.retry_after.as_secs();
        loop {
            match inner.retry.peek() {
                Some(top) if top.last_attempted_at + retry_after <= now => {}
                _ => break,
            }
            if let Some(job) = inner.retry.pop() {
                inner.repair.push(job);
            }
        }
    }

    /// Pop the highest-priority eligible job, stamping its attempt
    /// metadata. `None` when both heaps are empty or nothing is eligible.
    pub fn pop(&self) -> Option<Job> {
        let now = self.now();
        let mut inner = self.inner.lock();
        self.promote_locked(&mut inner, now);
        let result = match inner.repair.pop() {
            Some(mut job) => {
                inner.index.remove(&job.id());
                job.last_attempted_at = now;
                job.updated_at = now;
                Some(job)
            }
            None => None,
        };
        self.maybe_release(&mut inner, now);
        result
    }

    /// Opt-in blocking variant of `pop`: waits up to `timeout` for a job
    /// to become available. Wakes early for pushes; retry promotions are
    /// bounded by short re-checks.
    pub fn pop_wait(&self, timeout: Duration) -> Option<Job> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let now = self.now();
            self.promote_locked(&mut inner, now);
            if let Some(mut job) = inner.repair.pop() {
                inner.index.remove(&job.id());
                job.last_attempted_at = now;
                job.updated_at = now;
                self.maybe_release(&mut inner, now);
                return Some(job);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // re-check at least once a second so retry promotions driven
            // by a replaced clock are not missed
            let wait = remaining.min(Duration::from_secs(1));
            self.arrived.wait_for(&mut inner, wait);
        }
    }

    /// What `pop` would return, without dequeueing or stamping.
    pub fn peek(&self) -> Option<Job> {
        let now = self.now();
        let mut inner = self.inner.lock();
        self.promote_locked(&mut inner, now);
        inner.repair.peek().copied()
    }

    /// Lengths of the repair and retry heaps.
    pub fn len(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.repair.len(), inner.retry.len())
    }

    /// Whether both heaps are empty.
    pub fn is_empty(&self) -> bool {
        let (repair, retry) = self.len();
        repair == 0 && retry == 0
    }

    /// Drop every job updated strictly before `before` (unix seconds)
    /// from both heaps. Jobs updated exactly at the boundary survive.
    pub fn clean(&self, before: u64) -> usize {
        let now = self.now();
        let mut inner = self.inner.lock();
        let removed = inner.repair.retain(|job| job.updated_at >= before)
            + inner.retry.retain(|job| job.updated_at >= before);
        if removed > 0 {
            Self::rebuild_index(&mut inner);
        }
        self.maybe_release(&mut inner, now);
        removed
    }

    /// Drop every job whose health exceeds the threshold.
    pub fn trim(&self, health_greater_than: f64) -> usize {
        let now = self.now();
        let mut inner = self.inner.lock();
        let removed = inner
            .repair
            .retain(|job| job.segment_health <= health_greater_than)
            + inner
                .retry
                .retain(|job| job.segment_health <= health_greater_than);
        if removed > 0 {
            Self::rebuild_index(&mut inner);
        }
        self.maybe_release(&mut inner, now);
        removed
    }

    /// Aggregate statistics across both heaps.
    pub fn stat(&self) -> QueueStat {
        let inner = self.inner.lock();
        let mut stat = QueueStat {
            count: 0,
            min_health: 0.0,
            max_health: 0.0,
            histogram: HEALTH_BUCKET_BOUNDS.iter().map(|b| (*b, 0u64)).collect(),
        };
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for job in inner.repair.iter().chain(inner.retry.iter()) {
            stat.count += 1;
            min = min.min(job.segment_health);
            max = max.max(job.segment_health);
            for bucket in stat.histogram.iter_mut() {
                if job.segment_health <= bucket.0 {
                    bucket.1 += 1;
                    break;
                }
            }
        }
        if stat.count > 0 {
            stat.min_health = min;
            stat.max_health = max;
        }
        stat
    }

    /// Backing storage currently reserved, in elements.
    pub fn capacity_elements(&self) -> usize {
        let inner = self.inner.lock();
        inner.repair.capacity() + inner.retry.capacity()
    }

    /// Release slack backing storage once it has exceeded the threshold
    /// for a sustained window. Allocator-level, best-effort.
    fn maybe_release(&self, inner: &mut Inner, now: u64) {
        if self.mem_release_threshold == 0 {
            return;
        }
        let used = inner.repair.len() + inner.retry.len();
        let capacity = inner.repair.capacity() + inner.retry.capacity();
        let slack = capacity.saturating_sub(used);
        if slack <= self.mem_release_threshold {
            inner.excess_since = None;
            return;
        }
        match inner.excess_since {
            None => inner.excess_since = Some(now),
            Some(since) if now.saturating_sub(since) >= RELEASE_WINDOW_SECS => {
                debug!(placement = self.placement, slack, "releasing queue memory");
                inner.repair.shrink_to_fit();
                inner.retry.shrink_to_fit();
                inner.excess_since = None;
            }
            Some(_) => {}
        }
    }

    fn rebuild_index(inner: &mut Inner) {
        inner.index = inner
            .repair
            .iter()
            .chain(inner.retry.iter())
            .map(Job::id)
            .collect();
    }
}
