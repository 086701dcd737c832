//! Replication queues: ordered, lane-sharded holding areas for captured
//! events awaiting remote acknowledgment.
//!
//! A queue is a fixed set of FIFO lanes. Serial topology uses one lane, or
//! N lanes keyed by order policy when multiple dispatcher threads are
//! configured; parallel topology uses one lane per local storage partition.
//! Lane assignment is fixed for the lifetime of the sender instance.

use crate::config::{OrderPolicy, SenderConfig, Topology};
use crate::error::WanError;
use crate::event::QueueEvent;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

/// Shared queue-memory accounting across all lanes of one sender.
///
/// Producers block (never drop) when the ceiling is exceeded; acknowledgment
/// releases bytes and wakes blocked producers.
struct MemoryAccounting {
    used: AtomicU64,
    ceiling_bytes: u64,
    released: Notify,
}

impl MemoryAccounting {
    fn new(ceiling_bytes: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            ceiling_bytes,
            released: Notify::new(),
        }
    }

    /// Reserve `cost` bytes, waiting up to `max_wait_ms` for space. An empty
    /// accounting always admits one event, even one larger than the ceiling.
    async fn reserve(&self, cost: u64, max_wait_ms: u64) -> Result<(), WanError> {
        let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
        loop {
            // Register for the release notification before re-checking, so a
            // release between the check and the wait is never missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            loop {
                let current = self.used.load(Ordering::Acquire);
                if current + cost > self.ceiling_bytes && current != 0 {
                    break;
                }
                if self
                    .used
                    .compare_exchange(
                        current,
                        current + cost,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(WanError::BackpressureTimeout {
                    waited_ms: max_wait_ms,
                });
            }
            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Reserve without blocking, used when rebuilding a queue from the log.
    fn force_reserve(&self, cost: u64) {
        self.used.fetch_add(cost, Ordering::AcqRel);
    }

    fn release(&self, cost: u64) {
        if cost > 0 {
            self.used.fetch_sub(cost, Ordering::AcqRel);
            self.released.notify_waiters();
        }
    }

    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

struct LaneInner {
    events: VecDeque<QueueEvent>,
    /// Number of front events handed to the dispatcher and not yet
    /// acknowledged. Events at or before this watermark are never conflated.
    dispatched: usize,
}

/// One FIFO lane of a replication queue.
///
/// A lane has exactly one consuming dispatcher; enqueue and
/// peek/acknowledge on the same lane are mutually exclusive while distinct
/// lanes proceed fully in parallel.
pub struct QueueLane {
    inner: Mutex<LaneInner>,
    arrived: Notify,
    mem: Arc<MemoryAccounting>,
    conflation_enabled: bool,
    conflated: AtomicU64,
}

impl QueueLane {
    fn new(mem: Arc<MemoryAccounting>, conflation_enabled: bool) -> Self {
        Self {
            inner: Mutex::new(LaneInner {
                events: VecDeque::new(),
                dispatched: 0,
            }),
            arrived: Notify::new(),
            mem,
            conflation_enabled,
            conflated: AtomicU64::new(0),
        }
    }

    /// Append an event, blocking up to `max_wait_ms` on the memory ceiling.
    ///
    /// With conflation enabled, a pending (undispatched) conflatable event
    /// for the same key is replaced in place instead of appended; destroys
    /// always append and are never replaced.
    pub async fn enqueue(&self, event: QueueEvent, max_wait_ms: u64) -> Result<(), WanError> {
        let cost = event.approx_size() as u64;
        self.mem.reserve(cost, max_wait_ms).await?;

        let mut inner = self.inner.lock().await;
        if self.conflation_enabled && event.op.conflatable() {
            // Only the latest pending event for the key is a candidate; if
            // that event is a destroy the new one must be ordered after it.
            let start = inner.dispatched;
            let found = inner
                .events
                .iter()
                .enumerate()
                .skip(start)
                .rev()
                .find(|(_, e)| e.key == event.key)
                .map(|(i, e)| (i, e.op.conflatable()));
            if let Some((idx, true)) = found {
                let old = std::mem::replace(&mut inner.events[idx], event);
                drop(inner);
                self.mem.release(old.approx_size() as u64);
                self.conflated.fetch_add(1, Ordering::Relaxed);
                self.arrived.notify_one();
                return Ok(());
            }
        }
        inner.events.push_back(event);
        drop(inner);
        self.arrived.notify_one();
        Ok(())
    }

    /// Return up to `max` undispatched events in FIFO order, waiting up to
    /// `max_wait_ms` for the batch to fill. Returns whatever is pending
    /// (possibly nothing) once the wait expires. Returned events remain in
    /// the lane, past the dispatch watermark, until acknowledged.
    pub async fn peek_batch(&self, max: usize, max_wait_ms: u64) -> Vec<QueueEvent> {
        let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
        loop {
            {
                let mut inner = self.inner.lock().await;
                let avail = inner.events.len() - inner.dispatched;
                if avail >= max {
                    return Self::take_batch(&mut inner, max);
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = self.arrived.notified() => {}
                _ = tokio::time::sleep_until(deadline) => { break }
            }
        }
        let mut inner = self.inner.lock().await;
        let avail = inner.events.len() - inner.dispatched;
        Self::take_batch(&mut inner, avail.min(max))
    }

    fn take_batch(inner: &mut LaneInner, count: usize) -> Vec<QueueEvent> {
        let start = inner.dispatched;
        let batch: Vec<QueueEvent> = inner
            .events
            .iter()
            .skip(start)
            .take(count)
            .cloned()
            .collect();
        inner.dispatched += batch.len();
        batch
    }

    /// Retire dispatched events with `sequence_token <= up_to_token`,
    /// releasing their memory accounting. Returns the number retired.
    ///
    /// Only events at or before the dispatch watermark are eligible:
    /// in-place conflation can leave a front event carrying a newer token
    /// than a pending event behind it, so a token scan alone would retire
    /// events that were never part of a dispatched batch.
    pub async fn acknowledge(&self, up_to_token: u64) -> usize {
        let mut inner = self.inner.lock().await;
        let mut retired = 0usize;
        let mut freed = 0u64;
        while retired < inner.dispatched {
            match inner.events.front() {
                Some(front) if front.sequence_token <= up_to_token => {
                    freed += front.approx_size() as u64;
                }
                _ => break,
            }
            inner.events.pop_front();
            retired += 1;
        }
        inner.dispatched -= retired;
        drop(inner);
        self.mem.release(freed);
        retired
    }

    /// Rewind the dispatch watermark so unacknowledged in-flight events are
    /// offered again. Valid because each lane has a single dispatcher that
    /// acknowledges one batch before peeking the next.
    pub async fn rewind_dispatch(&self) {
        let mut inner = self.inner.lock().await;
        inner.dispatched = 0;
    }

    /// Number of events in the lane (dispatched but unacknowledged included).
    pub async fn size(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    /// Age in microseconds of the oldest unacknowledged event, or zero when
    /// the lane is empty.
    pub async fn oldest_unacked_age_us(&self, now_us: u64) -> u64 {
        let inner = self.inner.lock().await;
        inner
            .events
            .front()
            .map(|e| now_us.saturating_sub(e.enqueue_timestamp_us))
            .unwrap_or(0)
    }

    /// Number of events replaced by conflation on this lane.
    pub fn conflated_count(&self) -> u64 {
        self.conflated.load(Ordering::Relaxed)
    }

    /// Drop every event, releasing memory accounting. Used by destroy.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut freed = 0u64;
        let dropped = inner.events.len();
        for e in inner.events.drain(..) {
            freed += e.approx_size() as u64;
        }
        inner.dispatched = 0;
        drop(inner);
        self.mem.release(freed);
        dropped
    }

    async fn restore(&self, event: QueueEvent) {
        self.mem.force_reserve(event.approx_size() as u64);
        let mut inner = self.inner.lock().await;
        inner.events.push_back(event);
        drop(inner);
        self.arrived.notify_one();
    }
}

/// How events are routed to lanes. Chosen once at queue creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneRouting {
    /// Single lane; every event goes to lane 0.
    Single,
    /// Hash of the key modulo the lane count.
    ByKey(usize),
    /// Capturing thread modulo the lane count.
    ByThread(usize),
    /// Partition id modulo the lane count.
    ByPartition(usize),
}

/// The per-member, per-sender replication queue: a fixed set of FIFO lanes
/// plus shared memory accounting.
pub struct ReplicationQueue {
    lanes: Vec<Arc<QueueLane>>,
    routing: LaneRouting,
    mem: Arc<MemoryAccounting>,
}

impl ReplicationQueue {
    /// Number of lanes a queue for this configuration will have. Exposed so
    /// callers can provision one transport link per lane.
    pub fn lane_count_for(config: &SenderConfig, local_partitions: &[u32]) -> usize {
        match config.topology {
            Topology::Parallel => local_partitions.len().max(1),
            Topology::Serial => {
                if config.dispatcher_threads > 1 {
                    config.dispatcher_threads
                } else {
                    1
                }
            }
        }
    }

    /// Build the queue for a validated configuration.
    pub fn for_config(config: &SenderConfig, local_partitions: &[u32]) -> Self {
        let lane_count = Self::lane_count_for(config, local_partitions);
        let routing = match config.topology {
            Topology::Parallel => LaneRouting::ByPartition(lane_count),
            Topology::Serial if lane_count > 1 => match config.order_policy {
                Some(OrderPolicy::Key) | None => LaneRouting::ByKey(lane_count),
                Some(OrderPolicy::Thread) => LaneRouting::ByThread(lane_count),
                Some(OrderPolicy::Partition) => LaneRouting::ByPartition(lane_count),
            },
            Topology::Serial => LaneRouting::Single,
        };
        let mem = Arc::new(MemoryAccounting::new(
            config.max_queue_memory_mb * 1024 * 1024,
        ));
        let lanes = (0..lane_count)
            .map(|_| Arc::new(QueueLane::new(mem.clone(), config.enable_batch_conflation)))
            .collect();
        Self {
            lanes,
            routing,
            mem,
        }
    }

    /// Lane index an event routes to.
    pub fn lane_index(&self, event: &QueueEvent) -> usize {
        match self.routing {
            LaneRouting::Single => 0,
            LaneRouting::ByKey(n) => {
                let mut hasher = DefaultHasher::new();
                event.key.hash(&mut hasher);
                (hasher.finish() % n as u64) as usize
            }
            LaneRouting::ByThread(n) => (event.capture_thread % n as u64) as usize,
            LaneRouting::ByPartition(n) => (event.partition_id as usize) % n,
        }
    }

    /// Route and enqueue an event, blocking up to `max_wait_ms` on the
    /// memory ceiling.
    pub async fn enqueue(&self, event: QueueEvent, max_wait_ms: u64) -> Result<(), WanError> {
        let lane = self.lane_index(&event);
        self.lanes[lane].enqueue(event, max_wait_ms).await
    }

    /// The lane at `index`.
    pub fn lane(&self, index: usize) -> Arc<QueueLane> {
        self.lanes[index].clone()
    }

    /// Number of lanes.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Total queued events across all lanes.
    pub async fn size(&self) -> usize {
        let mut total = 0;
        for lane in &self.lanes {
            total += lane.size().await;
        }
        total
    }

    /// Age of the oldest unacknowledged event across all lanes.
    pub async fn oldest_unacked_age_us(&self, now_us: u64) -> u64 {
        let mut oldest = 0;
        for lane in &self.lanes {
            oldest = oldest.max(lane.oldest_unacked_age_us(now_us).await);
        }
        oldest
    }

    /// Total events replaced by conflation.
    pub fn conflated_total(&self) -> u64 {
        self.lanes.iter().map(|l| l.conflated_count()).sum()
    }

    /// Current memory accounting in bytes.
    pub fn used_bytes(&self) -> u64 {
        self.mem.used_bytes()
    }

    /// Drop all queued events. Returns the number dropped.
    pub async fn clear(&self) -> usize {
        let mut dropped = 0;
        for lane in &self.lanes {
            dropped += lane.clear().await;
        }
        dropped
    }

    /// Rebuild queue state from replayed log events, in token order, without
    /// conflation or backpressure.
    pub async fn restore(&self, events: Vec<QueueEvent>) {
        for event in events {
            let lane = self.lane_index(&event);
            self.lanes[lane].restore(event).await;
        }
    }
}
