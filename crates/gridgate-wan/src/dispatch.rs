//! Dispatcher pool: one task per queue lane, draining batches to the remote
//! site with retry and acknowledgment.
//!
//! Each dispatcher walks Idle → Batching → Sending → AwaitingAck and back,
//! or into Retrying on failure. Failed batches are re-sent identically,
//! never reordered or split; the remote side's deduplication absorbs the
//! at-least-once overlap.

use crate::config::{SenderConfig, SiteId};
use crate::event::now_us;
use crate::persistence::PersistenceWriter;
use crate::queue::QueueLane;
use crate::sender::RuntimeState;
use crate::transport::{EventBatch, GatewayLink};
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// First retry backoff.
const RETRY_BACKOFF_BASE_MS: u64 = 100;
/// Backoff ceiling.
const RETRY_BACKOFF_CAP_MS: u64 = 30_000;
/// Consecutive failures on one batch before an alert is raised.
const RETRY_ALERT_THRESHOLD: u32 = 10;

/// Observable state of one dispatcher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Waiting for queue activity or for the sender to be started.
    Idle,
    /// Accumulating a batch from the lane.
    Batching,
    /// Putting a batch on the wire.
    Sending,
    /// Waiting for the remote acknowledgment.
    AwaitingAck,
    /// Backing off after a send or acknowledgment failure.
    Retrying,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    fn set(&self, state: DispatcherState) {
        let v = match state {
            DispatcherState::Idle => 0,
            DispatcherState::Batching => 1,
            DispatcherState::Sending => 2,
            DispatcherState::AwaitingAck => 3,
            DispatcherState::Retrying => 4,
        };
        self.0.store(v, Ordering::Release);
    }

    fn get(&self) -> DispatcherState {
        match self.0.load(Ordering::Acquire) {
            1 => DispatcherState::Batching,
            2 => DispatcherState::Sending,
            3 => DispatcherState::AwaitingAck,
            4 => DispatcherState::Retrying,
            _ => DispatcherState::Idle,
        }
    }
}

#[derive(Default)]
struct DispatchStatsInner {
    batches_dispatched: AtomicU64,
    batches_retried: AtomicU64,
    events_dispatched: AtomicU64,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    /// Batches acknowledged by the remote site.
    pub batches_dispatched: u64,
    /// Send attempts that failed and were retried.
    pub batches_retried: u64,
    /// Events in acknowledged batches.
    pub events_dispatched: u64,
}

/// Batching and timeout parameters for a pool, taken from the sender
/// configuration at pipeline build time.
#[derive(Debug, Clone)]
pub struct DispatcherParams {
    /// Id of the owning sender, used in batch headers and log fields.
    pub sender_id: String,
    /// Site this member belongs to.
    pub source_site_id: SiteId,
    /// Events per batch.
    pub batch_size: usize,
    /// Longest wait for a batch to fill.
    pub batch_time_interval_ms: u64,
    /// Acknowledgment wait ceiling.
    pub socket_read_timeout_ms: u64,
    /// Queue staleness alert threshold; zero disables.
    pub alert_threshold_ms: u64,
}

impl DispatcherParams {
    /// Extract dispatch parameters from a validated configuration.
    pub fn from_config(config: &SenderConfig, source_site_id: SiteId) -> Self {
        Self {
            sender_id: config.id.clone(),
            source_site_id,
            batch_size: config.batch_size,
            batch_time_interval_ms: config.batch_time_interval_ms,
            socket_read_timeout_ms: config.socket_read_timeout_ms,
            alert_threshold_ms: config.alert_threshold_ms,
        }
    }
}

/// The set of dispatcher tasks for one sender, one per lane.
pub struct DispatcherPool {
    handles: Vec<JoinHandle<()>>,
    states: Vec<Arc<StateCell>>,
    stats: Arc<DispatchStatsInner>,
}

impl DispatcherPool {
    /// Spawn one dispatcher per `(lane, link)` pair, gated by `state_rx`.
    ///
    /// `persistence` is shared so acknowledged tokens truncate the common
    /// event log. The pool exits when the runtime state reaches `Destroyed`
    /// or `Failed`, or when the state channel closes.
    pub fn spawn(
        params: DispatcherParams,
        lanes: Vec<Arc<QueueLane>>,
        links: Vec<GatewayLink>,
        persistence: Option<Arc<PersistenceWriter>>,
        state_rx: watch::Receiver<RuntimeState>,
    ) -> Self {
        debug_assert_eq!(lanes.len(), links.len());
        let stats = Arc::new(DispatchStatsInner::default());
        let mut states = Vec::with_capacity(lanes.len());
        let mut handles = Vec::with_capacity(lanes.len());
        for (lane_idx, (lane, link)) in lanes.into_iter().zip(links).enumerate() {
            let cell = Arc::new(StateCell::new());
            states.push(cell.clone());
            let dispatcher = Dispatcher {
                lane_idx,
                params: params.clone(),
                lane,
                link,
                persistence: persistence.clone(),
                state_rx: state_rx.clone(),
                cell,
                stats: stats.clone(),
                batch_seq: 0,
                staleness_alerted: false,
            };
            handles.push(tokio::spawn(dispatcher.run()));
        }
        Self {
            handles,
            states,
            stats,
        }
    }

    /// Current state of each dispatcher, indexed by lane.
    pub fn states(&self) -> Vec<DispatcherState> {
        self.states.iter().map(|c| c.get()).collect()
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            batches_dispatched: self.stats.batches_dispatched.load(Ordering::Relaxed),
            batches_retried: self.stats.batches_retried.load(Ordering::Relaxed),
            events_dispatched: self.stats.events_dispatched.load(Ordering::Relaxed),
        }
    }

    /// Wait for every dispatcher task to exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct Dispatcher {
    lane_idx: usize,
    params: DispatcherParams,
    lane: Arc<QueueLane>,
    link: GatewayLink,
    persistence: Option<Arc<PersistenceWriter>>,
    state_rx: watch::Receiver<RuntimeState>,
    cell: Arc<StateCell>,
    stats: Arc<DispatchStatsInner>,
    batch_seq: u64,
    staleness_alerted: bool,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            let state = *self.state_rx.borrow();
            match state {
                RuntimeState::Started => {}
                RuntimeState::Created | RuntimeState::Paused | RuntimeState::Stopped => {
                    self.cell.set(DispatcherState::Idle);
                    if self.state_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                RuntimeState::Destroyed | RuntimeState::Failed => {
                    self.cell.set(DispatcherState::Idle);
                    return;
                }
            }

            self.cell.set(DispatcherState::Batching);
            let events = self
                .lane
                .peek_batch(self.params.batch_size, self.params.batch_time_interval_ms)
                .await;
            self.check_staleness().await;
            if events.is_empty() {
                self.cell.set(DispatcherState::Idle);
                continue;
            }

            self.batch_seq += 1;
            let batch = EventBatch {
                sender_id: self.params.sender_id.clone(),
                source_site_id: self.params.source_site_id,
                batch_seq: self.batch_seq,
                events,
            };
            self.dispatch_batch(batch).await;
        }
    }

    /// Send one batch to acknowledgment, retrying with bounded exponential
    /// backoff. Gives the batch back to the lane if the sender leaves the
    /// Started state between attempts.
    async fn dispatch_batch(&mut self, batch: EventBatch) {
        let mut retries: u32 = 0;
        loop {
            if *self.state_rx.borrow() != RuntimeState::Started {
                self.lane.rewind_dispatch().await;
                return;
            }

            self.cell.set(DispatcherState::Sending);
            let attempt = async {
                self.link.send_batch(&batch).await?;
                self.cell.set(DispatcherState::AwaitingAck);
                self.link
                    .await_ack(batch.batch_seq, self.params.socket_read_timeout_ms)
                    .await
            };
            match attempt.await {
                Ok(ack) => {
                    let retired = self.lane.acknowledge(ack.up_to_token).await;
                    if let Some(persistence) = &self.persistence {
                        if let Err(e) = persistence.acknowledged(self.lane_idx, ack.up_to_token) {
                            warn!(
                                sender_id = %self.params.sender_id,
                                lane = self.lane_idx,
                                error = %e,
                                "event log truncation failed"
                            );
                        }
                    }
                    self.stats
                        .batches_dispatched
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .events_dispatched
                        .fetch_add(batch.events.len() as u64, Ordering::Relaxed);
                    debug!(
                        sender_id = %self.params.sender_id,
                        lane = self.lane_idx,
                        batch_seq = batch.batch_seq,
                        events = batch.events.len(),
                        retired,
                        "batch acknowledged"
                    );
                    self.cell.set(DispatcherState::Idle);
                    return;
                }
                Err(e) => {
                    retries += 1;
                    self.stats.batches_retried.fetch_add(1, Ordering::Relaxed);
                    self.cell.set(DispatcherState::Retrying);
                    if retries == RETRY_ALERT_THRESHOLD {
                        warn!(
                            sender_id = %self.params.sender_id,
                            lane = self.lane_idx,
                            batch_seq = batch.batch_seq,
                            retries,
                            error = %e,
                            "batch still undelivered after retry threshold"
                        );
                    } else {
                        debug!(
                            sender_id = %self.params.sender_id,
                            lane = self.lane_idx,
                            batch_seq = batch.batch_seq,
                            retries,
                            error = %e,
                            "batch dispatch failed, backing off"
                        );
                    }
                    tokio::time::sleep(Self::backoff(retries)).await;
                }
            }
        }
    }

    fn backoff(retries: u32) -> Duration {
        let exp = retries.saturating_sub(1).min(16);
        let base = (RETRY_BACKOFF_BASE_MS << exp).min(RETRY_BACKOFF_CAP_MS);
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }

    async fn check_staleness(&mut self) {
        if self.params.alert_threshold_ms == 0 {
            return;
        }
        let age_us = self.lane.oldest_unacked_age_us(now_us()).await;
        let stale = age_us > self.params.alert_threshold_ms * 1000;
        if stale && !self.staleness_alerted {
            warn!(
                sender_id = %self.params.sender_id,
                lane = self.lane_idx,
                age_ms = age_us / 1000,
                threshold_ms = self.params.alert_threshold_ms,
                "oldest queued event exceeds alert threshold"
            );
            self.staleness_alerted = true;
        } else if !stale && self.staleness_alerted {
            info!(
                sender_id = %self.params.sender_id,
                lane = self.lane_idx,
                "queue staleness recovered"
            );
            self.staleness_alerted = false;
        }
    }
}
