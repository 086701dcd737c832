//! Per-member gateway sender pipeline: configuration, queue, dispatcher
//! pool, transport links, and optional durable log, bound together under a
//! published runtime state.

use crate::config::{MemberId, SenderConfig, SiteId};
use crate::dispatch::{DispatcherParams, DispatcherPool, DispatcherState};
use crate::error::WanError;
use crate::event::{now_us, OpKind, QueueEvent};
use crate::filter::GatewayEventFilter;
use crate::persistence::{EventLog, PersistenceWriter};
use crate::queue::ReplicationQueue;
use crate::transport::GatewayLink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

/// How long a mutation blocks on the queue memory ceiling before the
/// enqueue fails back to the caller.
pub const BACKPRESSURE_WAIT_MS: u64 = 60_000;

/// Published lifecycle state of a sender pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    /// Built but not dispatching (manual start, or stopped before ever
    /// starting).
    Created,
    /// Dispatching batches.
    Started,
    /// Dispatch held; the queue keeps accruing.
    Paused,
    /// Dispatch halted; the queue is preserved.
    Stopped,
    /// Pipeline torn down; the queue has been discarded.
    Destroyed,
    /// Durable log failure; the sender must be recreated.
    Failed,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeState::Created => "created",
            RuntimeState::Started => "started",
            RuntimeState::Paused => "paused",
            RuntimeState::Stopped => "stopped",
            RuntimeState::Destroyed => "destroyed",
            RuntimeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time counters for one sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderStats {
    /// Events accepted into the queue.
    pub events_queued: u64,
    /// Events dropped by event filters before the queue.
    pub events_filtered: u64,
    /// Events replaced by conflation.
    pub events_conflated: u64,
    /// Events in acknowledged batches.
    pub events_dispatched: u64,
    /// Batches acknowledged by the remote site.
    pub batches_dispatched: u64,
    /// Batch attempts that failed and were retried.
    pub batches_retried: u64,
    /// Events currently queued (in-flight included).
    pub queue_size: usize,
    /// Queue memory accounting in bytes.
    pub queue_bytes: u64,
    /// Age of the oldest unacknowledged event in microseconds.
    pub oldest_unacked_age_us: u64,
}

/// One member's pipeline for one configured gateway sender.
pub struct GatewaySender {
    config: SenderConfig,
    member_id: MemberId,
    queue: Arc<ReplicationQueue>,
    pool: Mutex<Option<DispatcherPool>>,
    state_tx: watch::Sender<RuntimeState>,
    persistence: Option<Arc<PersistenceWriter>>,
    event_filters: Vec<Arc<dyn GatewayEventFilter>>,
    next_token: AtomicU64,
    events_queued: AtomicU64,
    events_filtered: AtomicU64,
}

impl GatewaySender {
    /// Build the pipeline for a validated configuration.
    ///
    /// `links` must hold one transport link per queue lane (see
    /// [`ReplicationQueue::lane_count_for`]). When `event_log` is given and
    /// persistence is enabled, unacknowledged events found in the log are
    /// replayed into the queue before dispatch begins.
    pub async fn build(
        config: SenderConfig,
        member_id: MemberId,
        local_site_id: SiteId,
        local_partitions: &[u32],
        links: Vec<GatewayLink>,
        event_filters: Vec<Arc<dyn GatewayEventFilter>>,
        event_log: Option<Arc<dyn EventLog>>,
    ) -> Result<Arc<GatewaySender>, WanError> {
        config.validate()?;
        let lane_count = ReplicationQueue::lane_count_for(&config, local_partitions);
        if links.len() != lane_count {
            return Err(WanError::Transport {
                msg: format!(
                    "{} transport links provided for {} queue lanes",
                    links.len(),
                    lane_count
                ),
            });
        }

        let queue = Arc::new(ReplicationQueue::for_config(&config, local_partitions));
        let mut highest_token = 0u64;
        let persistence = if config.enable_persistence {
            let log = event_log.unwrap_or_else(|| {
                Arc::new(crate::persistence::MemoryEventLog::new()) as Arc<dyn EventLog>
            });
            let writer = Arc::new(PersistenceWriter::new(
                log,
                lane_count,
                config.disk_synchronous,
            ));
            let replayed = writer.replay()?;
            if !replayed.is_empty() {
                highest_token = replayed
                    .iter()
                    .map(|e| e.sequence_token)
                    .max()
                    .unwrap_or(0);
                info!(
                    sender_id = %config.id,
                    member_id = %member_id,
                    events = replayed.len(),
                    "rebuilding queue from event log"
                );
                queue.restore(replayed).await;
            }
            Some(writer)
        } else {
            None
        };

        let (state_tx, state_rx) = watch::channel(RuntimeState::Created);
        let params = DispatcherParams::from_config(&config, local_site_id);
        let lanes = (0..lane_count).map(|i| queue.lane(i)).collect();
        let pool = DispatcherPool::spawn(params, lanes, links, persistence.clone(), state_rx);

        info!(
            sender_id = %config.id,
            member_id = %member_id,
            lanes = lane_count,
            "gateway sender created"
        );
        Ok(Arc::new(GatewaySender {
            config,
            member_id,
            queue,
            pool: Mutex::new(Some(pool)),
            state_tx,
            persistence,
            event_filters,
            next_token: AtomicU64::new(highest_token),
            events_queued: AtomicU64::new(0),
            events_filtered: AtomicU64::new(0),
        }))
    }

    /// The sender id.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// The owning member.
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// The sender's configuration.
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Current runtime state.
    pub fn state(&self) -> RuntimeState {
        *self.state_tx.borrow()
    }

    /// Watch the runtime state.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.state_tx.subscribe()
    }

    /// Begin (or resume) dispatching. No-op when already started; an error
    /// once destroyed or failed.
    pub fn start(&self) -> Result<(), WanError> {
        match self.state() {
            RuntimeState::Created | RuntimeState::Stopped | RuntimeState::Paused => {
                self.state_tx.send_replace(RuntimeState::Started);
                info!(sender_id = %self.config.id, member_id = %self.member_id, "gateway sender started");
                Ok(())
            }
            RuntimeState::Started => Ok(()),
            state @ (RuntimeState::Destroyed | RuntimeState::Failed) => {
                Err(WanError::InvalidTransition {
                    action: "start".to_string(),
                    state: state.to_string(),
                })
            }
        }
    }

    /// Hold dispatch while the queue keeps accruing.
    pub fn pause(&self) -> Result<(), WanError> {
        match self.state() {
            RuntimeState::Started => {
                self.state_tx.send_replace(RuntimeState::Paused);
                Ok(())
            }
            RuntimeState::Paused => Ok(()),
            state => Err(WanError::InvalidTransition {
                action: "pause".to_string(),
                state: state.to_string(),
            }),
        }
    }

    /// Resume dispatch after a pause.
    pub fn resume(&self) -> Result<(), WanError> {
        match self.state() {
            RuntimeState::Paused => {
                self.state_tx.send_replace(RuntimeState::Started);
                Ok(())
            }
            RuntimeState::Started => Ok(()),
            state => Err(WanError::InvalidTransition {
                action: "resume".to_string(),
                state: state.to_string(),
            }),
        }
    }

    /// Halt dispatch, preserving the queue. An in-flight batch finishes its
    /// acknowledgment wait before the dispatcher parks.
    pub fn stop(&self) -> Result<(), WanError> {
        match self.state() {
            RuntimeState::Started | RuntimeState::Paused | RuntimeState::Created => {
                self.state_tx.send_replace(RuntimeState::Stopped);
                info!(sender_id = %self.config.id, member_id = %self.member_id, "gateway sender stopped");
                Ok(())
            }
            RuntimeState::Stopped => Ok(()),
            state => Err(WanError::InvalidTransition {
                action: "stop".to_string(),
                state: state.to_string(),
            }),
        }
    }

    /// Tear the pipeline down: halt dispatch, discard the queue, wait for
    /// the dispatcher tasks to exit. Returns the number of discarded events.
    pub async fn destroy(&self) -> Result<usize, WanError> {
        match self.state() {
            RuntimeState::Destroyed => {
                return Err(WanError::InvalidTransition {
                    action: "destroy".to_string(),
                    state: RuntimeState::Destroyed.to_string(),
                })
            }
            _ => self.state_tx.send_replace(RuntimeState::Destroyed),
        };
        if let Some(pool) = self.pool.lock().await.take() {
            pool.join().await;
        }
        let dropped = self.queue.clear().await;
        info!(
            sender_id = %self.config.id,
            member_id = %self.member_id,
            dropped,
            "gateway sender destroyed"
        );
        Ok(dropped)
    }

    /// Offer one committed mutation to this sender: filter, assign the next
    /// sequence token, log, and enqueue (blocking on the memory ceiling up
    /// to [`BACKPRESSURE_WAIT_MS`]).
    pub async fn offer(
        &self,
        region: &str,
        key: &[u8],
        value: Option<&[u8]>,
        op: OpKind,
        partition_id: u32,
        capture_thread: u64,
    ) -> Result<(), WanError> {
        match self.state() {
            RuntimeState::Destroyed | RuntimeState::Failed => return Err(WanError::Shutdown),
            _ => {}
        }

        let event = QueueEvent {
            region: region.to_string(),
            key: key.to_vec(),
            value: value.map(|v| v.to_vec()),
            op,
            origin_member: self.member_id.clone(),
            sequence_token: self.next_token.fetch_add(1, Ordering::AcqRel) + 1,
            partition_id,
            capture_thread,
            enqueue_timestamp_us: now_us(),
        };

        for filter in &self.event_filters {
            if !filter.before_enqueue(&event) {
                self.events_filtered.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.record(&event) {
                error!(
                    sender_id = %self.config.id,
                    member_id = %self.member_id,
                    error = %e,
                    "event log append failed, failing the sender"
                );
                self.state_tx.send_replace(RuntimeState::Failed);
                return Err(e);
            }
        }

        self.queue.enqueue(event, BACKPRESSURE_WAIT_MS).await?;
        self.events_queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current dispatcher states, one per lane.
    pub async fn dispatcher_states(&self) -> Vec<DispatcherState> {
        match self.pool.lock().await.as_ref() {
            Some(pool) => pool.states(),
            None => Vec::new(),
        }
    }

    /// Point-in-time counters.
    pub async fn stats(&self) -> SenderStats {
        let dispatch = match self.pool.lock().await.as_ref() {
            Some(pool) => pool.stats(),
            None => Default::default(),
        };
        SenderStats {
            events_queued: self.events_queued.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            events_conflated: self.queue.conflated_total(),
            events_dispatched: dispatch.events_dispatched,
            batches_dispatched: dispatch.batches_dispatched,
            batches_retried: dispatch.batches_retried,
            queue_size: self.queue.size().await,
            queue_bytes: self.queue.used_bytes(),
            oldest_unacked_age_us: self.queue.oldest_unacked_age_us(now_us()).await,
        }
    }

    /// The sender's queue (tests and capture-side inspection).
    pub fn queue(&self) -> &ReplicationQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BatchReceiver, RemoteStore};
    use tokio::time::{Duration, Instant};

    fn fast_config(id: &str) -> SenderConfig {
        SenderConfig {
            dispatcher_threads: 1,
            order_policy: None,
            batch_size: 1,
            batch_time_interval_ms: 20,
            ..SenderConfig::new(id, 2)
        }
    }

    async fn build_with_remote(config: SenderConfig) -> (Arc<GatewaySender>, Arc<RemoteStore>) {
        let lane_count = ReplicationQueue::lane_count_for(&config, &[]);
        let store = Arc::new(RemoteStore::new());
        let mut links = Vec::new();
        for _ in 0..lane_count {
            let (link, endpoint) = GatewayLink::pair(8, Vec::new());
            BatchReceiver::spawn(endpoint, store.clone());
            links.push(link);
        }
        let sender = GatewaySender::build(config, "m1".to_string(), 1, &[], links, Vec::new(), None)
            .await
            .unwrap();
        (sender, store)
    }

    async fn wait_until<F, Fut>(mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if cond().await {
                return;
            }
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn build_starts_in_created() {
        let (sender, store) = build_with_remote(fast_config("ln")).await;
        assert_eq!(sender.state(), RuntimeState::Created);

        sender
            .offer("r", b"k", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.events_applied(), 0);
        assert_eq!(sender.queue().size().await, 1);

        sender.start().unwrap();
        let s = &store;
        wait_until(move || async move { s.events_applied() == 1 }).await;
    }

    #[tokio::test]
    async fn offer_assigns_monotonic_tokens() {
        let (sender, store) = build_with_remote(fast_config("ln")).await;
        sender.start().unwrap();
        for i in 0..3u8 {
            sender
                .offer("r", &[i], Some(b"v"), OpKind::Create, 0, 0)
                .await
                .unwrap();
        }
        let s = &store;
        wait_until(move || async move { s.events_applied() == 3 }).await;
        assert_eq!(sender.stats().await.events_queued, 3);
    }

    #[tokio::test]
    async fn event_filter_drops_before_queue() {
        struct DropDestroys;
        impl GatewayEventFilter for DropDestroys {
            fn before_enqueue(&self, event: &QueueEvent) -> bool {
                event.op != OpKind::Destroy
            }
        }

        let config = fast_config("ln");
        let lane_count = ReplicationQueue::lane_count_for(&config, &[]);
        let store = Arc::new(RemoteStore::new());
        let mut links = Vec::new();
        for _ in 0..lane_count {
            let (link, endpoint) = GatewayLink::pair(8, Vec::new());
            BatchReceiver::spawn(endpoint, store.clone());
            links.push(link);
        }
        let sender = GatewaySender::build(
            config,
            "m1".to_string(),
            1,
            &[],
            links,
            vec![Arc::new(DropDestroys)],
            None,
        )
        .await
        .unwrap();
        sender.start().unwrap();

        sender
            .offer("r", b"k", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap();
        sender
            .offer("r", b"k", None, OpKind::Destroy, 0, 0)
            .await
            .unwrap();

        let s = &store;
        wait_until(move || async move { s.events_applied() == 1 }).await;
        let stats = sender.stats().await;
        assert_eq!(stats.events_filtered, 1);
        assert_eq!(stats.events_queued, 1);
        assert_eq!(store.get("r", b"k").await, Some(Some(b"v".to_vec())));
    }

    #[tokio::test]
    async fn stop_preserves_queue_and_restart_drains() {
        let (sender, store) = build_with_remote(fast_config("ln")).await;
        sender.start().unwrap();
        sender
            .offer("r", b"a", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap();
        {
            let s = &store;
            wait_until(move || async move { s.events_applied() == 1 }).await;
        }

        sender.stop().unwrap();
        assert_eq!(sender.state(), RuntimeState::Stopped);
        sender
            .offer("r", b"b", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.events_applied(), 1);
        assert_eq!(sender.queue().size().await, 1);

        sender.start().unwrap();
        let s = &store;
        wait_until(move || async move { s.events_applied() == 2 }).await;
    }

    #[tokio::test]
    async fn destroy_discards_queue_and_rejects_offers() {
        let (sender, _store) = build_with_remote(fast_config("ln")).await;
        sender
            .offer("r", b"a", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap();
        assert_eq!(sender.queue().size().await, 1);

        let dropped = sender.destroy().await.unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(sender.state(), RuntimeState::Destroyed);
        assert_eq!(sender.queue().size().await, 0);

        let err = sender
            .offer("r", b"b", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, WanError::Shutdown));

        assert!(sender.destroy().await.is_err());
        assert!(sender.start().is_err());
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let (sender, _store) = build_with_remote(fast_config("ln")).await;

        // Pause before start is invalid; stop from Created parks it.
        assert!(matches!(
            sender.pause(),
            Err(WanError::InvalidTransition { .. })
        ));
        assert!(matches!(
            sender.resume(),
            Err(WanError::InvalidTransition { .. })
        ));
        sender.stop().unwrap();
        assert_eq!(sender.state(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn pause_and_resume_roundtrip() {
        let (sender, _store) = build_with_remote(fast_config("ln")).await;
        sender.start().unwrap();
        sender.pause().unwrap();
        assert_eq!(sender.state(), RuntimeState::Paused);
        sender.pause().unwrap();
        sender.resume().unwrap();
        assert_eq!(sender.state(), RuntimeState::Started);
    }

    #[tokio::test]
    async fn persistence_failure_fails_the_sender() {
        use crate::persistence::EventLog;

        struct FailingLog;
        impl EventLog for FailingLog {
            fn append(&self, _event: &QueueEvent) -> Result<(), WanError> {
                Err(WanError::Persistence {
                    msg: "disk full".to_string(),
                })
            }
            fn truncate_up_to(&self, _token: u64) -> Result<(), WanError> {
                Ok(())
            }
            fn replay_from(&self, _token: u64) -> Result<Vec<QueueEvent>, WanError> {
                Ok(Vec::new())
            }
        }

        let config = SenderConfig {
            enable_persistence: true,
            disk_synchronous: true,
            ..fast_config("ln")
        };
        let (link, _endpoint) = GatewayLink::pair(8, Vec::new());
        let sender = GatewaySender::build(
            config,
            "m1".to_string(),
            1,
            &[],
            vec![link],
            Vec::new(),
            Some(Arc::new(FailingLog)),
        )
        .await
        .unwrap();
        sender.start().unwrap();

        let err = sender
            .offer("r", b"k", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, WanError::Persistence { .. }));
        assert_eq!(sender.state(), RuntimeState::Failed);
        assert!(sender.start().is_err());
    }

    #[tokio::test]
    async fn rebuilds_queue_from_event_log() {
        use crate::persistence::{EventLog, MemoryEventLog};

        // A previous incarnation logged three events and acknowledged none.
        let log = Arc::new(MemoryEventLog::new());
        for t in 1..=3u64 {
            log.append(&QueueEvent {
                region: "r".to_string(),
                key: vec![t as u8],
                value: Some(b"v".to_vec()),
                op: OpKind::Create,
                origin_member: "m1".to_string(),
                sequence_token: t,
                partition_id: 0,
                capture_thread: 0,
                enqueue_timestamp_us: t,
            })
            .unwrap();
        }

        let config = SenderConfig {
            enable_persistence: true,
            disk_synchronous: true,
            ..fast_config("ln")
        };
        let store = Arc::new(RemoteStore::new());
        let (link, endpoint) = GatewayLink::pair(8, Vec::new());
        BatchReceiver::spawn(endpoint, store.clone());
        let sender = GatewaySender::build(
            config,
            "m1".to_string(),
            1,
            &[],
            vec![link],
            Vec::new(),
            Some(log.clone() as Arc<dyn EventLog>),
        )
        .await
        .unwrap();

        assert_eq!(sender.queue().size().await, 3);
        sender.start().unwrap();
        let s = &store;
        wait_until(move || async move { s.events_applied() == 3 }).await;

        // New captures continue after the replayed tokens.
        sender
            .offer("r", b"x", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap();
        wait_until(move || async move { s.events_applied() == 4 }).await;
        let l = &log;
        wait_until(move || async move { l.is_empty() }).await;
    }

    #[tokio::test]
    async fn wrong_link_count_is_rejected() {
        let config = SenderConfig {
            dispatcher_threads: 3,
            order_policy: Some(crate::config::OrderPolicy::Key),
            ..SenderConfig::new("ln", 2)
        };
        let (link, _endpoint) = GatewayLink::pair(8, Vec::new());
        let err = GatewaySender::build(
            config,
            "m1".to_string(),
            1,
            &[],
            vec![link],
            Vec::new(),
            None,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, WanError::Transport { .. }));
    }
}
