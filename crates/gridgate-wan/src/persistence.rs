//! Durable event log boundary.
//!
//! When persistence is enabled, every enqueue appends to an `EventLog` and
//! every acknowledgment truncates it, so an unacknowledged queue can be
//! rebuilt after a restart. The in-process `MemoryEventLog` stands in for
//! the external durable store.

use crate::error::WanError;
use crate::event::QueueEvent;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::error;

/// Ordered, truncatable log of queue events keyed by sequence token.
pub trait EventLog: Send + Sync {
    /// Append one event to the log.
    fn append(&self, event: &QueueEvent) -> Result<(), WanError>;

    /// Drop all events with `sequence_token <= token`.
    fn truncate_up_to(&self, token: u64) -> Result<(), WanError>;

    /// Return all events with `sequence_token > token`, in token order.
    fn replay_from(&self, token: u64) -> Result<Vec<QueueEvent>, WanError>;
}

/// In-memory `EventLog` used by tests and as the stand-in for an external
/// durable store.
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<QueueEvent>>,
}

impl MemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueueEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no events are retained.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl EventLog for MemoryEventLog {
    fn append(&self, event: &QueueEvent) -> Result<(), WanError> {
        self.lock().push(event.clone());
        Ok(())
    }

    fn truncate_up_to(&self, token: u64) -> Result<(), WanError> {
        self.lock().retain(|e| e.sequence_token > token);
        Ok(())
    }

    fn replay_from(&self, token: u64) -> Result<Vec<QueueEvent>, WanError> {
        let mut events: Vec<QueueEvent> = self
            .lock()
            .iter()
            .filter(|e| e.sequence_token > token)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence_token);
        Ok(events)
    }
}

/// Write mode for the persistence path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Append on the enqueue path before the event enters the queue.
    Synchronous,
    /// Hand the append to a background task; the enqueue path does not wait.
    /// Events accepted but not yet appended are lost across a crash.
    Deferred,
}

/// Bridges a sender's queue to its `EventLog`: appends on enqueue, truncates
/// on acknowledgment.
///
/// Truncation is gated on the minimum acknowledged token across all lanes,
/// since the log is shared and lanes acknowledge independently.
pub struct PersistenceWriter {
    log: Arc<dyn EventLog>,
    mode: WriteMode,
    deferred_tx: Option<mpsc::UnboundedSender<QueueEvent>>,
    lane_acked: Vec<AtomicU64>,
    failed: Arc<AtomicBool>,
}

impl PersistenceWriter {
    /// Create a writer over `log` for a queue with `lane_count` lanes.
    pub fn new(log: Arc<dyn EventLog>, lane_count: usize, disk_synchronous: bool) -> Self {
        let failed = Arc::new(AtomicBool::new(false));
        let (mode, deferred_tx) = if disk_synchronous {
            (WriteMode::Synchronous, None)
        } else {
            let (tx, mut rx) = mpsc::unbounded_channel::<QueueEvent>();
            let task_log = log.clone();
            let task_failed = failed.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = task_log.append(&event) {
                        error!(error = %e, "deferred event log append failed");
                        task_failed.store(true, Ordering::Release);
                        return;
                    }
                }
            });
            (WriteMode::Deferred, Some(tx))
        };
        Self {
            log,
            mode,
            deferred_tx,
            lane_acked: (0..lane_count.max(1)).map(|_| AtomicU64::new(0)).collect(),
            failed,
        }
    }

    /// Record one event. In synchronous mode an append failure surfaces here;
    /// in deferred mode it surfaces on a later call after the background task
    /// has failed.
    pub fn record(&self, event: &QueueEvent) -> Result<(), WanError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(WanError::Persistence {
                msg: "event log writer has failed".to_string(),
            });
        }
        match self.mode {
            WriteMode::Synchronous => self.log.append(event).map_err(|e| {
                self.failed.store(true, Ordering::Release);
                e
            }),
            WriteMode::Deferred => {
                if let Some(tx) = &self.deferred_tx {
                    if tx.send(event.clone()).is_err() {
                        self.failed.store(true, Ordering::Release);
                        return Err(WanError::Persistence {
                            msg: "event log writer task exited".to_string(),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Note that `lane` has acknowledged through `up_to_token` and truncate
    /// the log to the minimum acknowledged token across lanes.
    pub fn acknowledged(&self, lane: usize, up_to_token: u64) -> Result<(), WanError> {
        self.lane_acked[lane].fetch_max(up_to_token, Ordering::AcqRel);
        let min = self
            .lane_acked
            .iter()
            .map(|a| a.load(Ordering::Acquire))
            .min()
            .unwrap_or(0);
        if min > 0 {
            self.log.truncate_up_to(min)?;
        }
        Ok(())
    }

    /// True once an append has failed; the owning pipeline must stop and the
    /// sender be recreated.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Drop the deferred channel and wait for queued appends to land.
    pub async fn flush(&mut self) {
        self.deferred_tx = None;
        // The background task drains the channel after the sender side drops;
        // yield until it has either finished or failed.
        for _ in 0..64 {
            if self.failed.load(Ordering::Acquire) {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    /// All unacknowledged events, in token order, for queue rebuild.
    pub fn replay(&self) -> Result<Vec<QueueEvent>, WanError> {
        self.log.replay_from(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OpKind;

    fn make_event(token: u64) -> QueueEvent {
        QueueEvent {
            region: "r".to_string(),
            key: format!("k{token}").into_bytes(),
            value: Some(vec![0u8; 8]),
            op: OpKind::Update,
            origin_member: "m1".to_string(),
            sequence_token: token,
            partition_id: 0,
            capture_thread: 0,
            enqueue_timestamp_us: token,
        }
    }

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

    #[test]
    fn memory_log_append_truncate_replay() {
        let log = MemoryEventLog::new();
        for t in 1..=5 {
            log.append(&make_event(t)).unwrap();
        }
        assert_eq!(log.len(), 5);

        log.truncate_up_to(3).unwrap();
        let remaining = log.replay_from(0).unwrap();
        let tokens: Vec<u64> = remaining.iter().map(|e| e.sequence_token).collect();
        assert_eq!(tokens, vec![4, 5]);

        let from_four = log.replay_from(4).unwrap();
        assert_eq!(from_four.len(), 1);
        assert_eq!(from_four[0].sequence_token, 5);
    }

    #[test]
    fn replay_sorts_by_token() {
        let log = MemoryEventLog::new();
        log.append(&make_event(3)).unwrap();
        log.append(&make_event(1)).unwrap();
        log.append(&make_event(2)).unwrap();

        let tokens: Vec<u64> = log
            .replay_from(0)
            .unwrap()
            .iter()
            .map(|e| e.sequence_token)
            .collect();
        assert_eq!(tokens, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn synchronous_writer_appends_inline() {
        let log = Arc::new(MemoryEventLog::new());
        let writer = PersistenceWriter::new(log.clone(), 1, true);

        writer.record(&make_event(1)).unwrap();
        writer.record(&make_event(2)).unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn truncation_waits_for_slowest_lane() {
        let log = Arc::new(MemoryEventLog::new());
        let writer = PersistenceWriter::new(log.clone(), 2, true);
        for t in 1..=6 {
            writer.record(&make_event(t)).unwrap();
        }

        // Lane 0 acked through 5, lane 1 only through 2: truncate to 2.
        writer.acknowledged(0, 5).unwrap();
        writer.acknowledged(1, 2).unwrap();
        assert_eq!(log.len(), 4);

        writer.acknowledged(1, 6).unwrap();
        // Minimum is now 5.
        assert_eq!(log.len(), 1);
        assert_eq!(log.replay_from(0).unwrap()[0].sequence_token, 6);
    }

    #[tokio::test]
    async fn deferred_writer_lands_appends_after_flush() {
        let log = Arc::new(MemoryEventLog::new());
        let mut writer = PersistenceWriter::new(log.clone(), 1, false);

        for t in 1..=3 {
            writer.record(&make_event(t)).unwrap();
        }
        writer.flush().await;
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn synchronous_append_failure_marks_writer_failed() {
        let writer = PersistenceWriter::new(Arc::new(FailingLog), 1, true);

        let err = writer.record(&make_event(1)).unwrap_err();
        assert!(matches!(err, WanError::Persistence { .. }));
        assert!(writer.is_failed());

        // Subsequent records fail fast.
        assert!(writer.record(&make_event(2)).is_err());
    }

    #[tokio::test]
    async fn deferred_append_failure_surfaces_on_later_record() {
        let writer = PersistenceWriter::new(Arc::new(FailingLog), 1, false);
        writer.record(&make_event(1)).unwrap();

        // Give the background task a chance to hit the append error.
        for _ in 0..64 {
            if writer.is_failed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(writer.is_failed());
        assert!(writer.record(&make_event(2)).is_err());
    }

    #[tokio::test]
    async fn replay_feeds_queue_rebuild() {
        use crate::config::SenderConfig;
        use crate::queue::ReplicationQueue;

        let log = Arc::new(MemoryEventLog::new());
        let writer = PersistenceWriter::new(log.clone(), 1, true);
        for t in 1..=4 {
            writer.record(&make_event(t)).unwrap();
        }
        writer.acknowledged(0, 1).unwrap();

        let config = SenderConfig {
            dispatcher_threads: 1,
            order_policy: None,
            ..SenderConfig::new("ln", 2)
        };
        let queue = ReplicationQueue::for_config(&config, &[]);
        queue.restore(writer.replay().unwrap()).await;
        assert_eq!(queue.size().await, 3);
    }
}
