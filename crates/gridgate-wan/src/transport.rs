//! Batch transport between a sender lane and its remote site.
//!
//! `GatewayLink` is a point-to-point in-process channel pair carrying the
//! bincode wire form of batches one way and acknowledgments the other; the
//! real network socket is an external collaborator behind the same shape.
//! Each queue lane owns exactly one link, so acknowledgments never cross
//! between dispatchers.

use crate::config::SiteId;
use crate::error::WanError;
use crate::event::{EventId, QueueEvent};
use crate::filter::{apply_inbound, apply_outbound, GatewayTransportFilter};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// One dispatched batch on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Id of the sender that produced the batch.
    pub sender_id: String,
    /// Site the batch originates from.
    pub source_site_id: SiteId,
    /// Per-link monotonic batch sequence, used to match acknowledgments.
    pub batch_seq: u64,
    /// Events in lane FIFO order.
    pub events: Vec<QueueEvent>,
}

impl EventBatch {
    /// Highest sequence token in the batch, or zero when empty.
    pub fn up_to_token(&self) -> u64 {
        self.events
            .iter()
            .map(|e| e.sequence_token)
            .max()
            .unwrap_or(0)
    }
}

/// Acknowledgment for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    /// Sequence of the acknowledged batch.
    pub batch_seq: u64,
    /// Tokens at or below this value may be retired from the queue.
    pub up_to_token: u64,
}

#[derive(Default)]
struct LinkStatsInner {
    batches_sent: AtomicU64,
    events_sent: AtomicU64,
    acks_received: AtomicU64,
    send_errors: AtomicU64,
}

/// Snapshot of link counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    /// Batches put on the wire, including re-sends.
    pub batches_sent: u64,
    /// Events put on the wire, including re-sends.
    pub events_sent: u64,
    /// Acknowledgments received.
    pub acks_received: u64,
    /// Failed send attempts.
    pub send_errors: u64,
}

/// Sending half of a lane's link to the remote site.
pub struct GatewayLink {
    batch_tx: mpsc::Sender<Vec<u8>>,
    ack_rx: mpsc::Receiver<BatchAck>,
    filters: Vec<Arc<dyn GatewayTransportFilter>>,
    stats: Arc<LinkStatsInner>,
}

/// Remote half of a lane's link: wire bytes in, acknowledgments out.
pub struct RemoteEndpoint {
    batch_rx: mpsc::Receiver<Vec<u8>>,
    ack_tx: mpsc::Sender<BatchAck>,
    filters: Vec<Arc<dyn GatewayTransportFilter>>,
}

impl GatewayLink {
    /// Create a connected link pair with the given channel capacity and
    /// transport filter chain (shared by both halves).
    pub fn pair(
        capacity: usize,
        filters: Vec<Arc<dyn GatewayTransportFilter>>,
    ) -> (GatewayLink, RemoteEndpoint) {
        let (batch_tx, batch_rx) = mpsc::channel(capacity);
        let (ack_tx, ack_rx) = mpsc::channel(capacity);
        (
            GatewayLink {
                batch_tx,
                ack_rx,
                filters: filters.clone(),
                stats: Arc::new(LinkStatsInner::default()),
            },
            RemoteEndpoint {
                batch_rx,
                ack_tx,
                filters,
            },
        )
    }

    /// Serialize, filter, and transmit one batch.
    pub async fn send_batch(&mut self, batch: &EventBatch) -> Result<(), WanError> {
        let encoded = bincode::serialize(batch)?;
        let wire = apply_outbound(&self.filters, encoded);
        if self.batch_tx.send(wire).await.is_err() {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(WanError::Transport {
                msg: "remote endpoint closed".to_string(),
            });
        }
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .events_sent
            .fetch_add(batch.events.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Wait up to `timeout_ms` for the acknowledgment of `batch_seq`.
    ///
    /// Acks for earlier batches (left over from a timed-out attempt whose
    /// ack arrived late) are drained and discarded.
    pub async fn await_ack(&mut self, batch_seq: u64, timeout_ms: u64) -> Result<BatchAck, WanError> {
        let wait = Duration::from_millis(timeout_ms);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, self.ack_rx.recv()).await {
                Ok(Some(ack)) if ack.batch_seq == batch_seq => {
                    self.stats.acks_received.fetch_add(1, Ordering::Relaxed);
                    return Ok(ack);
                }
                Ok(Some(stale)) => {
                    debug!(
                        stale_seq = stale.batch_seq,
                        expected_seq = batch_seq,
                        "discarding stale acknowledgment"
                    );
                }
                Ok(None) => {
                    return Err(WanError::Transport {
                        msg: "acknowledgment channel closed".to_string(),
                    })
                }
                Err(_) => return Err(WanError::AckTimeout { timeout_ms }),
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            batches_sent: self.stats.batches_sent.load(Ordering::Relaxed),
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            acks_received: self.stats.acks_received.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct RemoteStoreInner {
    /// Materialized entries; `None` marks an invalidated value.
    entries: HashMap<(String, Vec<u8>), Option<Vec<u8>>>,
    seen: HashSet<EventId>,
}

/// Remote-site state shared by all receiving endpoints of one site.
///
/// Applies events idempotently by event id, so re-sent batches after a lost
/// acknowledgment change nothing. The dedup set is retained for the store's
/// lifetime; a durable receiver would prune it by per-origin token watermark
/// once acknowledgments are known to have reached the sender.
#[derive(Default)]
pub struct RemoteStore {
    inner: Mutex<RemoteStoreInner>,
    events_applied: AtomicU64,
    duplicates_dropped: AtomicU64,
}

impl RemoteStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch and return its acknowledgment.
    pub async fn apply_batch(&self, batch: &EventBatch) -> BatchAck {
        let mut inner = self.inner.lock().await;
        for event in &batch.events {
            if !inner.seen.insert(event.event_id()) {
                self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let entry_key = (event.region.clone(), event.key.clone());
            match event.op {
                crate::event::OpKind::Create | crate::event::OpKind::Update => {
                    inner.entries.insert(entry_key, event.value.clone());
                }
                crate::event::OpKind::Invalidate => {
                    inner.entries.insert(entry_key, None);
                }
                crate::event::OpKind::Destroy => {
                    inner.entries.remove(&entry_key);
                }
            }
            self.events_applied.fetch_add(1, Ordering::Relaxed);
        }
        BatchAck {
            batch_seq: batch.batch_seq,
            up_to_token: batch.up_to_token(),
        }
    }

    /// Current value of an entry, if present.
    pub async fn get(&self, region: &str, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.inner
            .lock()
            .await
            .entries
            .get(&(region.to_string(), key.to_vec()))
            .cloned()
    }

    /// Number of materialized entries.
    pub async fn entry_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Events applied (duplicates excluded).
    pub fn events_applied(&self) -> u64 {
        self.events_applied.load(Ordering::Relaxed)
    }

    /// Re-delivered events dropped by deduplication.
    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped.load(Ordering::Relaxed)
    }
}

/// Receiving loop for one endpoint: decode, apply to the shared store, ack.
pub struct BatchReceiver;

impl BatchReceiver {
    /// Spawn the receive loop for `endpoint`. The task exits when the
    /// sending half closes.
    pub fn spawn(mut endpoint: RemoteEndpoint, store: Arc<RemoteStore>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(wire) = endpoint.batch_rx.recv().await {
                let decoded = apply_inbound(&endpoint.filters, wire);
                let batch: EventBatch = match bincode::deserialize(&decoded) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable batch");
                        continue;
                    }
                };
                let ack = store.apply_batch(&batch).await;
                if endpoint.ack_tx.send(ack).await.is_err() {
                    return;
                }
            }
        })
    }
}

/// One remote site as seen by the local cluster: a shared store fed by any
/// number of receiving endpoints.
///
/// Every link connected through the same `RemoteSite` lands in one store, so
/// deduplication spans all sending members and lanes of the site.
#[derive(Default)]
pub struct RemoteSite {
    store: Arc<RemoteStore>,
}

impl RemoteSite {
    /// Create a site with an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The site's store.
    pub fn store(&self) -> Arc<RemoteStore> {
        self.store.clone()
    }

    /// Create `lane_count` connected links into this site, spawning a
    /// receiver task per link.
    pub fn connect(
        &self,
        lane_count: usize,
        filters: Vec<Arc<dyn GatewayTransportFilter>>,
    ) -> Vec<GatewayLink> {
        (0..lane_count)
            .map(|_| {
                let (link, endpoint) = GatewayLink::pair(64, filters.clone());
                BatchReceiver::spawn(endpoint, self.store.clone());
                link
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OpKind;

    fn make_event(token: u64, key: &[u8], op: OpKind, value: &[u8]) -> QueueEvent {
        QueueEvent {
            region: "r".to_string(),
            key: key.to_vec(),
            value: match op {
                OpKind::Create | OpKind::Update => Some(value.to_vec()),
                _ => None,
            },
            op,
            origin_member: "m1".to_string(),
            sequence_token: token,
            partition_id: 0,
            capture_thread: 0,
            enqueue_timestamp_us: 0,
        }
    }

    fn make_batch(seq: u64, events: Vec<QueueEvent>) -> EventBatch {
        EventBatch {
            sender_id: "ln".to_string(),
            source_site_id: 1,
            batch_seq: seq,
            events,
        }
    }

    #[tokio::test]
    async fn send_and_ack_roundtrip() {
        let (mut link, endpoint) = GatewayLink::pair(8, Vec::new());
        let store = Arc::new(RemoteStore::new());
        BatchReceiver::spawn(endpoint, store.clone());

        let batch = make_batch(
            1,
            vec![
                make_event(1, b"a", OpKind::Create, b"v1"),
                make_event(2, b"b", OpKind::Create, b"v2"),
            ],
        );
        link.send_batch(&batch).await.unwrap();
        let ack = link.await_ack(1, 1000).await.unwrap();

        assert_eq!(ack.batch_seq, 1);
        assert_eq!(ack.up_to_token, 2);
        assert_eq!(store.entry_count().await, 2);
        assert_eq!(store.get("r", b"a").await, Some(Some(b"v1".to_vec())));

        let stats = link.stats();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.events_sent, 2);
        assert_eq!(stats.acks_received, 1);
    }

    #[tokio::test]
    async fn resend_after_lost_ack_is_deduplicated() {
        let (mut link, endpoint) = GatewayLink::pair(8, Vec::new());
        let store = Arc::new(RemoteStore::new());
        BatchReceiver::spawn(endpoint, store.clone());

        let batch = make_batch(1, vec![make_event(1, b"a", OpKind::Create, b"v1")]);
        link.send_batch(&batch).await.unwrap();
        let _ = link.await_ack(1, 1000).await.unwrap();

        // Pretend the ack was lost and the dispatcher re-sent the batch.
        link.send_batch(&batch).await.unwrap();
        let ack = link.await_ack(1, 1000).await.unwrap();

        assert_eq!(ack.up_to_token, 1);
        assert_eq!(store.events_applied(), 1);
        assert_eq!(store.duplicates_dropped(), 1);
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn destroy_removes_remote_entry() {
        let (mut link, endpoint) = GatewayLink::pair(8, Vec::new());
        let store = Arc::new(RemoteStore::new());
        BatchReceiver::spawn(endpoint, store.clone());

        link.send_batch(&make_batch(
            1,
            vec![
                make_event(1, b"a", OpKind::Create, b"v1"),
                make_event(2, b"a", OpKind::Destroy, b""),
            ],
        ))
        .await
        .unwrap();
        link.await_ack(1, 1000).await.unwrap();

        assert_eq!(store.entry_count().await, 0);
        assert_eq!(store.get("r", b"a").await, None);
    }

    #[tokio::test]
    async fn invalidate_keeps_key_drops_value() {
        let (mut link, endpoint) = GatewayLink::pair(8, Vec::new());
        let store = Arc::new(RemoteStore::new());
        BatchReceiver::spawn(endpoint, store.clone());

        link.send_batch(&make_batch(
            1,
            vec![
                make_event(1, b"a", OpKind::Create, b"v1"),
                make_event(2, b"a", OpKind::Invalidate, b""),
            ],
        ))
        .await
        .unwrap();
        link.await_ack(1, 1000).await.unwrap();

        assert_eq!(store.get("r", b"a").await, Some(None));
    }

    #[tokio::test]
    async fn ack_timeout_when_remote_is_silent() {
        let (mut link, _endpoint) = GatewayLink::pair(8, Vec::new());

        let batch = make_batch(1, vec![make_event(1, b"a", OpKind::Create, b"v1")]);
        link.send_batch(&batch).await.unwrap();

        let err = link.await_ack(1, 50).await.unwrap_err();
        assert!(matches!(err, WanError::AckTimeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn send_fails_when_remote_dropped() {
        let (mut link, endpoint) = GatewayLink::pair(8, Vec::new());
        drop(endpoint);

        let batch = make_batch(1, vec![make_event(1, b"a", OpKind::Create, b"v1")]);
        let err = link.send_batch(&batch).await.unwrap_err();
        assert!(matches!(err, WanError::Transport { .. }));
        assert_eq!(link.stats().send_errors, 1);
    }

    #[tokio::test]
    async fn stale_acks_are_drained() {
        let (mut link, endpoint) = GatewayLink::pair(8, Vec::new());
        let store = Arc::new(RemoteStore::new());
        BatchReceiver::spawn(endpoint, store.clone());

        // Batch 1's ack arrives while the dispatcher has moved on to batch 2
        // after a timeout.
        link.send_batch(&make_batch(1, vec![make_event(1, b"a", OpKind::Create, b"v1")]))
            .await
            .unwrap();
        link.send_batch(&make_batch(2, vec![make_event(2, b"b", OpKind::Create, b"v2")]))
            .await
            .unwrap();

        let ack = link.await_ack(2, 1000).await.unwrap();
        assert_eq!(ack.batch_seq, 2);
    }

    #[tokio::test]
    async fn transport_filters_invert_on_the_wire() {
        struct Xor(u8);
        impl GatewayTransportFilter for Xor {
            fn outbound(&self, bytes: Vec<u8>) -> Vec<u8> {
                bytes.into_iter().map(|b| b ^ self.0).collect()
            }
            fn inbound(&self, bytes: Vec<u8>) -> Vec<u8> {
                bytes.into_iter().map(|b| b ^ self.0).collect()
            }
        }

        let filters: Vec<Arc<dyn GatewayTransportFilter>> = vec![Arc::new(Xor(0x7F))];
        let (mut link, endpoint) = GatewayLink::pair(8, filters);
        let store = Arc::new(RemoteStore::new());
        BatchReceiver::spawn(endpoint, store.clone());

        link.send_batch(&make_batch(1, vec![make_event(1, b"a", OpKind::Create, b"v1")]))
            .await
            .unwrap();
        link.await_ack(1, 1000).await.unwrap();
        assert_eq!(store.get("r", b"a").await, Some(Some(b"v1".to_vec())));
    }

    #[tokio::test]
    async fn remote_site_shares_one_store_across_links() {
        let site = RemoteSite::new();
        let mut links = site.connect(2, Vec::new());
        let mut second = links.pop().unwrap();
        let mut first = links.pop().unwrap();

        first
            .send_batch(&make_batch(1, vec![make_event(1, b"a", OpKind::Create, b"v")]))
            .await
            .unwrap();
        first.await_ack(1, 1000).await.unwrap();

        // The same event arriving over another link is a duplicate.
        second
            .send_batch(&make_batch(1, vec![make_event(1, b"a", OpKind::Create, b"v")]))
            .await
            .unwrap();
        second.await_ack(1, 1000).await.unwrap();

        let store = site.store();
        assert_eq!(store.events_applied(), 1);
        assert_eq!(store.duplicates_dropped(), 1);
    }

    #[test]
    fn batch_up_to_token() {
        let batch = make_batch(
            1,
            vec![
                make_event(3, b"a", OpKind::Create, b"v"),
                make_event(7, b"b", OpKind::Create, b"v"),
                make_event(5, b"c", OpKind::Create, b"v"),
            ],
        );
        assert_eq!(batch.up_to_token(), 7);
        assert_eq!(make_batch(2, Vec::new()).up_to_token(), 0);
    }
}
