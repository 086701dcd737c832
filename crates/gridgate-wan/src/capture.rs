//! Capture hook wired into the local commit path.
//!
//! The hook is awaited by the mutation before it returns, so a committed
//! write is either queued on every attached sender or has surfaced an error
//! (backpressure timeout, failed pipeline) to the caller.

use crate::error::WanError;
use crate::event::OpKind;
use crate::registry::SenderRegistry;
use std::sync::Arc;

/// Bridges committed region mutations to the senders attached to the
/// region.
pub struct EventCaptureHook {
    registry: Arc<SenderRegistry>,
}

impl EventCaptureHook {
    /// Create a hook over a member's sender registry.
    pub fn new(registry: Arc<SenderRegistry>) -> Self {
        Self { registry }
    }

    /// Offer one committed mutation to every sender attached to `region`.
    ///
    /// Senders not attached to the region never see the event. Each sender
    /// assigns its own sequence token and applies its own event filters.
    pub async fn on_commit(
        &self,
        region: &str,
        key: &[u8],
        value: Option<&[u8]>,
        op: OpKind,
        partition_id: u32,
        capture_thread: u64,
    ) -> Result<(), WanError> {
        for sender in self.registry.senders_for_region(region).await {
            sender
                .offer(region, key, value, op, partition_id, capture_thread)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SenderConfig;
    use crate::queue::ReplicationQueue;
    use crate::sender::GatewaySender;
    use crate::transport::{BatchReceiver, GatewayLink, RemoteStore};

    async fn register_sender(
        registry: &SenderRegistry,
        id: &str,
        region: &str,
    ) -> (Arc<GatewaySender>, Arc<RemoteStore>) {
        let config = SenderConfig {
            dispatcher_threads: 1,
            order_policy: None,
            batch_size: 1,
            batch_time_interval_ms: 20,
            ..SenderConfig::new(id, 2)
        };
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
        registry.insert(sender.clone()).await.unwrap();
        registry.attach_region(region, id).await.unwrap();
        (sender, store)
    }

    #[tokio::test]
    async fn commit_reaches_every_attached_sender() {
        let registry = Arc::new(SenderRegistry::new("m1"));
        let (a, _) = register_sender(&registry, "a", "orders").await;
        let (b, _) = register_sender(&registry, "b", "orders").await;
        let (c, _) = register_sender(&registry, "c", "inventory").await;

        let hook = EventCaptureHook::new(registry.clone());
        hook.on_commit("orders", b"k", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap();

        assert_eq!(a.queue().size().await, 1);
        assert_eq!(b.queue().size().await, 1);
        assert_eq!(c.queue().size().await, 0);
    }

    #[tokio::test]
    async fn unattached_region_is_a_no_op() {
        let registry = Arc::new(SenderRegistry::new("m1"));
        let (a, _) = register_sender(&registry, "a", "orders").await;

        let hook = EventCaptureHook::new(registry.clone());
        hook.on_commit("other", b"k", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap();
        assert_eq!(a.queue().size().await, 0);
    }

    #[tokio::test]
    async fn tokens_are_assigned_per_sender() {
        let registry = Arc::new(SenderRegistry::new("m1"));
        let (a, _) = register_sender(&registry, "a", "orders").await;
        let (b, _) = register_sender(&registry, "b", "orders").await;

        let hook = EventCaptureHook::new(registry.clone());
        for i in 0..3u8 {
            hook.on_commit("orders", &[i], Some(b"v"), OpKind::Create, 0, 0)
                .await
                .unwrap();
        }

        // Each sender saw the same three events under its own token stream.
        let batch_a = a.queue().lane(0).peek_batch(10, 10).await;
        let batch_b = b.queue().lane(0).peek_batch(10, 10).await;
        let tokens_a: Vec<u64> = batch_a.iter().map(|e| e.sequence_token).collect();
        let tokens_b: Vec<u64> = batch_b.iter().map(|e| e.sequence_token).collect();
        assert_eq!(tokens_a, vec![1, 2, 3]);
        assert_eq!(tokens_b, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn destroyed_sender_surfaces_shutdown() {
        let registry = Arc::new(SenderRegistry::new("m1"));
        let (a, _) = register_sender(&registry, "a", "orders").await;
        a.destroy().await.unwrap();

        let hook = EventCaptureHook::new(registry.clone());
        let err = hook
            .on_commit("orders", b"k", Some(b"v"), OpKind::Create, 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, WanError::Shutdown));
    }
}
