//! Per-member table of gateway sender pipelines and their region
//! attachments.

use crate::config::MemberId;
use crate::error::WanError;
use crate::sender::GatewaySender;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Default)]
struct RegistryInner {
    senders: HashMap<String, Arc<GatewaySender>>,
    /// Region name to attached sender ids.
    attachments: HashMap<String, BTreeSet<String>>,
}

/// Explicit per-member sender table, keyed by sender id.
pub struct SenderRegistry {
    member_id: MemberId,
    inner: Mutex<RegistryInner>,
}

impl SenderRegistry {
    /// Create an empty registry for one member.
    pub fn new(member_id: impl Into<MemberId>) -> Self {
        Self {
            member_id: member_id.into(),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// The owning member.
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Register a built pipeline. Rejects an id that is already present.
    pub async fn insert(&self, sender: Arc<GatewaySender>) -> Result<(), WanError> {
        let mut inner = self.inner.lock().await;
        let id = sender.id().to_string();
        if inner.senders.contains_key(&id) {
            return Err(WanError::DuplicateSender { id });
        }
        inner.senders.insert(id, sender);
        Ok(())
    }

    /// Remove a pipeline from the table, detaching it from every region.
    /// The caller destroys the returned sender.
    pub async fn remove(&self, id: &str) -> Result<Arc<GatewaySender>, WanError> {
        let mut inner = self.inner.lock().await;
        let sender = inner
            .senders
            .remove(id)
            .ok_or_else(|| WanError::SenderNotFound { id: id.to_string() })?;
        for attached in inner.attachments.values_mut() {
            attached.remove(id);
        }
        inner.attachments.retain(|_, attached| !attached.is_empty());
        Ok(sender)
    }

    /// Look up a pipeline by id.
    pub async fn get(&self, id: &str) -> Option<Arc<GatewaySender>> {
        self.inner.lock().await.senders.get(id).cloned()
    }

    /// All registered sender ids, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.senders.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Attach a sender to a region so committed mutations on that region are
    /// offered to it.
    pub async fn attach_region(&self, region: &str, sender_id: &str) -> Result<(), WanError> {
        let mut inner = self.inner.lock().await;
        if !inner.senders.contains_key(sender_id) {
            return Err(WanError::SenderNotFound {
                id: sender_id.to_string(),
            });
        }
        inner
            .attachments
            .entry(region.to_string())
            .or_default()
            .insert(sender_id.to_string());
        Ok(())
    }

    /// Detach a sender from a region.
    pub async fn detach_region(&self, region: &str, sender_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(attached) = inner.attachments.get_mut(region) {
            attached.remove(sender_id);
            if attached.is_empty() {
                inner.attachments.remove(region);
            }
        }
    }

    /// Senders attached to a region, in id order.
    pub async fn senders_for_region(&self, region: &str) -> Vec<Arc<GatewaySender>> {
        let inner = self.inner.lock().await;
        match inner.attachments.get(region) {
            Some(attached) => attached
                .iter()
                .filter_map(|id| inner.senders.get(id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Destroy every pipeline and empty the table. Used when the member
    /// leaves the cluster. Returns the number of senders destroyed.
    pub async fn teardown(&self) -> usize {
        let drained: Vec<Arc<GatewaySender>> = {
            let mut inner = self.inner.lock().await;
            inner.attachments.clear();
            inner.senders.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        for sender in drained {
            let _ = sender.destroy().await;
        }
        if count > 0 {
            info!(member_id = %self.member_id, senders = count, "member registry torn down");
        }
        count
    }
}
