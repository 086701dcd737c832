//! Queue event types.
//!
//! A `QueueEvent` is one committed local mutation captured for replication.
//! Events are ordered per lane by `sequence_token` and deduplicated remotely
//! by `(origin_member, sequence_token)`.

use crate::config::MemberId;
use serde::{Deserialize, Serialize};

/// Fixed per-event overhead used for queue memory accounting (headers,
/// bookkeeping, channel slots).
const EVENT_OVERHEAD_BYTES: usize = 64;

/// Kind of mutation recorded in a queue event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// New entry created.
    Create,
    /// Existing entry updated.
    Update,
    /// Entry removed. Never conflated away (destroy-wins).
    Destroy,
    /// Entry invalidated (value dropped, key retained).
    Invalidate,
}

impl OpKind {
    /// Returns true for operations that may be replaced by a newer pending
    /// event for the same key under conflation.
    pub fn conflatable(&self) -> bool {
        !matches!(self, OpKind::Destroy)
    }
}

/// Identity of an event for remote idempotent apply: the originating member
/// plus its per-queue monotonic sequence token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    /// Member that captured the mutation.
    pub origin_member: MemberId,
    /// Per-sender monotonic sequence token.
    pub sequence_token: u64,
}

/// A single captured mutation waiting for (or in flight to) the remote site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Region the mutation belongs to.
    pub region: String,
    /// Entry key.
    pub key: Vec<u8>,
    /// Snapshot of the committed value; `None` for destroy/invalidate.
    pub value: Option<Vec<u8>>,
    /// Mutation kind.
    pub op: OpKind,
    /// Member that captured the mutation.
    pub origin_member: MemberId,
    /// Monotonically increasing token, assigned per sender at capture time.
    pub sequence_token: u64,
    /// Storage partition (bucket) the key lives in.
    pub partition_id: u32,
    /// Identifier of the capturing thread, for THREAD order policy.
    pub capture_thread: u64,
    /// Microseconds since Unix epoch at enqueue.
    pub enqueue_timestamp_us: u64,
}

/// Microseconds since the Unix epoch.
pub(crate) fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl QueueEvent {
    /// Identity used for remote deduplication.
    pub fn event_id(&self) -> EventId {
        EventId {
            origin_member: self.origin_member.clone(),
            sequence_token: self.sequence_token,
        }
    }

    /// Approximate in-memory cost in bytes, used for the queue memory
    /// ceiling. Key and value payloads plus a fixed overhead.
    pub fn approx_size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, |v| v.len()) + EVENT_OVERHEAD_BYTES
    }
}
