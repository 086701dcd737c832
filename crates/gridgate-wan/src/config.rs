//! Gateway sender configuration and validation.
//!
//! A `SenderConfig` is an immutable, validated description of one gateway
//! sender. It is owned by the cluster-wide metadata store and referenced by
//! each member's local pipeline; members never mutate it after creation.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Unique identifier for a cluster member.
pub type MemberId = String;

/// Unique identifier for a remote site (distributed system).
pub type SiteId = u64;

/// Minimum allowed socket read timeout, in milliseconds.
pub const MINIMUM_SOCKET_READ_TIMEOUT_MS: u64 = 500;

/// Default number of dispatcher threads per sender.
pub const DEFAULT_DISPATCHER_THREADS: usize = 5;

/// Default batch size (events per batch).
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default batch time interval, in milliseconds.
pub const DEFAULT_BATCH_TIME_INTERVAL_MS: u64 = 1000;

/// Default socket buffer size, in bytes.
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 524_288;

/// Default socket read timeout, in milliseconds.
pub const DEFAULT_SOCKET_READ_TIMEOUT_MS: u64 = 30_000;

/// Default queue memory ceiling, in megabytes.
pub const DEFAULT_MAX_QUEUE_MEMORY_MB: u64 = 100;

/// Queue topology of a gateway sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// One global ordered queue per sender per member, optionally sharded
    /// into FIFO lanes by order policy.
    Serial,
    /// One queue per local storage partition; horizontal dispatch scale-out
    /// at the cost of global ordering.
    Parallel,
}

/// Rule mapping an event to one of several ordered lanes when multiple
/// dispatcher threads serve one sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPolicy {
    /// Lane chosen by hash of the event key.
    Key,
    /// Lane chosen by the capturing thread.
    Thread,
    /// Lane chosen by the storage partition id.
    Partition,
}

/// Which members of the cluster instantiate a sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderScope {
    /// Every member of the cluster.
    AllMembers,
    /// A single named member.
    Member(MemberId),
    /// Every member of a named group. A group matching zero members is not
    /// an error.
    Group(String),
}

/// Immutable description of one gateway sender's attributes.
///
/// Identified by a cluster-unique `id`. Validated once centrally before
/// fan-out and again defensively on each member before local instantiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Cluster-unique sender id.
    pub id: String,
    /// Target remote site. Must differ from the local site id.
    pub remote_site_id: SiteId,
    /// Queue topology.
    pub topology: Topology,
    /// Number of dispatcher threads draining the queue.
    pub dispatcher_threads: usize,
    /// Lane routing rule; required whenever `dispatcher_threads > 1`.
    pub order_policy: Option<OrderPolicy>,
    /// If true, the pipeline is created but dispatch waits for an explicit
    /// start command.
    pub manual_start: bool,
    /// Flush a batch once it holds this many events.
    pub batch_size: usize,
    /// Flush a batch once the oldest unflushed event is this old (ms).
    pub batch_time_interval_ms: u64,
    /// Replace pending same-key updates instead of queueing both.
    pub enable_batch_conflation: bool,
    /// Mirror the queue to a durable event log.
    pub enable_persistence: bool,
    /// Whether log writes block the enqueueing caller. When false, enqueue
    /// may return before the write is durable; events can be lost across a
    /// crash in this mode.
    pub disk_synchronous: bool,
    /// Queue memory ceiling in megabytes; producers block when exceeded.
    pub max_queue_memory_mb: u64,
    /// Staleness alarm threshold on the oldest unacknowledged event (ms).
    /// Zero disables the alert.
    pub alert_threshold_ms: u64,
    /// Socket buffer size hint for the transport, in bytes.
    pub socket_buffer_size: usize,
    /// How long a dispatcher waits for a batch acknowledgment (ms).
    pub socket_read_timeout_ms: u64,
    /// Ordered event filter identifiers applied at enqueue time.
    pub event_filters: Vec<String>,
    /// Ordered transport filter identifiers applied to the wire form.
    pub transport_filters: Vec<String>,
    /// Which members instantiate this sender.
    pub scope: SenderScope,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            remote_site_id: 0,
            topology: Topology::Serial,
            dispatcher_threads: DEFAULT_DISPATCHER_THREADS,
            order_policy: Some(OrderPolicy::Key),
            manual_start: false,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_time_interval_ms: DEFAULT_BATCH_TIME_INTERVAL_MS,
            enable_batch_conflation: false,
            enable_persistence: false,
            disk_synchronous: true,
            max_queue_memory_mb: DEFAULT_MAX_QUEUE_MEMORY_MB,
            alert_threshold_ms: 0,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            socket_read_timeout_ms: DEFAULT_SOCKET_READ_TIMEOUT_MS,
            event_filters: vec![],
            transport_filters: vec![],
            scope: SenderScope::AllMembers,
        }
    }
}

impl SenderConfig {
    /// Create a config with the given id and remote site, all other
    /// attributes at their defaults.
    pub fn new(id: impl Into<String>, remote_site_id: SiteId) -> Self {
        Self {
            id: id.into(),
            remote_site_id,
            ..Default::default()
        }
    }

    /// Validate this configuration. Pure and side-effect free.
    ///
    /// Rejects multi-threaded dispatch without an order policy, timeouts
    /// below [`MINIMUM_SOCKET_READ_TIMEOUT_MS`], and zero-valued batch or
    /// thread attributes. Cluster-level checks (duplicate id, unknown id)
    /// live in the lifecycle coordinator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::InvalidAttribute {
                msg: "sender id must not be empty".to_string(),
            });
        }
        if self.dispatcher_threads == 0 {
            return Err(ConfigError::InvalidAttribute {
                msg: "dispatcher threads must be >= 1".to_string(),
            });
        }
        if self.dispatcher_threads > 1 && self.order_policy.is_none() {
            return Err(ConfigError::MissingOrderPolicy {
                threads: self.dispatcher_threads,
            });
        }
        if self.socket_read_timeout_ms < MINIMUM_SOCKET_READ_TIMEOUT_MS {
            return Err(ConfigError::InvalidTimeout {
                timeout_ms: self.socket_read_timeout_ms,
                minimum_ms: MINIMUM_SOCKET_READ_TIMEOUT_MS,
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidAttribute {
                msg: "batch size must be > 0".to_string(),
            });
        }
        if self.batch_time_interval_ms == 0 {
            return Err(ConfigError::InvalidAttribute {
                msg: "batch time interval must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Returns true if `scope` places this sender on the given member.
    pub fn covers_member(&self, member_id: &str, member_groups: &[String]) -> bool {
        match &self.scope {
            SenderScope::AllMembers => true,
            SenderScope::Member(m) => m == member_id,
            SenderScope::Group(g) => member_groups.iter().any(|mg| mg == g),
        }
    }

    /// JSON snapshot of this configuration, for management tooling.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
