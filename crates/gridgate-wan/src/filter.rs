//! Pluggable event and transport filter chains.
//!
//! Sender configurations reference filters by identifier; the registry maps
//! identifiers to instances at pipeline build time so configurations stay
//! serializable.

use crate::error::ConfigError;
use crate::event::QueueEvent;
use std::collections::HashMap;
use std::sync::Arc;

/// Predicate applied to each captured event before it enters the queue.
pub trait GatewayEventFilter: Send + Sync {
    /// Return false to drop the event from replication.
    fn before_enqueue(&self, event: &QueueEvent) -> bool;
}

/// Transform applied to a batch's wire form at send and receive time.
///
/// Outbound transforms run in declared order; inbound transforms run in
/// reverse so chains invert cleanly.
pub trait GatewayTransportFilter: Send + Sync {
    /// Transform the outbound wire bytes.
    fn outbound(&self, bytes: Vec<u8>) -> Vec<u8>;
    /// Invert the transform on inbound wire bytes.
    fn inbound(&self, bytes: Vec<u8>) -> Vec<u8>;
}

/// Maps filter identifiers (as referenced by `SenderConfig`) to instances.
#[derive(Default)]
pub struct FilterRegistry {
    event_filters: HashMap<String, Arc<dyn GatewayEventFilter>>,
    transport_filters: HashMap<String, Arc<dyn GatewayTransportFilter>>,
}

impl FilterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event filter under an identifier.
    pub fn register_event_filter(
        &mut self,
        id: impl Into<String>,
        filter: Arc<dyn GatewayEventFilter>,
    ) {
        self.event_filters.insert(id.into(), filter);
    }

    /// Register a transport filter under an identifier.
    pub fn register_transport_filter(
        &mut self,
        id: impl Into<String>,
        filter: Arc<dyn GatewayTransportFilter>,
    ) {
        self.transport_filters.insert(id.into(), filter);
    }

    /// Resolve an ordered identifier list to event filter instances.
    pub fn resolve_event_filters(
        &self,
        ids: &[String],
    ) -> Result<Vec<Arc<dyn GatewayEventFilter>>, ConfigError> {
        ids.iter()
            .map(|id| {
                self.event_filters
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownFilter { id: id.clone() })
            })
            .collect()
    }

    /// Resolve an ordered identifier list to transport filter instances.
    pub fn resolve_transport_filters(
        &self,
        ids: &[String],
    ) -> Result<Vec<Arc<dyn GatewayTransportFilter>>, ConfigError> {
        ids.iter()
            .map(|id| {
                self.transport_filters
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownFilter { id: id.clone() })
            })
            .collect()
    }
}

/// Apply a transport filter chain to outbound wire bytes, in order.
pub fn apply_outbound(filters: &[Arc<dyn GatewayTransportFilter>], bytes: Vec<u8>) -> Vec<u8> {
    filters.iter().fold(bytes, |b, f| f.outbound(b))
}

/// Apply a transport filter chain to inbound wire bytes, in reverse order.
pub fn apply_inbound(filters: &[Arc<dyn GatewayTransportFilter>], bytes: Vec<u8>) -> Vec<u8> {
    filters.iter().rev().fold(bytes, |b, f| f.inbound(b))
}
