#![warn(missing_docs)]

//! GridGate WAN replication: gateway senders with durable ordered queues,
//! batch dispatch, conflation, and cluster-wide lifecycle coordination.

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod filter;
pub mod persistence;
pub mod queue;
pub mod registry;
pub mod sender;
pub mod transport;

pub use config::{SenderConfig, SenderScope};
pub use coordinator::{MemberOutcome, OutcomeStatus, SenderLifecycleCoordinator};
pub use error::{ConfigError, WanError};
pub use sender::{GatewaySender, RuntimeState};
