//! Error types for the gateway sender subsystem.

use thiserror::Error;

/// Failures detected by pure configuration validation.
///
/// These are always rejected before any pipeline is created, both centrally
/// (before cluster fan-out) and defensively on each member.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// More than one dispatcher thread was requested without an order policy.
    #[error("{threads} dispatcher threads configured but no order policy is set")]
    MissingOrderPolicy {
        /// The configured dispatcher thread count.
        threads: usize,
    },

    /// Socket read timeout below the supported minimum.
    #[error("socket read timeout {timeout_ms}ms is below the minimum {minimum_ms}ms")]
    InvalidTimeout {
        /// The rejected timeout value.
        timeout_ms: u64,
        /// The enforced minimum.
        minimum_ms: u64,
    },

    /// A sender attribute is out of range or empty.
    #[error("invalid sender attribute: {msg}")]
    InvalidAttribute {
        /// Description of the rejected attribute.
        msg: String,
    },

    /// A configured filter identifier is not registered.
    #[error("unknown filter: {id}")]
    UnknownFilter {
        /// The unresolved filter identifier.
        id: String,
    },
}

/// Runtime errors of the gateway sender subsystem.
#[derive(Debug, Error)]
pub enum WanError {
    /// Configuration rejected by validation.
    #[error("configuration rejected")]
    Config(#[from] ConfigError),

    /// A sender with this id already exists.
    #[error("gateway sender {id} already exists")]
    DuplicateSender {
        /// The duplicate sender id.
        id: String,
    },

    /// No sender with this id is known.
    #[error("gateway sender {id} not found")]
    SenderNotFound {
        /// The unknown sender id.
        id: String,
    },

    /// A member did not respond to a lifecycle request in time.
    #[error("member {member_id} unreachable: {msg}")]
    MemberUnreachable {
        /// The unreachable member.
        member_id: String,
        /// Why the member is considered unreachable.
        msg: String,
    },

    /// An enqueue blocked on the queue memory ceiling longer than allowed.
    ///
    /// Surfaced to the mutation caller as a failure of that single mutation,
    /// not of the sender.
    #[error("enqueue blocked for {waited_ms}ms by the queue memory ceiling")]
    BackpressureTimeout {
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// Batch transport failure (send error or broken link).
    #[error("transport failure: {msg}")]
    Transport {
        /// Description of the transport fault.
        msg: String,
    },

    /// No acknowledgment arrived within the socket read timeout.
    #[error("no acknowledgment within {timeout_ms}ms")]
    AckTimeout {
        /// The ack wait ceiling that expired.
        timeout_ms: u64,
    },

    /// Durable log write failure. Fatal to the member's pipeline: the sender
    /// transitions to a failed state and must be explicitly recreated.
    #[error("persistence failure: {msg}")]
    Persistence {
        /// Description of the log fault.
        msg: String,
    },

    /// A lifecycle operation is not valid in the sender's current state.
    #[error("cannot {action} sender in state {state}")]
    InvalidTransition {
        /// The attempted operation.
        action: String,
        /// The state the sender was in.
        state: String,
    },

    /// Wire serialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The sender pipeline has been destroyed or has failed.
    #[error("sender pipeline shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let e = ConfigError::MissingOrderPolicy { threads: 2 };
        assert_eq!(
            e.to_string(),
            "2 dispatcher threads configured but no order policy is set"
        );

        let e = ConfigError::InvalidTimeout {
            timeout_ms: 100,
            minimum_ms: 500,
        };
        assert!(e.to_string().contains("below the minimum 500ms"));
    }

    #[test]
    fn wan_error_from_config_error() {
        let cfg_err = ConfigError::InvalidAttribute {
            msg: "batch size must be > 0".to_string(),
        };
        let wan: WanError = cfg_err.into();
        assert!(matches!(wan, WanError::Config(_)));
    }

    #[test]
    fn wan_error_display() {
        let e = WanError::SenderNotFound {
            id: "ln".to_string(),
        };
        assert_eq!(e.to_string(), "gateway sender ln not found");

        let e = WanError::BackpressureTimeout { waited_ms: 60_000 };
        assert!(e.to_string().contains("60000ms"));
    }

    #[test]
    fn config_error_equality() {
        let a = ConfigError::UnknownFilter {
            id: "f1".to_string(),
        };
        let b = ConfigError::UnknownFilter {
            id: "f1".to_string(),
        };
        assert_eq!(a, b);
    }
}
