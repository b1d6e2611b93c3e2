use thiserror::Error;

use murmur_shared::ProtocolError;

/// Failures reported by a broker backend.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Broker operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Not connected")]
    NotConnected,

    #[error("Record channel closed")]
    ChannelClosed,

    #[error("Broker error: {0}")]
    Backend(String),
}

/// Errors surfaced to callers of the gateway.
///
/// Presence query failures and malformed inbound records never appear
/// here; they degrade the best-effort view and are logged instead.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Connection failed: {0}")]
    Connection(#[source] BrokerError),

    #[error("Subscription failed: {0}")]
    Subscription(#[source] BrokerError),

    #[error("Publish failed: {source}")]
    Publish {
        #[source]
        source: BrokerError,
    },

    #[error("Publish failed on fragment {index} of {total}: {source}")]
    FragmentPublish {
        index: u32,
        total: u32,
        #[source]
        source: BrokerError,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] ProtocolError),

    #[error("Session already joined")]
    AlreadyJoined,

    #[error("Session not joined")]
    NotJoined,

    #[error("Topic {0} does not carry chat messages")]
    InvalidTopic(murmur_shared::Topic),
}

impl GatewayError {
    /// Index of the first fragment that failed to publish, if any.
    pub fn failed_fragment(&self) -> Option<u32> {
        match self {
            Self::FragmentPublish { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Whether a fresh join attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Subscription(_) | Self::Publish { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
