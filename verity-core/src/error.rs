/// Verity Error Types
///
/// Error taxonomy for the retrieval subsystem. Inbound protocol failures
/// never propagate as panics; they are logged and converted into waiter
/// sentinels at the scheduler boundary. Caller-supplied inputs that violate
/// preconditions (wrong-length key, oversized batch) fail synchronously.
use std::io;
use thiserror::Error;

/// Main error type for Verity operations
#[derive(Error, Debug)]
pub enum VerityError {
    /// IO error on a transport
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Key input could not be normalized to 32 bytes
    #[error("Bad key length: {actual} bytes (expected 32)")]
    BadKeyLength { actual: usize },

    /// Binary cube failed structural validation
    #[error("Bad cube format: {0}")]
    BadCubeFormat(String),

    /// Proof-of-work below the configured threshold
    #[error("Insufficient difficulty: {actual} (required {required})")]
    InsufficientDifficulty { required: u8, actual: u8 },

    /// Cube rejected by the retention policy
    #[error("Rejected by retention policy")]
    RetentionReject,

    /// Waiter deadline reached without fulfillment
    #[error("Request timed out")]
    Timeout,

    /// No online peer satisfies the current request
    #[error("No suitable peer available")]
    NoPeerAvailable,

    /// Scheduler has been shut down
    #[error("Scheduler shut down")]
    SchedulerShutdown,

    /// Transport-level failure, session torn down
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol violation from a remote peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Channel to an actor or peer pump is gone
    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type alias for Verity operations
pub type Result<T> = std::result::Result<T, VerityError>;

impl VerityError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a transport error with a message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a bad-cube-format error with a message
    pub fn bad_cube(msg: impl Into<String>) -> Self {
        Self::BadCubeFormat(msg.into())
    }

    /// Validation failures are local and silently dropped for inbound data
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::BadKeyLength { .. }
                | Self::BadCubeFormat(_)
                | Self::InsufficientDifficulty { .. }
                | Self::RetentionReject
        )
    }

    /// Whether the request may succeed on a later pacing tick
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::NoPeerAvailable | Self::Timeout)
    }

    /// Whether the error ends the owning session
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Transport(_) | Self::ChannelClosed)
    }
}
