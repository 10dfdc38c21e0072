//! Error types shared by every layer of the DCP client.

use std::io;
use thiserror::Error;

/// Main error type for DCP client operations.
#[derive(Error, Debug)]
pub enum DcpError {
    /// IO error during socket operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed memcached binary frame (bad magic, truncated header, etc).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A wait operation (connect, stream open, failover log fetch, ...) timed out.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The peer closed the socket or stopped responding.
    #[error("channel disconnected: {0}")]
    Disconnected(String),

    /// A DCP_STREAM_REQ referenced a vbucket/state combination the server rejected
    /// with INVALID_ARGUMENTS. Always fatal.
    #[error("invalid arguments for vbucket {vbid}: {detail}")]
    InvalidArguments { vbid: u16, detail: String },

    /// SASL negotiation failed. Always fatal.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Bucket named in the configuration does not exist on the cluster.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// The channels lock, inbox, or backlog could not be reached because the
    /// conductor has already begun shutting down.
    #[error("conductor is disconnecting")]
    Disconnecting,

    /// A request was made against a vbucket this client has no routing entry for.
    #[error("no known master for vbucket {0}")]
    NoMasterForVbucket(u16),

    /// The Fixer exhausted its retry budget for an event.
    #[error("retry budget exhausted after {0} attempts")]
    RetryBudgetExhausted(u32),

    /// Frame body failed to decode into the expected shape (failover log, seqno list, ...).
    #[error("malformed response body: {0}")]
    MalformedBody(String),

    /// Flow control was configured inconsistently (e.g. watermark=0 while enabled).
    #[error("invalid flow control configuration: {0}")]
    InvalidFlowControl(String),

    /// Session state failed to (de)serialize.
    #[error("session state (de)serialization error: {0}")]
    Serde(String),
}

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DcpError>;

impl DcpError {
    /// Build a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Build a malformed-body error with a message.
    pub fn malformed_body(msg: impl Into<String>) -> Self {
        Self::MalformedBody(msg.into())
    }

    /// Build a disconnected error naming the peer/channel.
    pub fn disconnected(detail: impl Into<String>) -> Self {
        Self::Disconnected(detail.into())
    }

    /// Whether a retry (within the same call, or via the Fixer) is ever appropriate
    /// for this error. Fatal errors (auth, bucket-not-found, invalid-arguments, retry
    /// budget exhaustion) return `false`.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            Self::Timeout(_) | Self::Disconnected(_) | Self::NoMasterForVbucket(_) => true,
            Self::AuthenticationFailed(_)
            | Self::BucketNotFound(_)
            | Self::InvalidArguments { .. }
            | Self::RetryBudgetExhausted(_)
            | Self::Disconnecting
            | Self::InvalidFlowControl(_) => false,
            Self::Protocol(_) | Self::MalformedBody(_) | Self::Serde(_) => false,
        }
    }

    /// Whether this error represents the underlying connection going away, as
    /// opposed to a protocol-level rejection on an otherwise healthy socket.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Timeout(_))
    }
}
