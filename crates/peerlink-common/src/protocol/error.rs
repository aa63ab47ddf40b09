use thiserror::Error;

use crate::peer::ClientId;
use crate::protocol::jsonrpc::RequestId;

#[derive(Error, Debug)]
pub enum PeerlinkError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection closed locally")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message too large: {0} bytes buffered without a delimiter")]
    MessageTooLarge(usize),

    #[error("Response id {0} matches no outstanding request")]
    UnmatchedResponse(String),

    #[error("Request id {0} is already outstanding")]
    DuplicateRequestId(RequestId),

    #[error("Request {0} was in flight when the link was replaced")]
    RequestLost(RequestId),

    #[error("Peer pool exhausted")]
    PoolExhausted,

    #[error("Permanent failure for {client}: no replacement peer after {attempts} connection attempts")]
    PermanentFailure { client: ClientId, attempts: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Signature error: {0}")]
    Signature(String),
}

impl PeerlinkError {
    /// Whether the reconnection policy should recover from this error.
    ///
    /// Covers timeouts, resets, refusals and other socket-level failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PeerlinkError::Connection(_) | PeerlinkError::Timeout(_) | PeerlinkError::Io(_)
        )
    }

    /// Whether this error must abort startup instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PeerlinkError::InvalidConfig(_))
    }
}

impl From<std::net::AddrParseError> for PeerlinkError {
    fn from(err: std::net::AddrParseError) -> Self {
        PeerlinkError::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PeerlinkError>;
