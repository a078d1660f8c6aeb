//! Remote data sources: relay data APIs, execution JSON-RPC, beacon API and
//! the `newHeads` WebSocket stream.

pub mod beacon;
pub mod execution;
pub mod header_stream;
pub mod relay;

use std::fmt;

pub use beacon::BeaconClient;
pub use execution::{ExecutionRpcClient, ExecutionSource};
pub use header_stream::{HeaderStream, StreamState};
pub use relay::{PayloadSource, RelayClient};

/// Failure of a single source request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Timeout,
    /// Non-success HTTP status.
    HttpStatus(u16),
    /// Connection-level failure (DNS, reset, TLS).
    Transport(String),
    /// Body or JSON-RPC envelope with an unexpected shape.
    Malformed(String),
}

impl FetchError {
    /// Timeouts, transport failures, 429 and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::HttpStatus(code) => *code == 429 || *code >= 500,
            Self::Malformed(_) => false,
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::HttpStatus(status.as_u16())
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::HttpStatus(code) => write!(f, "HTTP status {}", code),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Malformed(msg) => write!(f, "malformed response: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}
