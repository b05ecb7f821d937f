use crate::client::SessionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    #[error("No node for path {path}")]
    NoNode { path: String },

    #[error("Not authorized to modify {path}")]
    NoAuth { path: String },

    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    #[error("Session {session} expired")]
    SessionExpired { session: SessionId },

    #[error("Coordination client is not running")]
    NotRunning,

    #[error("Injected fault: {0}")]
    Injected(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Fatal errors must not be swallowed by callers that otherwise log and
    /// retry on the next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, Error::NodeExists { .. })
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::NoNode { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
