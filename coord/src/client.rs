use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Identifier of a client session; ephemeral nodes live as long as it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Connection state transitions reported to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// First successful connection
    Connected,
    /// Connection dropped; the session may still be alive
    Suspended,
    /// Connection re-established after a suspension or loss
    Reconnected,
    /// Session is gone along with its ephemeral nodes
    Lost,
    /// Connected to a server that only accepts reads
    ReadOnly,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Reconnected | ConnectionState::ReadOnly
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Suspended => "SUSPENDED",
            ConnectionState::Reconnected => "RECONNECTED",
            ConnectionState::Lost => "LOST",
            ConnectionState::ReadOnly => "READ_ONLY",
        };
        f.write_str(name)
    }
}

/// Access control applied to a node at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acl {
    /// Anyone may read, modify or delete the node
    OpenUnsafe,
    /// Only the creating session may modify or delete the node
    CreatorAll,
    /// Anyone may read, nobody but the creator may delete
    ReadUnsafe,
}

impl Acl {
    pub fn permits_delete(self, owner: Option<SessionId>, session: SessionId) -> bool {
        match self {
            Acl::OpenUnsafe => true,
            Acl::CreatorAll | Acl::ReadUnsafe => owner == Some(session),
        }
    }
}

/// Metadata returned by an existence check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStat {
    pub ephemeral_owner: Option<SessionId>,
    pub version: u64,
    pub data_length: usize,
}

/// Operations the lease layer needs from a coordination service.
///
/// Implementations report `Error::NodeExists` when a create loses a race and
/// `Error::NoNode` when a read or delete targets a missing node. Every other
/// failure is either recoverable or, for `Error::Fatal`, must be escalated.
#[async_trait]
pub trait CoordinationClient: Send + Sync + std::fmt::Debug {
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>>;

    async fn read(&self, path: &str) -> Result<Bytes>;

    async fn create_ephemeral(&self, path: &str, data: &[u8], acl: Acl) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete that keeps being retried by the client across reconnects until
    /// it goes through, even if this call itself reports a failure.
    async fn delete_guaranteed(&self, path: &str) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Session that ephemeral nodes created right now would belong to, if
    /// the client tracks one
    fn current_session(&self) -> Option<SessionId>;

    fn connection_state(&self) -> ConnectionState;

    fn subscribe(&self) -> broadcast::Receiver<ConnectionState>;
}

#[async_trait]
impl<C: CoordinationClient + ?Sized> CoordinationClient for Arc<C> {
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        (**self).exists(path).await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        (**self).read(path).await
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8], acl: Acl) -> Result<()> {
        (**self).create_ephemeral(path, data, acl).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn delete_guaranteed(&self, path: &str) -> Result<()> {
        (**self).delete_guaranteed(path).await
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    fn current_session(&self) -> Option<SessionId> {
        (**self).current_session()
    }

    fn connection_state(&self) -> ConnectionState {
        (**self).connection_state()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        (**self).subscribe()
    }
}
