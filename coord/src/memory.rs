// In-process coordination service.
//
// Nodes live in a shared table keyed by absolute path. Each connected client
// owns one session; ephemeral nodes disappear when their session expires or
// the client closes. Clients can be suspended, reconnected and fault-injected
// so callers can exercise disconnect and race handling without a real
// ensemble.

use crate::{
    client::{Acl, ConnectionState, CoordinationClient, NodeStat, SessionId},
    CoordinationConfig, Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    ephemeral_owner: Option<SessionId>,
    acl: Acl,
    version: u64,
}

#[derive(Debug, Default)]
struct Shared {
    nodes: DashMap<String, Node>,
    next_session: AtomicU64,
}

/// Handle to the shared node table. Cloning yields another handle to the same service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCoordinator {
    inner: Arc<Shared>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new session and returns a connected client bound to it
    pub fn connect(&self, config: CoordinationConfig) -> Arc<InMemoryClient> {
        let session = self.open_session();
        info!(%session, connect = %config.connect_string, "opened coordination session");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|this| InMemoryClient {
            service: self.clone(),
            config,
            state: Mutex::new(ClientState {
                session,
                connection: ConnectionState::Connected,
                running: true,
                suspensions: 0,
                pending_deletes: Vec::new(),
            }),
            events,
            faults: Mutex::new(Vec::new()),
            ops: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Creates a node that is not tied to any session
    pub fn create_persistent(&self, path: &str, data: &[u8]) -> Result<()> {
        match self.inner.nodes.entry(path.to_string()) {
            Entry::Occupied(_) => Err(Error::NodeExists {
                path: path.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Node {
                    data: Bytes::copy_from_slice(data),
                    ephemeral_owner: None,
                    acl: Acl::OpenUnsafe,
                    version: 0,
                });
                Ok(())
            }
        }
    }

    pub fn node_data(&self, path: &str) -> Option<Bytes> {
        self.inner.nodes.get(path).map(|node| node.data.clone())
    }

    pub fn node_owner(&self, path: &str) -> Option<SessionId> {
        self.inner
            .nodes
            .get(path)
            .and_then(|node| node.ephemeral_owner)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        paths
    }

    fn open_session(&self) -> SessionId {
        SessionId(self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn drop_session(&self, session: SessionId) -> usize {
        let mut dropped = 0;
        self.inner.nodes.retain(|_, node| {
            let keep = node.ephemeral_owner != Some(session);
            if !keep {
                dropped += 1;
            }
            keep
        });
        dropped
    }

    fn remove(&self, session: SessionId, path: &str) -> Result<()> {
        match self.inner.nodes.entry(path.to_string()) {
            Entry::Vacant(_) => Err(Error::NoNode {
                path: path.to_string(),
            }),
            Entry::Occupied(entry) => {
                let node = entry.get();
                if !node.acl.permits_delete(node.ephemeral_owner, session) {
                    return Err(Error::NoAuth {
                        path: path.to_string(),
                    });
                }
                entry.remove();
                Ok(())
            }
        }
    }
}

/// Kinds of client operation that a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Exists,
    Read,
    Create,
    Delete,
}

impl Operation {
    fn is_write(self) -> bool {
        matches!(self, Operation::Create | Operation::Delete)
    }
}

/// Failure injected into the next matching operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    ConnectionLoss,
    NodeExists,
    NoNode,
    Fatal(String),
    Other(String),
}

impl Fault {
    fn into_error(self, path: &str) -> Error {
        match self {
            Fault::ConnectionLoss => Error::ConnectionLoss,
            Fault::NodeExists => Error::NodeExists {
                path: path.to_string(),
            },
            Fault::NoNode => Error::NoNode {
                path: path.to_string(),
            },
            Fault::Fatal(message) => Error::Fatal(message),
            Fault::Other(message) => Error::Injected(message),
        }
    }
}

#[derive(Debug)]
struct ClientState {
    session: SessionId,
    connection: ConnectionState,
    running: bool,
    /// Bumped on every suspension so a stale expiry timer can tell it lost the race
    suspensions: u64,
    pending_deletes: Vec<String>,
}

/// A session-bound client of an [`InMemoryCoordinator`]
#[derive(Debug)]
pub struct InMemoryClient {
    service: InMemoryCoordinator,
    config: CoordinationConfig,
    state: Mutex<ClientState>,
    events: broadcast::Sender<ConnectionState>,
    faults: Mutex<Vec<(Operation, Fault)>>,
    ops: AtomicU64,
    this: Weak<InMemoryClient>,
}

impl InMemoryClient {
    pub fn session_id(&self) -> SessionId {
        self.state.lock().session
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Number of operations issued against the service, failed ones included
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::SeqCst)
    }

    /// Makes the next `op` fail with `fault`. Faults queue up per operation.
    pub fn fail_next(&self, op: Operation, fault: Fault) {
        self.faults.lock().push((op, fault));
    }

    /// Drops the connection while keeping the session. If the client does not
    /// reconnect within the session timeout the session expires.
    pub fn suspend(&self) {
        let epoch = {
            let mut state = self.state.lock();
            if !state.running || !state.connection.is_connected() {
                return;
            }
            state.connection = ConnectionState::Suspended;
            state.suspensions += 1;
            state.suspensions
        };

        self.notify(ConnectionState::Suspended);
        self.schedule_expiry(epoch);
    }

    /// Re-establishes the connection. A lost session is replaced by a new one.
    /// Guaranteed deletes recorded while disconnected are completed first.
    pub fn reconnect(&self) {
        let (session, pending) = {
            let mut state = self.state.lock();
            if !state.running || state.connection.is_connected() {
                return;
            }
            if state.connection == ConnectionState::Lost {
                state.session = self.service.open_session();
                info!(session = %state.session, "opened replacement coordination session");
            }
            state.connection = ConnectionState::Reconnected;
            (state.session, std::mem::take(&mut state.pending_deletes))
        };

        for path in pending {
            self.finish_guaranteed_delete(session, &path);
        }

        self.notify(ConnectionState::Reconnected);
    }

    /// Expires the session right away, removing its ephemeral nodes
    pub fn expire_session(&self) {
        let session = {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Lost {
                return;
            }
            state.connection = ConnectionState::Lost;
            state.pending_deletes.clear();
            state.session
        };

        let dropped = self.service.drop_session(session);
        info!(%session, dropped, "coordination session expired");
        self.notify(ConnectionState::Lost);
    }

    /// Stops the client for good; its ephemeral nodes go away with it
    pub fn close(&self) {
        let session = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.connection = ConnectionState::Lost;
            state.pending_deletes.clear();
            state.session
        };

        let dropped = self.service.drop_session(session);
        info!(%session, dropped, "coordination client closed");
        self.notify(ConnectionState::Lost);
    }

    fn notify(&self, state: ConnectionState) {
        debug!(session = %self.session_id(), %state, "connection state changed");
        // Nobody listening is fine
        let _ = self.events.send(state);
    }

    fn schedule_expiry(&self, epoch: u64) {
        let timeout = self.config.session_timeout();
        let client = self.this.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(client) = client.upgrade() {
                        client.expire_if_still_suspended(epoch);
                    }
                });
            }
            Err(_) => {
                warn!("no tokio runtime available, suspended session will only expire explicitly");
            }
        }
    }

    fn expire_if_still_suspended(&self, epoch: u64) {
        let expire = {
            let state = self.state.lock();
            state.connection == ConnectionState::Suspended && state.suspensions == epoch
        };
        if expire {
            self.expire_session();
        }
    }

    fn finish_guaranteed_delete(&self, session: SessionId, path: &str) {
        let owned = self
            .service
            .inner
            .nodes
            .get(path)
            .map(|node| node.ephemeral_owner == Some(session))
            .unwrap_or(false);

        if !owned {
            debug!(path, "guaranteed delete target is gone or owned elsewhere");
            return;
        }

        match self.service.remove(session, path) {
            Ok(()) => debug!(path, "completed guaranteed delete"),
            Err(e) => warn!(path, error = %e, "guaranteed delete failed after reconnect"),
        }
    }

    fn take_fault(&self, op: Operation) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let index = faults.iter().position(|(target, _)| *target == op)?;
        Some(faults.remove(index).1)
    }

    fn begin(&self, op: Operation, path: &str) -> Result<SessionId> {
        self.ops.fetch_add(1, Ordering::SeqCst);

        if let Some(fault) = self.take_fault(op) {
            return Err(fault.into_error(path));
        }

        let state = self.state.lock();
        if !state.running {
            return Err(Error::NotRunning);
        }
        match state.connection {
            ConnectionState::ReadOnly if op.is_write() => Err(Error::Other(anyhow::anyhow!(
                "server is read-only, cannot modify {path}"
            ))),
            connection if connection.is_connected() => Ok(state.session),
            ConnectionState::Lost => Err(Error::SessionExpired {
                session: state.session,
            }),
            _ => Err(Error::ConnectionLoss),
        }
    }
}

#[async_trait]
impl CoordinationClient for InMemoryClient {
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        self.begin(Operation::Exists, path)?;

        Ok(self.service.inner.nodes.get(path).map(|node| NodeStat {
            ephemeral_owner: node.ephemeral_owner,
            version: node.version,
            data_length: node.data.len(),
        }))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.begin(Operation::Read, path)?;

        self.service
            .node_data(path)
            .ok_or_else(|| Error::NoNode {
                path: path.to_string(),
            })
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8], acl: Acl) -> Result<()> {
        let session = self.begin(Operation::Create, path)?;

        match self.service.inner.nodes.entry(path.to_string()) {
            Entry::Occupied(_) => Err(Error::NodeExists {
                path: path.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Node {
                    data: Bytes::copy_from_slice(data),
                    ephemeral_owner: Some(session),
                    acl,
                    version: 0,
                });
                Ok(())
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let session = self.begin(Operation::Delete, path)?;
        self.service.remove(session, path)
    }

    async fn delete_guaranteed(&self, path: &str) -> Result<()> {
        match self.begin(Operation::Delete, path) {
            Ok(session) => self.service.remove(session, path),
            Err(err @ (Error::ConnectionLoss | Error::SessionExpired { .. })) => {
                debug!(path, "recording guaranteed delete until reconnect");
                self.state.lock().pending_deletes.push(path.to_string());
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn current_session(&self) -> Option<SessionId> {
        Some(self.state.lock().session)
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }
}
