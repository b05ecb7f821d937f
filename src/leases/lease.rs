// Lease backed by an ephemeral coordination node

use super::{manager::Shared, LeaseStatus};
use crate::Result;
use bytes::Bytes;
use coord::{Acl, CoordinationClient};
use std::sync::Weak;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A named lease balanced across the cluster.
///
/// The cluster hash ring decides which process should hold each lease, so
/// processes sharing a membership view never compete for the same one. The
/// designated process holds the lease by creating an ephemeral node named
/// after it, with the lease name as payload. Every `check_held` re-evaluates
/// the ring and releases the node if this process is no longer the owner,
/// letting the new owner pick it up on its next check.
///
/// Once acquired, a lease stays held while the process keeps its session.
/// A network partition or a long pause can outlast the session timeout, in
/// which case the node disappears underneath the holder. Work guarded by a
/// lease should take less time than the session timeout, otherwise two
/// processes may briefly run it at once.
///
/// A node with a matching payload but another session as ephemeral owner is
/// foreign. Clients that report no session fall back to the payload alone.
pub struct Lease {
    name: String,
    data: Bytes,
    status: Mutex<LeaseStatus>,
    manager: Weak<Shared>,
}

impl Lease {
    pub(crate) fn new(name: &str, manager: Weak<Shared>) -> Self {
        Self {
            name: name.to_string(),
            data: Bytes::copy_from_slice(name.as_bytes()),
            status: Mutex::new(LeaseStatus::Unknown),
            manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn status(&self) -> LeaseStatus {
        *self.status.lock().await
    }

    /// Whether this process holds the lease, acquiring or releasing the node
    /// as the cluster hash ring dictates.
    ///
    /// Never fails: transient faults and losing to another process both read
    /// as `false`, and the next check tries again. Only a fatal coordination
    /// error escapes, as a panic.
    pub async fn check_held(&self) -> bool {
        match self.try_check_held().await {
            Ok(held) => held,
            Err(e) if e.is_fatal() => {
                error!(lease = %self.name, error = %e, "fatal error checking if lease is held");
                panic!("fatal error checking lease {}: {e}", self.name);
            }
            Err(e) => {
                error!(lease = %self.name, error = %e, "unexpected error checking if lease is held");
                false
            }
        }
    }

    async fn try_check_held(&self) -> Result<bool> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(false);
        };
        if !manager.is_running() || !manager.is_connected() {
            return Ok(false);
        }

        let snapshot = manager.cluster().snapshot();
        let owner = snapshot.designated_owner(&self.name)?;
        if !snapshot.is_self(&owner) {
            debug!(lease = %self.name, owner = %owner, "lease belongs to another member");
            self.release_if_held(true).await;
            return Ok(false);
        }

        let client = manager.client();
        let mut status = self.status.lock().await;
        if *status == LeaseStatus::Held {
            return Ok(true);
        }

        // A disconnect may have reset our status while the node survived
        match self.node_owned(client).await? {
            Some(true) => {
                info!(lease = %self.name, "reclaiming currently held lease");
                *status = LeaseStatus::Held;
                Ok(true)
            }
            Some(false) => {
                self.held_by_another(&mut status);
                Ok(false)
            }
            None => self.try_acquire_node(client, &mut status).await,
        }
    }

    /// Forgets ownership until the node is verified again
    pub async fn connection_lost(&self) {
        *self.status.lock().await = LeaseStatus::Unknown;
    }

    /// Deletes the lease node if this process owns it.
    ///
    /// A guaranteed delete keeps being retried by the coordination client
    /// across reconnects; otherwise a single attempt is made.
    pub async fn release_if_held(&self, guaranteed: bool) {
        let mut status = self.status.lock().await;
        if *status == LeaseStatus::NotHeld {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };

        match self.delete_if_owned(manager.client(), guaranteed).await {
            Ok(released) => {
                if released {
                    info!(lease = %self.name, "released lease");
                }
                *status = LeaseStatus::NotHeld;
            }
            // Deleted underneath us, e.g. shutdown racing a handoff
            Err(e) if e.is_no_node() => *status = LeaseStatus::NotHeld,
            Err(e) if e.is_fatal() => {
                error!(lease = %self.name, error = %e, "fatal error releasing lease");
                panic!("fatal error releasing lease {}: {e}", self.name);
            }
            Err(e) => {
                *status = LeaseStatus::Unknown;
                warn!(
                    lease = %self.name,
                    error = %e,
                    "received unexpected error while releasing lease, status is {}",
                    LeaseStatus::Unknown
                );
            }
        }
    }

    async fn delete_if_owned(
        &self,
        client: &dyn CoordinationClient,
        guaranteed: bool,
    ) -> coord::Result<bool> {
        if self.node_owned(client).await? != Some(true) {
            return Ok(false);
        }

        if guaranteed {
            client.delete_guaranteed(&self.name).await?;
        } else {
            client.delete(&self.name).await?;
        }
        Ok(true)
    }

    async fn try_acquire_node(
        &self,
        client: &dyn CoordinationClient,
        status: &mut LeaseStatus,
    ) -> Result<bool> {
        match client
            .create_ephemeral(&self.name, &self.data, Acl::OpenUnsafe)
            .await
        {
            Ok(()) => {
                *status = LeaseStatus::Held;
                info!(lease = %self.name, "acquired lease");
                Ok(true)
            }
            // Lost the race between the existence check and the create
            Err(e) if e.is_node_exists() => {
                self.held_by_another(status);
                Ok(false)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                info!(lease = %self.name, error = %e, "got unexpected error trying to acquire node for lease");
                Ok(false)
            }
        }
    }

    /// Whether the lease node belongs to this process, or `None` if there is
    /// no node. Ours means our payload and, when the client tracks sessions,
    /// our session as ephemeral owner.
    async fn node_owned(&self, client: &dyn CoordinationClient) -> coord::Result<Option<bool>> {
        let Some(stat) = client.exists(&self.name).await? else {
            return Ok(None);
        };
        if let (Some(owner), Some(session)) = (stat.ephemeral_owner, client.current_session()) {
            if owner != session {
                return Ok(Some(false));
            }
        }

        match client.read(&self.name).await {
            Ok(data) => Ok(Some(data == self.data)),
            // Vanished since the existence check
            Err(e) if e.is_no_node() => Ok(Some(false)),
            Err(e) => Err(e),
        }
    }

    fn held_by_another(&self, status: &mut LeaseStatus) {
        if *status != LeaseStatus::NotHeld {
            *status = LeaseStatus::NotHeld;
            info!(
                lease = %self.name,
                "updating status for lease to {}; it is held by another process",
                LeaseStatus::NotHeld
            );
        } else {
            debug!(lease = %self.name, "lease is held by another process; skipping acquire");
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
