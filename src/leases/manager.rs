// Lease manager: owns this process's leases and reacts to connection and
// cluster membership events

use super::{Lease, Lifecycle};
use crate::cluster::{Cluster, ClusterChanges};
use crate::config::LeaseManagerConfig;
use crate::pool::WorkerPool;
use crate::Result;
use coord::{app_namespace, ConnectionState, CoordinationClient, NamespacedClient};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const POOL_NAME: &str = "lease-monitor";

#[derive(Debug, Default)]
struct ManagerState {
    lifecycle: Lifecycle,
    connected: bool,
    leases: HashMap<String, Arc<Lease>>,
    pool: Option<WorkerPool>,
    watchers: Vec<JoinHandle<()>>,
}

/// State shared between the manager handle, its leases and its watcher tasks.
///
/// Leases and watchers only keep a `Weak` to it.
pub(crate) struct Shared {
    config: LeaseManagerConfig,
    client: Arc<dyn CoordinationClient>,
    cluster: Arc<dyn Cluster>,
    // Never held across an await
    state: Mutex<ManagerState>,
}

impl Shared {
    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Running && self.client.is_running()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub(crate) fn client(&self) -> &dyn CoordinationClient {
        self.client.as_ref()
    }

    pub(crate) fn cluster(&self) -> &dyn Cluster {
        self.cluster.as_ref()
    }

    async fn connection_state_changed(&self, new_state: ConnectionState) {
        let lost: Vec<Arc<Lease>> = {
            let mut state = self.state.lock();
            state.connected = new_state.is_connected();
            if state.connected {
                Vec::new()
            } else {
                state.leases.values().cloned().collect()
            }
        };

        info!(app = %self.config.app_name, state = %new_state, "coordination connection state changed");
        for lease in lost {
            lease.connection_lost().await;
        }
    }

    fn cluster_changed(&self) {
        let state = self.state.lock();
        let Some(pool) = state.pool.as_ref() else {
            return;
        };

        for lease in state.leases.values() {
            let lease = Arc::clone(lease);
            pool.submit(async move {
                lease.check_held().await;
            });
        }
    }
}

/// Hands out [`Lease`]s for one application and keeps them consistent with
/// the coordination session and the cluster membership.
///
/// Lease nodes are created under `/services/<app_name>/`. The manager must be
/// started inside a tokio runtime before its leases report as held, and can
/// be started and stopped once each.
pub struct LeaseManager {
    shared: Arc<Shared>,
}

impl LeaseManager {
    pub fn new(
        config: LeaseManagerConfig,
        client: Arc<dyn CoordinationClient>,
        cluster: Arc<dyn Cluster>,
    ) -> Result<Self> {
        config.validate()?;
        let client: Arc<dyn CoordinationClient> =
            Arc::new(NamespacedClient::new(client, app_namespace(&config.app_name)));

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                client,
                cluster,
                state: Mutex::new(ManagerState::default()),
            }),
        })
    }

    /// Begins watching the connection and the cluster.
    ///
    /// Panics unless the manager has never been started.
    pub fn start(&self) {
        // Subscribe before reading the current state so no transition is missed
        let connection_events = self.shared.client.subscribe();
        let cluster_changes = self.shared.cluster.subscribe();

        let mut state = self.shared.state.lock();
        assert!(
            state.lifecycle == Lifecycle::NotStarted,
            "attempting to start lease manager in {} state",
            state.lifecycle
        );

        state.lifecycle = Lifecycle::Running;
        state.connected = self.shared.client.connection_state().is_connected();
        state.pool = Some(WorkerPool::new(POOL_NAME, self.shared.config.workers));

        let manager = Arc::downgrade(&self.shared);
        state.watchers.push(tokio::spawn(watch_connection(
            manager.clone(),
            connection_events,
        )));
        state
            .watchers
            .push(tokio::spawn(watch_cluster(manager, cluster_changes)));

        info!(
            app = %self.shared.config.app_name,
            connected = state.connected,
            "lease manager started"
        );
    }

    /// Releases every held lease and waits up to the configured grace period
    /// for the releases to finish.
    ///
    /// Panics unless the manager is running.
    pub async fn stop(&self) {
        let (pool, watchers) = {
            let mut state = self.shared.state.lock();
            assert!(
                state.lifecycle == Lifecycle::Running,
                "attempting to stop lease manager in {} state",
                state.lifecycle
            );
            state.lifecycle = Lifecycle::Stopped;

            let pool = state.pool.take();
            if let Some(pool) = pool.as_ref() {
                for lease in state.leases.values() {
                    let lease = Arc::clone(lease);
                    pool.submit(async move { lease.release_if_held(false).await });
                }
            }
            (pool, std::mem::take(&mut state.watchers))
        };

        for watcher in watchers {
            watcher.abort();
        }

        info!(app = %self.shared.config.app_name, "stopping lease manager");
        if let Some(pool) = pool {
            let grace = self.shared.config.shutdown_grace();
            if !pool.shutdown(grace).await {
                warn!(
                    app = %self.shared.config.app_name,
                    ?grace,
                    "gave up waiting for leases to release; their nodes go away when the session expires"
                );
            }
        }
    }

    /// Returns the lease for `name`, creating the handle on first use.
    ///
    /// The handle does not touch the coordination service until
    /// [`Lease::check_held`] is called. `_ttl` is accepted for interface
    /// compatibility; lease lifetime is bounded by the session instead.
    ///
    /// Panics once the manager has been stopped.
    pub fn try_acquire_lease(&self, name: &str, _ttl: Duration) -> Arc<Lease> {
        let mut state = self.shared.state.lock();
        assert!(
            state.lifecycle != Lifecycle::Stopped,
            "attempting to acquire lease {name} from a stopped lease manager"
        );

        let manager = Arc::downgrade(&self.shared);
        Arc::clone(state.leases.entry(name.to_string()).or_insert_with(|| {
            debug!(lease = name, "creating lease handle");
            Arc::new(Lease::new(name, manager))
        }))
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.state.lock().lifecycle
    }

    pub fn config(&self) -> &LeaseManagerConfig {
        &self.shared.config
    }

    pub fn lease_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.state.lock().leases.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        for watcher in self.shared.state.lock().watchers.drain(..) {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("app_name", &self.shared.config.app_name)
            .field("lifecycle", &self.lifecycle())
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn watch_connection(
    manager: Weak<Shared>,
    mut events: broadcast::Receiver<ConnectionState>,
) {
    loop {
        let event = events.recv().await;
        let Some(shared) = manager.upgrade() else {
            break;
        };

        let new_state = match event {
            Ok(new_state) => new_state,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed connection state events, resyncing");
                shared.client.connection_state()
            }
            Err(RecvError::Closed) => break,
        };
        shared.connection_state_changed(new_state).await;
    }
}

async fn watch_cluster(manager: Weak<Shared>, mut changes: broadcast::Receiver<ClusterChanges>) {
    loop {
        match changes.recv().await {
            Ok(changes) => debug!(
                added = changes.added.len(),
                removed = changes.removed.len(),
                "cluster membership changed, re-checking leases"
            ),
            // Every change triggers the same full re-check
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "coalescing missed cluster changes"),
            Err(RecvError::Closed) => break,
        }

        let Some(shared) = manager.upgrade() else {
            break;
        };
        shared.cluster_changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FakeCluster, Member};
    use crate::leases::LeaseStatus;
    use crate::test_utils::{create_test_fleet, wait_for_status};
    use coord::{Fault, InMemoryCoordinator, Operation};

    const TTL: Duration = Duration::from_secs(30);

    fn unstarted_manager() -> (Arc<coord::InMemoryClient>, LeaseManager) {
        let coordinator = InMemoryCoordinator::new();
        let client = coordinator.connect(Default::default());
        let cluster = FakeCluster::new(Member::new("a", "10.0.0.1"));
        let manager = LeaseManager::new(
            LeaseManagerConfig::new("test-app"),
            client.clone(),
            Arc::new(cluster),
        )
        .unwrap();
        (client, manager)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let coordinator = InMemoryCoordinator::new();
        let cluster = FakeCluster::new(Member::new("a", "10.0.0.1"));
        let result = LeaseManager::new(
            LeaseManagerConfig::new("app").with_workers(0),
            coordinator.connect(Default::default()),
            Arc::new(cluster),
        );
        tokio_test::assert_err!(result);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (_client, manager) = unstarted_manager();
        assert_eq!(manager.lifecycle(), Lifecycle::NotStarted);
        assert!(!manager.is_running());

        manager.start();
        assert_eq!(manager.lifecycle(), Lifecycle::Running);
        assert!(manager.is_running());
        assert!(manager.is_connected());

        manager.stop().await;
        assert_eq!(manager.lifecycle(), Lifecycle::Stopped);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    #[should_panic(expected = "attempting to start lease manager in RUNNING state")]
    async fn test_start_twice_panics() {
        let (_client, manager) = unstarted_manager();
        manager.start();
        manager.start();
    }

    #[tokio::test]
    #[should_panic(expected = "attempting to stop lease manager in NOT_STARTED state")]
    async fn test_stop_before_start_panics() {
        let (_client, manager) = unstarted_manager();
        manager.stop().await;
    }

    #[tokio::test]
    #[should_panic(expected = "attempting to start lease manager in STOPPED state")]
    async fn test_restart_panics() {
        let (_client, manager) = unstarted_manager();
        manager.start();
        manager.stop().await;
        manager.start();
    }

    #[tokio::test]
    #[should_panic(expected = "from a stopped lease manager")]
    async fn test_acquire_after_stop_panics() {
        let (_client, manager) = unstarted_manager();
        manager.start();
        manager.stop().await;
        manager.try_acquire_lease("lease-a", TTL);
    }

    #[tokio::test]
    async fn test_same_name_same_handle() {
        let (client, manager) = unstarted_manager();
        let first = manager.try_acquire_lease("lease-a", TTL);
        let second = manager.try_acquire_lease("lease-a", Duration::from_secs(1));
        let other = manager.try_acquire_lease("lease-b", TTL);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(manager.lease_names(), vec!["lease-a", "lease-b"]);
        assert_eq!(client.op_count(), 0);
    }

    #[tokio::test]
    async fn test_not_started_leases_are_not_held() {
        let (client, manager) = unstarted_manager();
        let lease = manager.try_acquire_lease("lease-a", TTL);

        assert!(!lease.check_held().await);
        assert_eq!(lease.status().await, LeaseStatus::Unknown);
        assert_eq!(client.op_count(), 0);
    }

    #[tokio::test]
    async fn test_start_seeds_disconnected_state() {
        let (client, manager) = unstarted_manager();
        client.suspend();
        manager.start();
        assert!(!manager.is_connected());

        let lease = manager.try_acquire_lease("lease-a", TTL);
        assert!(!lease.check_held().await);
        assert_eq!(client.op_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_resets_status() {
        let fleet = create_test_fleet(&["a"], LeaseManagerConfig::new("test-app")).unwrap();
        let process = fleet.process("a");
        let lease = process.manager.try_acquire_lease("lease-a", TTL);
        assert!(lease.check_held().await);

        process.client.suspend();
        wait_for_status(&lease, LeaseStatus::Unknown).await;
        assert!(!process.manager.is_connected());

        let ops = process.client.op_count();
        assert!(!lease.check_held().await);
        assert_eq!(process.client.op_count(), ops);
    }

    #[tokio::test]
    async fn test_stop_releases_held_leases() {
        let fleet = create_test_fleet(&["a"], LeaseManagerConfig::new("test-app")).unwrap();
        let process = fleet.process("a");
        let held = process.manager.try_acquire_lease("lease-a", TTL);
        let unchecked = process.manager.try_acquire_lease("lease-b", TTL);
        assert!(held.check_held().await);

        process.manager.stop().await;

        assert_eq!(held.status().await, LeaseStatus::NotHeld);
        assert_eq!(unchecked.status().await, LeaseStatus::NotHeld);
        assert!(fleet.coordinator.paths().is_empty());
        assert!(!held.check_held().await);
    }

    #[tokio::test]
    async fn test_background_recheck_survives_fatal_error() {
        let config = LeaseManagerConfig::new("test-app").with_workers(1);
        let fleet = create_test_fleet(&["a"], config).unwrap();
        let process = fleet.process("a");
        let lease = process.manager.try_acquire_lease("lease-a", TTL);

        process
            .client
            .fail_next(Operation::Exists, Fault::Fatal("out of memory".into()));
        process
            .cluster
            .set_resource_owner("lease-a", process.member.clone());

        // The re-check on the only worker hits the fault and panics
        tokio::time::timeout(Duration::from_secs(5), async {
            while process.client.op_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(lease.status().await, LeaseStatus::Unknown);

        // The same worker still runs the next re-check
        process
            .cluster
            .set_resource_owner("lease-a", process.member.clone());
        wait_for_status(&lease, LeaseStatus::Held).await;

        process.manager.stop().await;
        assert_eq!(lease.status().await, LeaseStatus::NotHeld);
        assert!(fleet.coordinator.paths().is_empty());
    }
}
