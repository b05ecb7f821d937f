use crate::{
    cluster::{FakeCluster, Member},
    leases::{Lease, LeaseManager, LeaseStatus},
    LeaseManagerConfig, Result,
};
use coord::{app_namespace, CoordinationConfig, InMemoryClient, InMemoryCoordinator};
use std::{sync::Arc, time::Duration};

/// How long [`wait_for_status`] polls before giving up
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One process of a simulated deployment: its own coordination session,
/// its own view of the shared cluster and its own lease manager
#[derive(Debug)]
pub struct SimulatedProcess {
    pub member: Member,
    pub client: Arc<InMemoryClient>,
    pub cluster: FakeCluster,
    pub manager: LeaseManager,
}

impl SimulatedProcess {
    pub fn name(&self) -> &str {
        &self.member.name
    }
}

/// Processes sharing one coordination service and one membership
#[derive(Debug)]
pub struct TestFleet {
    pub coordinator: InMemoryCoordinator,
    pub cluster: FakeCluster,
    pub config: LeaseManagerConfig,
    pub processes: Vec<SimulatedProcess>,
}

impl TestFleet {
    pub fn process(&self, name: &str) -> &SimulatedProcess {
        self.processes
            .iter()
            .find(|process| process.name() == name)
            .unwrap_or_else(|| panic!("no process named {name}"))
    }

    /// Absolute path of the node backing `lease`
    pub fn lease_path(&self, lease: &str) -> String {
        format!("/{}/{}", app_namespace(&self.config.app_name), lease)
    }

    /// Runs `check_held` for `lease` on every process and returns the names
    /// of those that report holding it
    pub async fn holders(&self, lease: &str, ttl: Duration) -> Vec<String> {
        let mut holders = Vec::new();
        for process in &self.processes {
            if process.manager.try_acquire_lease(lease, ttl).check_held().await {
                holders.push(process.name().to_string());
            }
        }
        holders
    }

    /// Name of the member the hash ring designates for `lease`
    pub fn designated_owner(&self, lease: &str) -> Result<String> {
        use crate::cluster::Cluster;
        Ok(self.cluster.snapshot().designated_owner(lease)?.name)
    }

    pub async fn stop_all(&self) {
        for process in &self.processes {
            process.manager.stop().await;
        }
    }
}

/// Builds and starts one process per name, all members of the same cluster.
///
/// Must be called from inside a tokio runtime.
pub fn create_test_fleet(names: &[&str], config: LeaseManagerConfig) -> Result<TestFleet> {
    create_test_fleet_with(names, config, CoordinationConfig::default())
}

pub fn create_test_fleet_with(
    names: &[&str],
    config: LeaseManagerConfig,
    coordination: CoordinationConfig,
) -> Result<TestFleet> {
    let members: Vec<Member> = names
        .iter()
        .enumerate()
        .map(|(i, name)| Member::new(*name, format!("10.0.0.{}", i + 1)))
        .collect();
    let Some(first) = members.first() else {
        return Err(crate::Error::Config("a fleet needs at least one process".to_string()));
    };

    let coordinator = InMemoryCoordinator::new();
    let cluster = FakeCluster::new(first.clone());
    cluster.add_members(members.iter().skip(1).cloned());

    let mut processes = Vec::with_capacity(members.len());
    for member in members {
        let client = coordinator.connect(coordination.clone());
        let view = cluster.view_as(member.clone());
        let manager = LeaseManager::new(config.clone(), client.clone(), Arc::new(view.clone()))?;
        manager.start();
        processes.push(SimulatedProcess {
            member,
            client,
            cluster: view,
            manager,
        });
    }

    Ok(TestFleet {
        coordinator,
        cluster,
        config,
        processes,
    })
}

/// Polls until `lease` reaches `expected`, panicking after [`WAIT_TIMEOUT`]
pub async fn wait_for_status(lease: &Lease, expected: LeaseStatus) {
    let reached = tokio::time::timeout(WAIT_TIMEOUT, async {
        while lease.status().await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    if reached.is_err() {
        panic!(
            "lease {} did not reach {expected} within {WAIT_TIMEOUT:?}",
            lease.name()
        );
    }
}
