use coord::CoordinationConfig;
use leasehold::{
    test_utils::{create_test_fleet, create_test_fleet_with, wait_for_status, TestFleet, WAIT_TIMEOUT},
    Cluster, LeaseManagerConfig, LeaseStatus,
};
use std::time::Duration;

const TTL: Duration = Duration::from_secs(30);

fn config() -> LeaseManagerConfig {
    LeaseManagerConfig::new("lease-protocol")
}

fn lease_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("lease-{i}")).collect()
}

/// Checks every lease on every process until each check round agrees, and
/// returns the final holders per lease
async fn settle(fleet: &TestFleet, leases: &[String]) -> Vec<Vec<String>> {
    let mut previous = Vec::new();
    for _ in 0..5 {
        let mut holders = Vec::with_capacity(leases.len());
        for lease in leases {
            holders.push(fleet.holders(lease, TTL).await);
        }
        if holders == previous {
            return holders;
        }
        previous = holders;
    }
    previous
}

#[tokio::test]
async fn test_single_ownership_under_stable_topology() {
    let fleet = create_test_fleet(&["a", "b", "c"], config()).unwrap();
    let leases = lease_names(20);

    for lease in &leases {
        let holders = fleet.holders(lease, TTL).await;
        assert_eq!(holders, vec![fleet.designated_owner(lease).unwrap()], "{lease}");
    }

    // Checks by non-owners must not disturb the holder's node
    for lease in &leases {
        let owner = fleet.process(&fleet.designated_owner(lease).unwrap());
        assert_eq!(
            fleet.coordinator.node_owner(&fleet.lease_path(lease)),
            Some(owner.client.session_id()),
            "{lease}"
        );
        assert_eq!(fleet.holders(lease, TTL).await, vec![owner.name().to_string()]);
    }
    assert_eq!(fleet.coordinator.paths().len(), leases.len());

    fleet.stop_all().await;
}

#[tokio::test]
async fn test_ring_spreads_leases_across_members() {
    let fleet = create_test_fleet(&["a", "b", "c"], config()).unwrap();
    let leases = lease_names(60);

    let holders = settle(&fleet, &leases).await;
    for name in ["a", "b", "c"] {
        assert!(
            holders.iter().any(|h| h == &vec![name.to_string()]),
            "{name} holds nothing"
        );
    }

    fleet.stop_all().await;
}

#[tokio::test]
async fn test_handoff_on_explicit_reassignment() {
    let fleet = create_test_fleet(&["a", "b"], config()).unwrap();
    let a = fleet.process("a");
    let b = fleet.process("b");
    fleet.cluster.set_resource_owner("lease-x", a.member.clone());

    assert_eq!(fleet.holders("lease-x", TTL).await, vec!["a"]);

    fleet.cluster.set_resource_owner("lease-x", b.member.clone());

    // The old owner releases on its next check, then the new one acquires
    let lease_a = a.manager.try_acquire_lease("lease-x", TTL);
    let lease_b = b.manager.try_acquire_lease("lease-x", TTL);
    assert!(!lease_a.check_held().await);
    assert_eq!(lease_a.status().await, LeaseStatus::NotHeld);
    assert!(lease_b.check_held().await);

    assert_eq!(
        fleet.coordinator.node_owner(&fleet.lease_path("lease-x")),
        Some(b.client.session_id())
    );
    assert_eq!(fleet.holders("lease-x", TTL).await, vec!["b"]);

    fleet.stop_all().await;
}

#[tokio::test]
async fn test_membership_change_moves_ownership_in_background() {
    let fleet = create_test_fleet(&["a", "b"], config()).unwrap();
    let a = fleet.process("a");
    let b = fleet.process("b");
    fleet.cluster.set_resource_owner("lease-x", a.member.clone());
    assert_eq!(fleet.holders("lease-x", TTL).await, vec!["a"]);

    // Only change notifications drive the handoff from here. The new owner may
    // re-check before the old one released, so keep publishing the change the
    // way repeated membership updates would.
    let path = fleet.lease_path("lease-x");
    let moved = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            fleet.cluster.set_resource_owner("lease-x", b.member.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
            if fleet.coordinator.node_owner(&path) == Some(b.client.session_id()) {
                break;
            }
        }
    })
    .await;
    assert!(moved.is_ok(), "lease never moved to b");

    let lease_b = b.manager.try_acquire_lease("lease-x", TTL);
    wait_for_status(&lease_b, LeaseStatus::Held).await;
    assert_eq!(fleet.holders("lease-x", TTL).await, vec!["b"]);

    fleet.stop_all().await;
}

#[tokio::test]
async fn test_departed_member_hands_over_everything() {
    let fleet = create_test_fleet(&["a", "b"], config()).unwrap();
    let leases = lease_names(10);
    settle(&fleet, &leases).await;

    let b = fleet.process("b");
    fleet.cluster.remove_members([b.member.clone()]);

    let holders = settle(&fleet, &leases).await;
    for (lease, holders) in leases.iter().zip(holders) {
        assert_eq!(holders, vec!["a"], "{lease}");
    }
    assert!(fleet
        .coordinator
        .paths()
        .iter()
        .all(|path| fleet.coordinator.node_owner(path) == Some(fleet.process("a").client.session_id())));

    fleet.stop_all().await;
}

#[tokio::test]
async fn test_empty_membership_holds_nothing() {
    let fleet = create_test_fleet(&["a"], config()).unwrap();
    let lease = fleet.process("a").manager.try_acquire_lease("lease-a", TTL);
    fleet.cluster.clear_members();

    assert!(fleet.cluster.snapshot().ready_members.is_empty());
    assert!(!lease.check_held().await);
    assert!(fleet.coordinator.paths().is_empty());

    fleet.stop_all().await;
}

#[tokio::test]
async fn test_reclaims_after_disconnect() {
    let fleet = create_test_fleet(&["a"], config()).unwrap();
    let process = fleet.process("a");
    let lease = process.manager.try_acquire_lease("lease-a", TTL);
    assert!(lease.check_held().await);
    let session = process.client.session_id();

    process.client.suspend();
    wait_for_status(&lease, LeaseStatus::Unknown).await;
    assert!(!lease.check_held().await);

    process.client.reconnect();
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !process.manager.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(lease.check_held().await);
    assert_eq!(lease.status().await, LeaseStatus::Held);
    assert_eq!(process.client.session_id(), session);
    assert_eq!(
        fleet.coordinator.node_owner(&fleet.lease_path("lease-a")),
        Some(session)
    );

    fleet.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_reacquires_after_session_expiry() {
    let coordination = CoordinationConfig::default().with_session_timeout(Duration::from_secs(1));
    let fleet = create_test_fleet_with(&["a"], config(), coordination).unwrap();
    let process = fleet.process("a");
    let lease = process.manager.try_acquire_lease("lease-a", TTL);
    assert!(lease.check_held().await);
    let old_session = process.client.session_id();

    process.client.suspend();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(fleet.coordinator.paths().is_empty());
    assert_eq!(lease.status().await, LeaseStatus::Unknown);

    process.client.reconnect();
    while !process.manager.is_connected() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(lease.check_held().await);
    assert_ne!(process.client.session_id(), old_session);
    assert_eq!(
        fleet.coordinator.node_owner(&fleet.lease_path("lease-a")),
        Some(process.client.session_id())
    );

    fleet.stop_all().await;
}

#[tokio::test]
async fn test_stop_releases_every_held_lease() {
    let fleet = create_test_fleet(&["a"], config()).unwrap();
    let process = fleet.process("a");
    let leases: Vec<_> = lease_names(3)
        .iter()
        .map(|name| process.manager.try_acquire_lease(name, TTL))
        .collect();
    for lease in &leases {
        assert!(lease.check_held().await);
    }
    assert_eq!(fleet.coordinator.paths().len(), 3);

    process.manager.stop().await;

    assert!(fleet.coordinator.paths().is_empty());
    for lease in &leases {
        assert_eq!(lease.status().await, LeaseStatus::NotHeld);
        assert!(!lease.check_held().await);
    }
}

#[tokio::test]
async fn test_stopped_process_frees_leases_for_others() {
    let fleet = create_test_fleet(&["a", "b"], config()).unwrap();
    let a = fleet.process("a");
    let b = fleet.process("b");
    fleet.cluster.set_resource_owner("lease-x", a.member.clone());
    assert_eq!(fleet.holders("lease-x", TTL).await, vec!["a"]);

    a.manager.stop().await;
    fleet.cluster.remove_members([a.member.clone()]);
    fleet.cluster.clear_resource_owner("lease-x");

    let lease_b = b.manager.try_acquire_lease("lease-x", TTL);
    assert!(lease_b.check_held().await);

    b.manager.stop().await;
}

#[tokio::test]
#[should_panic(expected = "from a stopped lease manager")]
async fn test_acquire_after_stop_panics() {
    let fleet = create_test_fleet(&["a"], config()).unwrap();
    fleet.stop_all().await;
    fleet.process("a").manager.try_acquire_lease("lease-a", TTL);
}
