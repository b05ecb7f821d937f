// Cluster membership as seen from one process
//
// A snapshot pairs the local member with the ready member set and the hash
// ring built from it. Every process with the same member set computes the same
// designated owner for a resource.

pub mod fake;
pub mod hash_ring;

pub use fake::FakeCluster;
pub use hash_ring::{ClusterHashRing, ConsistentHashRing};

use crate::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A process taking part in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Member {
    pub name: String,
    pub ip_address: String,
}

impl Member {
    pub fn new(name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip_address: ip_address.into(),
        }
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.ip_address)
    }
}

/// Point-in-time view of the cluster
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub self_member: Member,
    pub ready_members: BTreeSet<Member>,
    pub hash_ring: Arc<dyn ClusterHashRing>,
}

impl ClusterSnapshot {
    /// Member responsible for `resource` under this snapshot
    pub fn designated_owner(&self, resource: &str) -> Result<Member> {
        self.hash_ring.map_resource_to_member(resource)
    }

    /// Members are identified by name across snapshots
    pub fn is_self(&self, member: &Member) -> bool {
        member.name == self.self_member.name
    }
}

/// Members that joined or left in one membership update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterChanges {
    pub added: BTreeSet<Member>,
    pub removed: BTreeSet<Member>,
}

impl ClusterChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Source of membership snapshots and change notifications
pub trait Cluster: Send + Sync + std::fmt::Debug {
    fn snapshot(&self) -> ClusterSnapshot;

    fn subscribe(&self) -> broadcast::Receiver<ClusterChanges>;
}
