// In-process cluster whose membership is driven by the caller
//
// Several processes can share one membership through `view_as`, each seeing
// itself as a different member. Explicit resource owners take precedence over
// the hash ring, which lets tests pin a resource to a chosen member.

use super::{
    hash_ring::{ClusterHashRing, ConsistentHashRing, DEFAULT_VNODES},
    Cluster, ClusterChanges, ClusterSnapshot, Member,
};
use crate::Result;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CAPACITY: usize = 64;

#[derive(Debug)]
struct ExplicitResourceRing {
    overrides: HashMap<String, Member>,
    ring: ConsistentHashRing,
}

impl ClusterHashRing for ExplicitResourceRing {
    fn map_resource_to_member(&self, resource: &str) -> Result<Member> {
        match self.overrides.get(resource) {
            Some(owner) => Ok(owner.clone()),
            None => self.ring.map_resource_to_member(resource),
        }
    }
}

#[derive(Debug)]
struct Membership {
    members: BTreeSet<Member>,
    overrides: HashMap<String, Member>,
    hash_ring: Arc<dyn ClusterHashRing>,
}

#[derive(Debug)]
struct Shared {
    membership: RwLock<Membership>,
    changes: broadcast::Sender<ClusterChanges>,
    vnodes: usize,
}

impl Shared {
    fn rebuild(&self, membership: &mut Membership) {
        membership.hash_ring = Arc::new(ExplicitResourceRing {
            overrides: membership.overrides.clone(),
            ring: ConsistentHashRing::with_vnodes(membership.members.iter().cloned(), self.vnodes),
        });
    }
}

#[derive(Debug, Clone)]
pub struct FakeCluster {
    self_member: Member,
    shared: Arc<Shared>,
}

impl FakeCluster {
    /// A cluster that initially contains only `self_member`
    pub fn new(self_member: Member) -> Self {
        Self::with_vnodes(self_member, DEFAULT_VNODES)
    }

    pub fn with_vnodes(self_member: Member, vnodes: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let members: BTreeSet<Member> = [self_member.clone()].into_iter().collect();
        let hash_ring = Arc::new(ConsistentHashRing::with_vnodes(members.iter().cloned(), vnodes));

        Self {
            self_member,
            shared: Arc::new(Shared {
                membership: RwLock::new(Membership {
                    members,
                    overrides: HashMap::new(),
                    hash_ring,
                }),
                changes,
                vnodes,
            }),
        }
    }

    /// Same membership, seen from `member`. Does not add `member` to the cluster.
    pub fn view_as(&self, member: Member) -> Self {
        Self {
            self_member: member,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn self_member(&self) -> &Member {
        &self.self_member
    }

    pub fn members(&self) -> BTreeSet<Member> {
        self.shared.membership.read().members.clone()
    }

    pub fn add_members(&self, members: impl IntoIterator<Item = Member>) {
        self.update(|membership| {
            let mut changes = ClusterChanges::default();
            for member in members {
                if membership.members.insert(member.clone()) {
                    changes.added.insert(member);
                }
            }
            changes
        });
    }

    pub fn remove_members(&self, members: impl IntoIterator<Item = Member>) {
        self.update(|membership| {
            let mut changes = ClusterChanges::default();
            for member in members {
                if membership.members.remove(&member) {
                    changes.removed.insert(member);
                }
            }
            changes
        });
    }

    pub fn clear_members(&self) {
        self.update(|membership| ClusterChanges {
            added: BTreeSet::new(),
            removed: std::mem::take(&mut membership.members),
        });
    }

    /// Pins `resource` to `owner` regardless of the hash ring
    pub fn set_resource_owner(&self, resource: &str, owner: Member) {
        self.update(|membership| {
            membership.overrides.insert(resource.to_string(), owner);
            ClusterChanges::default()
        });
    }

    pub fn clear_resource_owner(&self, resource: &str) {
        self.update(|membership| {
            membership.overrides.remove(resource);
            ClusterChanges::default()
        });
    }

    fn update(&self, apply: impl FnOnce(&mut Membership) -> ClusterChanges) {
        let changes = {
            let mut membership = self.shared.membership.write();
            let changes = apply(&mut membership);
            self.shared.rebuild(&mut membership);
            changes
        };

        debug!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            "cluster membership changed"
        );
        // No subscribers yet is fine
        let _ = self.shared.changes.send(changes);
    }
}

impl Cluster for FakeCluster {
    fn snapshot(&self) -> ClusterSnapshot {
        let membership = self.shared.membership.read();
        ClusterSnapshot {
            self_member: self.self_member.clone(),
            ready_members: membership.members.clone(),
            hash_ring: Arc::clone(&membership.hash_ring),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterChanges> {
        self.shared.changes.subscribe()
    }
}
