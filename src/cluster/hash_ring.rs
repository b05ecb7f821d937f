// Consistent hash ring used to pick the designated owner of a resource

use super::Member;
use crate::{Error, Result};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Virtual nodes placed on the ring per member
pub const DEFAULT_VNODES: usize = 16;

/// Maps resource names onto cluster members
pub trait ClusterHashRing: Send + Sync + std::fmt::Debug {
    fn map_resource_to_member(&self, resource: &str) -> Result<Member>;
}

/// Ring of blake3-hashed virtual nodes.
///
/// A resource belongs to the first virtual node at or after its own hash,
/// wrapping around at the top of the ring. The layout depends only on the
/// member set, never on insertion order.
#[derive(Debug, Clone, Default)]
pub struct ConsistentHashRing {
    ring: BTreeMap<u64, Member>,
}

impl ConsistentHashRing {
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        Self::with_vnodes(members, DEFAULT_VNODES)
    }

    pub fn with_vnodes(members: impl IntoIterator<Item = Member>, vnodes: usize) -> Self {
        let mut ring = BTreeMap::new();

        for member in members {
            for vnode in 0..vnodes.max(1) {
                let point = hash(format!("{}#{}", member.name, vnode).as_bytes());
                match ring.entry(point) {
                    Entry::Vacant(slot) => {
                        slot.insert(member.clone());
                    }
                    // Collisions go to the smaller member so the ring stays order-independent
                    Entry::Occupied(mut slot) => {
                        if member < *slot.get() {
                            slot.insert(member.clone());
                        }
                    }
                }
            }
        }

        Self { ring }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn members(&self) -> BTreeSet<Member> {
        self.ring.values().cloned().collect()
    }
}

impl ClusterHashRing for ConsistentHashRing {
    fn map_resource_to_member(&self, resource: &str) -> Result<Member> {
        let point = hash(resource.as_bytes());

        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, member)| member.clone())
            .ok_or_else(|| Error::EmptyRing {
                resource: resource.to_string(),
            })
    }
}

fn hash(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}
