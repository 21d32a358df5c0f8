//! Affinity function and key-mapper contracts.
//!
//! These traits describe *what* an affinity snapshot can compute; *how*
//! a snapshot is obtained (locally or from a remote node, with retries)
//! is the Affinity Resolver's job, implemented in the `gridstream` crate.

use std::fmt;
use std::sync::Arc;

use crate::ids::{NodeId, TopologyVersion};

/// Identifies a partition within a cache's partitioned key space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Wraps a raw partition number.
    pub fn new(partition: u32) -> Self {
        Self(partition)
    }

    /// Returns the raw partition number.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// A cache's partitioning and ownership function at some topology version.
///
/// Implementations are expected to be cheap to query repeatedly; the
/// resolver caches one instance per `cacheName` and shares it across
/// every caller mapping keys for that cache.
pub trait AffinityFunction: Send + Sync {
    /// Total number of partitions this cache is split into.
    fn partitions(&self) -> u32;

    /// Computes the partition owning `affinity_key`.
    fn partition(&self, affinity_key: &[u8]) -> PartitionId;

    /// Returns the ordered list of nodes hosting `partition` at
    /// `topology_version`; the first entry is the primary owner.
    ///
    /// Returns an empty vector if the partition currently has no owner
    /// (e.g. during a rebalance window).
    fn nodes(&self, partition: PartitionId, topology_version: TopologyVersion) -> Vec<NodeId>;

    /// Drops any cached partition→nodes state for topology versions
    /// older than `topology_version`. Called by the resolver on every
    /// topology change, regardless of which cache triggered it.
    fn clean_up(&self, topology_version: TopologyVersion);
}

/// Extracts the bytes used to compute a key's partition.
///
/// Distinct from the key type itself because a cache may define a custom
/// affinity key (e.g. co-locating rows that share a tenant id) that
/// differs from the cache key used for lookups.
pub trait AffinityKeyMapper<K>: Send + Sync {
    /// Returns the byte representation of `key`'s affinity key.
    fn affinity_key(&self, key: &K) -> Vec<u8>;
}

/// A resolved `(affinity function, key mapper)` pair for one cache at one
/// topology version, as produced by the Affinity Resolver.
pub struct AffinitySnapshot<K> {
    function: Arc<dyn AffinityFunction>,
    mapper: Arc<dyn AffinityKeyMapper<K>>,
    topology_version: TopologyVersion,
}

impl<K> Clone for AffinitySnapshot<K> {
    fn clone(&self) -> Self {
        Self {
            function: Arc::clone(&self.function),
            mapper: Arc::clone(&self.mapper),
            topology_version: self.topology_version,
        }
    }
}

impl<K> AffinitySnapshot<K> {
    /// Builds a snapshot from an already-resolved affinity function and mapper.
    pub fn new(
        function: Arc<dyn AffinityFunction>,
        mapper: Arc<dyn AffinityKeyMapper<K>>,
        topology_version: TopologyVersion,
    ) -> Self {
        Self {
            function,
            mapper,
            topology_version,
        }
    }

    /// Topology version this snapshot's partition→nodes table reflects.
    pub fn topology_version(&self) -> TopologyVersion {
        self.topology_version
    }

    /// Computes the partition owning `key`.
    pub fn partition(&self, key: &K) -> PartitionId {
        self.function.partition(&self.mapper.affinity_key(key))
    }

    /// Returns the primary owner of `key`, or `None` if the partition is
    /// currently unowned.
    pub fn owner(&self, key: &K) -> Option<NodeId> {
        let partition = self.partition(key);
        self.function
            .nodes(partition, self.topology_version)
            .into_iter()
            .next()
    }

    /// Forwards a cleanup request to the underlying affinity function.
    pub fn clean_up(&self, topology_version: TopologyVersion) {
        self.function.clean_up(topology_version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ModuloAffinity {
        partitions: u32,
        owners: Mutex<HashMap<u32, Vec<NodeId>>>,
    }

    impl AffinityFunction for ModuloAffinity {
        fn partitions(&self) -> u32 {
            self.partitions
        }

        fn partition(&self, affinity_key: &[u8]) -> PartitionId {
            let hash: u32 = affinity_key.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32));
            PartitionId::new(hash % self.partitions)
        }

        fn nodes(&self, partition: PartitionId, _topology_version: TopologyVersion) -> Vec<NodeId> {
            self.owners
                .lock()
                .unwrap()
                .get(&partition.as_raw())
                .cloned()
                .unwrap_or_default()
        }

        fn clean_up(&self, _topology_version: TopologyVersion) {}
    }

    struct IdentityMapper;

    impl AffinityKeyMapper<u8> for IdentityMapper {
        fn affinity_key(&self, key: &u8) -> Vec<u8> {
            vec![*key]
        }
    }

    #[test]
    fn owner_is_first_node_for_the_keys_partition() {
        let node = NodeId::random();
        let mut owners = HashMap::new();
        owners.insert(0u32, vec![node]);
        let function = ModuloAffinity {
            partitions: 1,
            owners: Mutex::new(owners),
        };
        let snapshot: AffinitySnapshot<u8> = AffinitySnapshot::new(
            Arc::new(function),
            Arc::new(IdentityMapper),
            TopologyVersion::INITIAL,
        );
        assert_eq!(snapshot.owner(&5), Some(node));
    }

    #[test]
    fn owner_is_none_for_unowned_partition() {
        let function = ModuloAffinity {
            partitions: 1,
            owners: Mutex::new(HashMap::new()),
        };
        let snapshot: AffinitySnapshot<u8> = AffinitySnapshot::new(
            Arc::new(function),
            Arc::new(IdentityMapper),
            TopologyVersion::INITIAL,
        );
        assert_eq!(snapshot.owner(&5), None);
    }
}
