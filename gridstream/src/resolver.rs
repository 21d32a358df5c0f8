//! The Affinity Resolver: caches one affinity snapshot per cache name,
//! resolving it locally or from a remote node on first use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as DashEntry;
use gridstream_backend::Discovery;
use gridstream_core::{AffinityFunction, AffinityKeyMapper, AffinitySnapshot, CacheName, NodeId, TopologyVersion};
use gridstream_core::completion::{self, Completion};
use tracing::{debug, warn};

use crate::error::ResolverError;

/// Number of remote resolution attempts before giving up. The source
/// does not distinguish temporary from permanent remote failures;
/// every error below this count is retried, preserved as-is.
pub const ERROR_RETRIES: u32 = 3;

/// Delay between remote resolution attempts.
pub const ERROR_WAIT: Duration = Duration::from_millis(200);

/// Delay before a departed node's resolver cache entries are dropped —
/// avoids thrash when multiple topology events arrive in a burst and
/// when a node briefly disappears.
pub const CLEANUP_DELAY: Duration = Duration::from_secs(3);

/// Supplies the affinity function and key mapper an [`AffinityResolver`]
/// needs, either from local configuration or from a remote node.
///
/// The loader's correctness depends on this contract, but how a
/// snapshot is actually produced (reading local cache config, or
/// issuing an RPC) is left to the implementation.
#[async_trait]
pub trait AffinityProvider<K>: Send + Sync {
    /// `true` if the local node hosts `cache_name` (the fast, no-RPC path).
    fn hosts_locally(&self, cache_name: &CacheName) -> bool;

    /// `true` if `cache_name` is configured in a purely local (single
    /// owner, no distribution) mode, which cannot be resolved remotely.
    fn is_local_only_mode(&self, cache_name: &CacheName) -> bool;

    /// Builds the snapshot parts from local configuration. Only called
    /// when [`hosts_locally`](Self::hosts_locally) is `true`.
    fn local_snapshot(
        &self,
        cache_name: &CacheName,
    ) -> Result<(Arc<dyn AffinityFunction>, Arc<dyn AffinityKeyMapper<K>>), ResolverError>;

    /// Picks a node currently believed to host `cache_name`, for a
    /// remote resolution request. `None` if no such node is known.
    fn node_hosting(&self, cache_name: &CacheName) -> Option<NodeId>;

    /// Requests the affinity function and key mapper from `node`.
    async fn remote_snapshot(
        &self,
        cache_name: &CacheName,
        node: NodeId,
    ) -> Result<(Arc<dyn AffinityFunction>, Arc<dyn AffinityKeyMapper<K>>), ResolverError>;
}

type SnapshotResult<K> = Result<AffinitySnapshot<K>, ResolverError>;

/// Caches affinity snapshots per cache name, resolving lazily and
/// invalidating on topology change.
///
/// Generic in `K`: one resolver instance serves every cache name whose
/// keys share type `K`. A data grid with multiple key types in practice
/// runs one resolver per key type (see `DESIGN.md`).
pub struct AffinityResolver<K> {
    discovery: Arc<dyn Discovery>,
    provider: Arc<dyn AffinityProvider<K>>,
    snapshots: DashMap<CacheName, Completion<SnapshotResult<K>>>,
    /// Tracks which node served each cached snapshot, so a departure
    /// cleanup only evicts entries that node actually served.
    resolved_from: DashMap<CacheName, NodeId>,
}

impl<K> AffinityResolver<K>
where
    K: Clone + Send + Sync + 'static,
{
    /// Builds a resolver over `provider`, scoped to `discovery`'s view
    /// of the cluster.
    pub fn new(discovery: Arc<dyn Discovery>, provider: Arc<dyn AffinityProvider<K>>) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            provider,
            snapshots: DashMap::new(),
            resolved_from: DashMap::new(),
        })
    }

    /// `mapKey`: resolves the node owning `key` in `cache_name`.
    pub async fn map_key(&self, cache_name: &CacheName, key: &K) -> Result<NodeId, ResolverError> {
        let snapshot = self.resolve(cache_name).await?;
        snapshot
            .owner(key)
            .ok_or_else(|| ResolverError::NoCacheNode(cache_name.clone()))
    }

    /// `mapKeys`: groups `keys` by owning node. Preserves no ordering
    /// guarantee beyond the grouping itself.
    pub async fn map_keys(
        &self,
        cache_name: &CacheName,
        keys: Vec<K>,
    ) -> Result<std::collections::HashMap<NodeId, Vec<K>>, ResolverError> {
        let snapshot = self.resolve(cache_name).await?;
        let mut grouped: std::collections::HashMap<NodeId, Vec<K>> = std::collections::HashMap::new();
        for key in keys {
            let node = snapshot
                .owner(&key)
                .ok_or_else(|| ResolverError::NoCacheNode(cache_name.clone()))?;
            grouped.entry(node).or_default().push(key);
        }
        Ok(grouped)
    }

    /// Returns the cached snapshot for `cache_name`, resolving it if
    /// this is the first request. Concurrent callers for the same
    /// `cache_name` observe the same resolution.
    pub async fn resolve(&self, cache_name: &CacheName) -> SnapshotResult<K> {
        let existing = self.snapshots.get(cache_name).map(|entry| entry.clone());
        if let Some(completion) = existing {
            return completion.await;
        }

        let fallback_name = cache_name.clone();
        let (mut source, completion) =
            completion::channel(move || Err(ResolverError::NoCacheNode(fallback_name)));

        // Only the first writer installs the cell; later readers await
        // the clone already installed by that writer (DESIGN.md). The
        // occupied-entry's completion is cloned out and the entry guard
        // dropped before awaiting it, so this never holds the shard
        // lock across an await point.
        let occupied = match self.snapshots.entry(cache_name.clone()) {
            DashEntry::Occupied(existing) => Some(existing.get().clone()),
            DashEntry::Vacant(vacant) => {
                vacant.insert(completion.clone());
                None
            }
        };
        if let Some(completion) = occupied {
            return completion.await;
        }

        let result = self.do_resolve(cache_name).await;
        if let Ok(snapshot) = &result {
            self.resolved_from
                .insert(cache_name.clone(), self.resolved_from_node(cache_name, snapshot));
        }
        source.resolve(result.clone());
        result
    }

    fn resolved_from_node(&self, cache_name: &CacheName, _snapshot: &AffinitySnapshot<K>) -> NodeId {
        self.provider
            .node_hosting(cache_name)
            .unwrap_or_else(|| self.discovery.local_node())
    }

    async fn do_resolve(&self, cache_name: &CacheName) -> SnapshotResult<K> {
        if self.provider.hosts_locally(cache_name) {
            if self.provider.is_local_only_mode(cache_name) {
                return Err(ResolverError::LocalModeMismatch(cache_name.clone()));
            }
            let (function, mapper) = self.provider.local_snapshot(cache_name)?;
            return Ok(AffinitySnapshot::new(
                function,
                mapper,
                self.discovery.topology_version(),
            ));
        }

        let mut last_err = ResolverError::NoCacheNode(cache_name.clone());
        for attempt in 0..ERROR_RETRIES {
            let Some(node) = self.provider.node_hosting(cache_name) else {
                return Err(ResolverError::NoCacheNode(cache_name.clone()));
            };
            match self.provider.remote_snapshot(cache_name, node).await {
                Ok((function, mapper)) => {
                    return Ok(AffinitySnapshot::new(
                        function,
                        mapper,
                        self.discovery.topology_version(),
                    ));
                }
                Err(err) => {
                    warn!(?cache_name, %node, attempt, %err, "affinity resolution attempt failed");
                    last_err = err;
                    tokio::time::sleep(ERROR_WAIT).await;
                }
            }
        }
        Err(last_err)
    }

    /// Called by the Topology Listener on every topology change: drops
    /// obsolete partition→nodes state from every cached snapshot.
    pub fn on_topology_change(self: &Arc<Self>, version: TopologyVersion) {
        for entry in self.snapshots.iter() {
            let completion = entry.value().clone();
            tokio::spawn(async move {
                if let Ok(snapshot) = completion.await {
                    snapshot.clean_up(version);
                }
            });
        }
    }

    /// Called by the Topology Listener on node-left/failed: schedules
    /// removal, after [`CLEANUP_DELAY`], of cache entries resolved from
    /// `node` if it is still gone by then.
    pub fn on_node_departed(self: Arc<Self>, node: NodeId) {
        tokio::spawn(async move {
            tokio::time::sleep(CLEANUP_DELAY).await;
            if self.discovery.alive(node) {
                debug!(%node, "node rejoined before resolver cleanup delay elapsed");
                return;
            }
            let stale: Vec<CacheName> = self
                .resolved_from
                .iter()
                .filter(|entry| *entry.value() == node)
                .map(|entry| entry.key().clone())
                .collect();
            for cache_name in stale {
                self.resolved_from.remove(&cache_name);
                self.snapshots.remove(&cache_name);
            }
        });
    }
}
