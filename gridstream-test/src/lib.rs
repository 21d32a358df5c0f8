#![doc = include_str!("../README.md")]

//! In-memory cluster harness for exercising `gridstream` end to end.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use gridstream_backend::{
    BincodeMarshaller, Discovery, MarshallerExt, MessageHandler, NetworkTransport, Topic,
    TopologyEvent, TransportError,
};
use gridstream_core::{
    AffinityFunction, AffinityKeyMapper, CacheName, Entry, NodeId, PartitionId, TopologyVersion,
};
use gridstream::error::ResolverError;
use gridstream::resolver::AffinityProvider;
use tokio::sync::broadcast;

type Listener = Arc<dyn Fn(NodeId, Bytes) + Send + Sync>;

/// Shared state of an in-memory cluster: membership, liveness, and the
/// per-node/per-topic listener table that stands in for a real network.
pub struct ClusterHub {
    listeners: DashMap<NodeId, DashMap<Topic, Listener>>,
    alive: DashMap<NodeId, bool>,
    node_order: Vec<NodeId>,
    topology_version: AtomicU64,
    events: broadcast::Sender<TopologyEvent>,
}

impl ClusterHub {
    /// Builds a hub with `count` live nodes, in a fixed, deterministic order.
    pub fn new(count: usize) -> Arc<Self> {
        let node_order: Vec<NodeId> = (0..count).map(|_| NodeId::random()).collect();
        let alive = DashMap::new();
        for node in &node_order {
            alive.insert(*node, true);
        }
        let (events, _rx) = broadcast::channel(64);
        Arc::new(Self {
            listeners: DashMap::new(),
            alive,
            node_order,
            topology_version: AtomicU64::new(0),
            events,
        })
    }

    /// The node ids in this cluster, in deterministic construction order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.node_order
    }

    /// `true` if `node` is currently marked alive.
    pub fn alive(&self, node: NodeId) -> bool {
        self.alive.get(&node).map(|v| *v).unwrap_or(false)
    }

    /// Marks `node` as departed (graceful leave) and broadcasts `NodeLeft`.
    pub fn node_left(&self, node: NodeId) {
        self.depart(node, TopologyEvent::NodeLeft);
    }

    /// Marks `node` as departed (failure) and broadcasts `NodeFailed`.
    pub fn node_failed(&self, node: NodeId) {
        self.depart(node, TopologyEvent::NodeFailed);
    }

    fn depart(&self, node: NodeId, event: fn(NodeId, TopologyVersion) -> TopologyEvent) {
        self.alive.insert(node, false);
        let version = TopologyVersion::new(self.topology_version.fetch_add(1, Ordering::SeqCst) + 1);
        let _ = self.events.send(event(node, version));
    }

    /// Marks a previously departed node alive again and broadcasts `NodeJoined`.
    pub fn revive(&self, node: NodeId) {
        self.alive.insert(node, true);
        let version = TopologyVersion::new(self.topology_version.fetch_add(1, Ordering::SeqCst) + 1);
        let _ = self.events.send(TopologyEvent::NodeJoined(node, version));
    }

    fn listener(&self, node: NodeId, topic: &Topic) -> Option<Listener> {
        self.listeners.get(&node)?.get(topic).map(|entry| Arc::clone(entry.value()))
    }

    fn register(&self, node: NodeId, topic: Topic, handler: Listener) {
        self.listeners.entry(node).or_default().insert(topic, handler);
    }

    fn unregister(&self, node: NodeId, topic: &Topic) {
        if let Some(entries) = self.listeners.get(&node) {
            entries.remove(topic);
        }
    }
}

/// One node's view of a [`ClusterHub`] as a [`Discovery`] implementation.
pub struct HarnessDiscovery {
    local: NodeId,
    hub: Arc<ClusterHub>,
}

impl HarnessDiscovery {
    /// Builds a discovery view of `hub` rooted at `local`.
    pub fn new(local: NodeId, hub: Arc<ClusterHub>) -> Arc<Self> {
        Arc::new(Self { local, hub })
    }
}

#[async_trait]
impl Discovery for HarnessDiscovery {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn topology_version(&self) -> TopologyVersion {
        TopologyVersion::new(self.hub.topology_version.load(Ordering::SeqCst))
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.hub.node_order.iter().copied().filter(|n| self.hub.alive(*n)).collect()
    }

    fn alive(&self, node: NodeId) -> bool {
        self.hub.alive(node)
    }

    async fn ping_node(&self, node: NodeId) -> bool {
        self.hub.alive(node)
    }

    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.hub.events.subscribe()
    }
}

/// One node's view of a [`ClusterHub`] as a [`NetworkTransport`].
///
/// Sends are delivered by spawning the destination's registered handler
/// onto a fresh task, so `send` itself never blocks on the handler.
pub struct ClusterTransport {
    node: NodeId,
    hub: Arc<ClusterHub>,
}

impl ClusterTransport {
    /// Builds the transport a loader on `node` sends and listens through.
    pub fn new(node: NodeId, hub: Arc<ClusterHub>) -> Arc<Self> {
        Arc::new(Self { node, hub })
    }
}

#[async_trait]
impl NetworkTransport for ClusterTransport {
    async fn send(&self, node: NodeId, topic: &Topic, payload: Bytes) -> Result<(), TransportError> {
        if !self.hub.alive(node) {
            return Err(TransportError::NodeUnreachable);
        }
        if let Some(handler) = self.hub.listener(node, topic) {
            let source = self.node;
            tokio::spawn(async move { handler(source, payload) });
        }
        Ok(())
    }

    fn add_message_listener(&self, topic: Topic, handler: MessageHandler) {
        self.hub.register(self.node, topic, Arc::from(handler));
    }

    fn remove_message_listener(&self, topic: &Topic) {
        self.hub.unregister(self.node, topic);
    }
}

/// A partitioning function that rotates a fixed node order and filters
/// out currently-dead nodes, so `nodes()` reflects the hub's live
/// membership without any cache invalidation bookkeeping of its own.
struct HarnessAffinity {
    hub: Arc<ClusterHub>,
    partitions: u32,
}

impl AffinityFunction for HarnessAffinity {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn partition(&self, affinity_key: &[u8]) -> PartitionId {
        let hash: u32 = affinity_key
            .iter()
            .fold(2166136261u32, |acc, b| (acc ^ *b as u32).wrapping_mul(16777619));
        PartitionId::new(hash % self.partitions.max(1))
    }

    fn nodes(&self, partition: PartitionId, _topology_version: TopologyVersion) -> Vec<NodeId> {
        let order = self.hub.nodes();
        if order.is_empty() {
            return Vec::new();
        }
        let start = partition.as_raw() as usize % order.len();
        let mut rotated: Vec<NodeId> = (0..order.len()).map(|i| order[(start + i) % order.len()]).collect();
        rotated.retain(|node| self.hub.alive(*node));
        rotated
    }

    fn clean_up(&self, _topology_version: TopologyVersion) {}
}

/// Maps `String` keys to affinity-key bytes via their UTF-8 encoding.
pub struct StringKeyMapper;

impl AffinityKeyMapper<String> for StringKeyMapper {
    fn affinity_key(&self, key: &String) -> Vec<u8> {
        key.as_bytes().to_vec()
    }
}

/// Resolves every cache to the same hub-backed partitioning function,
/// as if every node hosted the cache's configuration locally. Never
/// exercises the remote resolution path (the resolver's `ERROR_RETRIES`
/// retry loop is covered separately where a provider needs it).
pub struct HarnessAffinityProvider {
    function: Arc<dyn AffinityFunction>,
}

impl HarnessAffinityProvider {
    /// Builds a provider with one partition per node in `hub`.
    pub fn new(hub: Arc<ClusterHub>) -> Arc<Self> {
        let partitions = hub.nodes().len().max(1) as u32;
        Arc::new(Self {
            function: Arc::new(HarnessAffinity { hub, partitions }),
        })
    }
}

#[async_trait]
impl AffinityProvider<String> for HarnessAffinityProvider {
    fn hosts_locally(&self, _cache_name: &CacheName) -> bool {
        true
    }

    fn is_local_only_mode(&self, _cache_name: &CacheName) -> bool {
        false
    }

    fn local_snapshot(
        &self,
        _cache_name: &CacheName,
    ) -> Result<(Arc<dyn AffinityFunction>, Arc<dyn AffinityKeyMapper<String>>), ResolverError> {
        Ok((Arc::clone(&self.function), Arc::new(StringKeyMapper)))
    }

    fn node_hosting(&self, _cache_name: &CacheName) -> Option<NodeId> {
        None
    }

    async fn remote_snapshot(
        &self,
        _cache_name: &CacheName,
        _node: NodeId,
    ) -> Result<(Arc<dyn AffinityFunction>, Arc<dyn AffinityKeyMapper<String>>), ResolverError> {
        unreachable!("HarnessAffinityProvider always hosts locally")
    }
}

/// Applies a `LoadRequest`'s entries through an [`Updater`](gridstream::Updater)
/// the way a real destination node's server-side handler would, and mails
/// back a `LoadResponse`.
///
/// Registers itself on `node`'s request topic for `cache_name`; one
/// `spawn_server` call per destination node under test. Driving the
/// server side through the same `Updater` trait the client side uses lets
/// a single recording/delaying updater stand in for both ends of a
/// scenario.
pub fn spawn_server(
    hub: Arc<ClusterHub>,
    node: NodeId,
    cache_name: CacheName,
    updater: Arc<dyn gridstream::Updater<String, i32>>,
) {
    let transport = ClusterTransport::new(node, Arc::clone(&hub));
    let marshaller = Arc::new(BincodeMarshaller);
    let request_topic = Topic::new(format!("gridstream.cache.{cache_name}.requests"));

    let reply_transport = Arc::clone(&transport);
    transport.add_message_listener(
        request_topic,
        Box::new(move |requester: NodeId, payload: Bytes| {
            let marshaller = Arc::clone(&marshaller);
            let updater = Arc::clone(&updater);
            let transport = Arc::clone(&reply_transport);
            tokio::spawn(async move {
                let request: gridstream::wire::LoadRequest = match marshaller.unmarshal(&payload) {
                    Ok(request) => request,
                    Err(_) => return,
                };
                let entries: Vec<Entry<String, i32>> =
                    match marshaller.unmarshal(&request.entries_blob) {
                        Ok(entries) => entries,
                        Err(_) => return,
                    };
                let error_blob = match updater.apply(entries).await {
                    Ok(()) => None,
                    Err(err) => marshaller.marshal(&err.0).ok(),
                };
                let response = gridstream::wire::LoadResponse {
                    req_id: request.req_id,
                    error_blob,
                };
                let Ok(response_payload) = marshaller.marshal(&response) else {
                    return;
                };
                let response_topic = Topic::new(request.response_topic.as_str());
                let _ = transport.send(requester, &response_topic, response_payload).await;
            });
        }),
    );
}
