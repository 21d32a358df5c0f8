//! End-to-end scenarios driving a [`Loader`] through the in-memory
//! cluster harness: partitioning, node departure, remap exhaustion,
//! parallelism, and both flavors of `close`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gridstream::error::ResolverError;
use gridstream::resolver::AffinityProvider;
use gridstream::{Entry, Loader, LoaderError, Updater, UpdaterError};
use gridstream_backend::{
    BincodeMarshaller, Discovery, MessageHandler, NetworkTransport, TokioWorkerPool, Topic,
    TopologyEvent, TransportError,
};
use gridstream_core::{AffinityFunction, AffinityKeyMapper, CacheName, NodeId, PartitionId, TopologyVersion};
use gridstream_test::{ClusterHub, ClusterTransport, HarnessAffinityProvider, HarnessDiscovery, spawn_server};
use tokio::sync::broadcast;

/// Records every batch an [`Updater`] was asked to apply.
#[derive(Default)]
struct Recording {
    batches: Mutex<Vec<Vec<(String, i32)>>>,
}

impl Recording {
    fn record(&self, entries: Vec<Entry<String, i32>>) {
        let batch = entries
            .into_iter()
            .map(|e| {
                let (key, value) = e.into_parts();
                (key, value.unwrap_or_default())
            })
            .collect();
        self.batches.lock().unwrap().push(batch);
    }

    fn sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(|b| b.len()).collect()
    }

    fn total(&self) -> usize {
        self.sizes().iter().sum()
    }

    fn keys(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// An [`Updater`] that just records what it was handed, optionally after
/// a fixed delay (standing in for a slow destination node).
struct RecordingUpdater {
    recording: Arc<Recording>,
    delay: Option<Duration>,
}

#[async_trait]
impl Updater<String, i32> for RecordingUpdater {
    async fn apply(&self, entries: Vec<Entry<String, i32>>) -> Result<(), UpdaterError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.recording.record(entries);
        Ok(())
    }
}

/// An [`Updater`] that blocks until told to proceed, notifying `started`
/// the moment it is first invoked. Models a destination that has
/// accepted a batch but not yet acknowledged it.
struct BlockingUpdater {
    started: Arc<tokio::sync::Notify>,
    resume: Arc<tokio::sync::Notify>,
    recording: Arc<Recording>,
}

#[async_trait]
impl Updater<String, i32> for BlockingUpdater {
    async fn apply(&self, entries: Vec<Entry<String, i32>>) -> Result<(), UpdaterError> {
        self.started.notify_one();
        self.resume.notified().await;
        self.recording.record(entries);
        Ok(())
    }
}

/// Tracks the number of concurrently running [`Updater::apply`] calls.
struct ConcurrencyTrackingUpdater {
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl Updater<String, i32> for ConcurrencyTrackingUpdater {
    async fn apply(&self, _entries: Vec<Entry<String, i32>>) -> Result<(), UpdaterError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Replicates [`gridstream_test`]'s internal FNV-1a partitioning well
/// enough to find a key landing on a specific hub node, without needing
/// to expose the hash itself from the harness crate.
fn key_owned_by(hub: &ClusterHub, node: NodeId) -> String {
    let order = hub.nodes();
    let node_count = order.len() as u32;
    let target_index = order.iter().position(|n| *n == node).expect("node must be a hub member");
    for i in 0..10_000u32 {
        let candidate = format!("k{i}");
        let hash: u32 = candidate
            .as_bytes()
            .iter()
            .fold(2166136261u32, |acc, b| (acc ^ *b as u32).wrapping_mul(16777619));
        if (hash % node_count) as usize == target_index {
            return candidate;
        }
    }
    panic!("no candidate key found for node index {target_index}");
}

#[tokio::test]
async fn s1_single_node_happy_path_delivers_every_entry() {
    let hub = ClusterHub::new(1);
    let node = hub.nodes()[0];
    let discovery = HarnessDiscovery::new(node, Arc::clone(&hub));
    let provider = HarnessAffinityProvider::new(Arc::clone(&hub));
    let transport = ClusterTransport::new(node, Arc::clone(&hub));
    let recording = Arc::new(Recording::default());

    let loader = Loader::<String, i32>::builder("orders")
        .per_node_buffer_size(4)
        .updater(RecordingUpdater {
            recording: Arc::clone(&recording),
            delay: None,
        })
        .build(
            discovery,
            provider,
            transport,
            Arc::new(TokioWorkerPool),
            Arc::new(BincodeMarshaller),
        );

    let entries = (0..5).map(|i| Entry::upsert(format!("k{i}"), i)).collect();
    let add_fut = loader.add_entries(entries);
    tokio::pin!(add_fut);

    // The fifth entry never reaches the bufSize=4 threshold on its own;
    // force it out instead of waiting on an auto-flush that never comes.
    tokio::task::yield_now().await;
    loader.flush().await.unwrap();

    assert!(add_fut.await.is_ok());
    assert_eq!(recording.total(), 5);
    assert!(recording.sizes().iter().all(|&n| n <= 4));

    let mut keys = recording.keys();
    keys.sort();
    assert_eq!(keys, (0..5).map(|i| format!("k{i}")).collect::<Vec<_>>());
}

#[tokio::test]
async fn s2_partitioning_fans_entries_out_across_three_nodes() {
    let hub = ClusterHub::new(3);
    let provider = HarnessAffinityProvider::new(Arc::clone(&hub));

    let recordings: Vec<Arc<Recording>> = (0..3).map(|_| Arc::new(Recording::default())).collect();
    for (node, recording) in hub.nodes().iter().zip(&recordings) {
        let updater = Arc::new(RecordingUpdater {
            recording: Arc::clone(recording),
            delay: None,
        });
        spawn_server(Arc::clone(&hub), *node, CacheName::new("orders"), updater);
    }

    // A client that is not itself a cluster member: every destination is
    // remote, so the same-node optimization never shortcuts this test.
    let client = NodeId::random();
    let discovery = HarnessDiscovery::new(client, Arc::clone(&hub));
    let transport = ClusterTransport::new(client, Arc::clone(&hub));

    let loader = Loader::<String, i32>::builder("orders")
        .per_node_buffer_size(1)
        .updater(RecordingUpdater {
            recording: Arc::new(Recording::default()),
            delay: None,
        })
        .build(
            discovery,
            provider,
            transport,
            Arc::new(TokioWorkerPool),
            Arc::new(BincodeMarshaller),
        );

    let keys: Vec<String> = hub.nodes().iter().map(|node| key_owned_by(&hub, *node)).collect();
    let entries = keys.iter().cloned().enumerate().map(|(i, k)| Entry::upsert(k, i as i32)).collect();

    loader.add_entries(entries).await.unwrap();

    let total: usize = recordings.iter().map(|r| r.total()).sum();
    assert_eq!(total, 3);
    assert!(recordings.iter().all(|r| r.total() == 1));
}

#[tokio::test]
async fn s3_node_left_remaps_in_flight_entries_to_the_survivor() {
    let hub = ClusterHub::new(2);
    let node1 = hub.nodes()[0];
    let node2 = hub.nodes()[1];

    let survivor_recording = Arc::new(Recording::default());
    spawn_server(
        Arc::clone(&hub),
        node1,
        CacheName::new("orders"),
        Arc::new(RecordingUpdater {
            recording: Arc::clone(&survivor_recording),
            delay: None,
        }),
    );

    let started = Arc::new(tokio::sync::Notify::new());
    let resume = Arc::new(tokio::sync::Notify::new());
    let stranded_recording = Arc::new(Recording::default());
    spawn_server(
        Arc::clone(&hub),
        node2,
        CacheName::new("orders"),
        Arc::new(BlockingUpdater {
            started: Arc::clone(&started),
            resume: Arc::clone(&resume),
            recording: Arc::clone(&stranded_recording),
        }),
    );

    let client = NodeId::random();
    let discovery = HarnessDiscovery::new(client, Arc::clone(&hub));
    let provider = HarnessAffinityProvider::new(Arc::clone(&hub));
    let transport = ClusterTransport::new(client, Arc::clone(&hub));

    let loader = Loader::<String, i32>::builder("orders")
        .per_node_buffer_size(1)
        .updater(RecordingUpdater {
            recording: Arc::new(Recording::default()),
            delay: None,
        })
        .build(
            discovery,
            provider,
            transport,
            Arc::new(TokioWorkerPool),
            Arc::new(BincodeMarshaller),
        );

    let key = key_owned_by(&hub, node2);
    let add_fut = loader.add_data(key.clone(), 7);
    tokio::pin!(add_fut);

    // Wait for node2 to have accepted the batch, then pull it out from
    // under the in-flight request before it acknowledges.
    started.notified().await;
    hub.node_left(node2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(add_fut.await.is_ok());
    assert_eq!(survivor_recording.total(), 1);
    assert_eq!(survivor_recording.keys(), vec![key]);

    // Let the stranded call on node2 unblock so its task doesn't linger.
    resume.notify_one();
}

struct StuckAffinity {
    owner: NodeId,
}

impl AffinityFunction for StuckAffinity {
    fn partitions(&self) -> u32 {
        1
    }
    fn partition(&self, _affinity_key: &[u8]) -> PartitionId {
        PartitionId::new(0)
    }
    fn nodes(&self, _partition: PartitionId, _topology_version: TopologyVersion) -> Vec<NodeId> {
        vec![self.owner]
    }
    fn clean_up(&self, _topology_version: TopologyVersion) {}
}

struct ByteKeyMapper;

impl AffinityKeyMapper<String> for ByteKeyMapper {
    fn affinity_key(&self, key: &String) -> Vec<u8> {
        key.as_bytes().to_vec()
    }
}

struct StuckProvider {
    owner: NodeId,
}

#[async_trait]
impl AffinityProvider<String> for StuckProvider {
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
        Ok((Arc::new(StuckAffinity { owner: self.owner }), Arc::new(ByteKeyMapper)))
    }
    fn node_hosting(&self, _cache_name: &CacheName) -> Option<NodeId> {
        Some(self.owner)
    }
    async fn remote_snapshot(
        &self,
        _cache_name: &CacheName,
        _node: NodeId,
    ) -> Result<(Arc<dyn AffinityFunction>, Arc<dyn AffinityKeyMapper<String>>), ResolverError> {
        unreachable!("StuckProvider always hosts locally")
    }
}

/// A transport whose destination is never actually reachable, no matter
/// what the discovery layer believes — every send fails the way a
/// destination that keeps dropping off the network would.
struct UnreachableTransport;

#[async_trait]
impl NetworkTransport for UnreachableTransport {
    async fn send(&self, _node: NodeId, _topic: &Topic, _payload: Bytes) -> Result<(), TransportError> {
        Err(TransportError::NodeUnreachable)
    }
    fn add_message_listener(&self, _topic: Topic, _handler: MessageHandler) {}
    fn remove_message_listener(&self, _topic: &Topic) {}
}

struct TwoNodeDiscovery {
    local: NodeId,
    owner: NodeId,
}

#[async_trait]
impl Discovery for TwoNodeDiscovery {
    fn local_node(&self) -> NodeId {
        self.local
    }
    fn topology_version(&self) -> TopologyVersion {
        TopologyVersion::INITIAL
    }
    fn nodes(&self) -> Vec<NodeId> {
        vec![self.local, self.owner]
    }
    fn alive(&self, node: NodeId) -> bool {
        node == self.local || node == self.owner
    }
    async fn ping_node(&self, node: NodeId) -> bool {
        self.alive(node)
    }
    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        broadcast::channel(1).1
    }
}

#[tokio::test]
async fn s4_exhausting_the_remap_budget_fails_with_too_many_remaps() {
    let owner = NodeId::random();
    let local = NodeId::random();
    let discovery = Arc::new(TwoNodeDiscovery { local, owner });
    let provider: Arc<dyn AffinityProvider<String>> = Arc::new(StuckProvider { owner });
    let recording = Arc::new(Recording::default());

    let loader = Loader::<String, i32>::builder("orders")
        .per_node_buffer_size(1)
        .max_remaps(3)
        .updater(RecordingUpdater {
            recording: Arc::clone(&recording),
            delay: None,
        })
        .build(
            discovery,
            provider,
            Arc::new(UnreachableTransport),
            Arc::new(TokioWorkerPool),
            Arc::new(BincodeMarshaller),
        );

    let result = loader.add_data("a".to_string(), 1).await;
    assert!(matches!(result, Err(LoaderError::TooManyRemaps)));
    assert_eq!(recording.total(), 0);

    // The loader itself is still usable after a batch exhausts its remap
    // budget — only that batch's callers see the failure.
    assert!(matches!(
        loader.add_data("b".to_string(), 2).await,
        Err(LoaderError::TooManyRemaps)
    ));
}

#[tokio::test]
async fn s5_never_exceeds_the_configured_parallelism_cap() {
    let hub = ClusterHub::new(1);
    let node = hub.nodes()[0];
    let discovery = HarnessDiscovery::new(node, Arc::clone(&hub));
    let provider = HarnessAffinityProvider::new(Arc::clone(&hub));
    let transport = ClusterTransport::new(node, Arc::clone(&hub));

    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let updater = ConcurrencyTrackingUpdater {
        current: Arc::clone(&current),
        max_seen: Arc::clone(&max_seen),
        delay: Duration::from_millis(30),
    };

    let loader = Loader::<String, i32>::builder("orders")
        .per_node_buffer_size(1)
        .per_node_parallel_load_operations(2)
        .updater(updater)
        .build(
            discovery,
            provider,
            transport,
            Arc::new(TokioWorkerPool),
            Arc::new(BincodeMarshaller),
        );

    let entries = (0..10).map(|i| Entry::upsert(format!("k{i}"), i)).collect();
    loader.add_entries(entries).await.unwrap();

    assert!(max_seen.load(Ordering::SeqCst) >= 1);
    assert!(max_seen.load(Ordering::SeqCst) <= 2);
    assert_eq!(current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn s6_graceful_close_waits_for_the_in_flight_batch_to_land() {
    let hub = ClusterHub::new(1);
    let node = hub.nodes()[0];
    let discovery = HarnessDiscovery::new(node, Arc::clone(&hub));
    let provider = HarnessAffinityProvider::new(Arc::clone(&hub));
    let transport = ClusterTransport::new(node, Arc::clone(&hub));
    let recording = Arc::new(Recording::default());

    let loader = Loader::<String, i32>::builder("orders")
        .per_node_buffer_size(1)
        .updater(RecordingUpdater {
            recording: Arc::clone(&recording),
            delay: Some(Duration::from_millis(20)),
        })
        .build(
            discovery,
            provider,
            transport,
            Arc::new(TokioWorkerPool),
            Arc::new(BincodeMarshaller),
        );

    let submission = tokio::spawn({
        let loader = Arc::clone(&loader);
        async move { loader.add_data("a".to_string(), 1).await }
    });
    tokio::task::yield_now().await;

    loader.close(false).await;

    assert!(submission.await.unwrap().is_ok());
    assert_eq!(recording.total(), 1);
    loader.future().await;
    assert!(matches!(
        loader.add_data("b".to_string(), 2).await,
        Err(LoaderError::LoaderClosed)
    ));
}

#[tokio::test]
async fn s7_cancelling_close_fails_outstanding_batches_instead_of_waiting() {
    let hub = ClusterHub::new(1);
    let node = hub.nodes()[0];
    let provider = HarnessAffinityProvider::new(Arc::clone(&hub));
    let recording = Arc::new(Recording::default());

    // A destination that never acknowledges: every batch this loader
    // sends sits inflight until cancellation forces it out.
    let stuck = Arc::new(tokio::sync::Notify::new());
    spawn_server(
        Arc::clone(&hub),
        node,
        CacheName::new("orders"),
        Arc::new(BlockingUpdater {
            started: Arc::new(tokio::sync::Notify::new()),
            resume: Arc::clone(&stuck),
            recording: Arc::clone(&recording),
        }),
    );

    let client = NodeId::random();
    let client_discovery = HarnessDiscovery::new(client, Arc::clone(&hub));
    let client_transport = ClusterTransport::new(client, Arc::clone(&hub));

    // A high parallelism cap keeps every concurrent submission's admission
    // phase (partitioning + permit acquisition) fast, so the busy-lock
    // guard each `add_data` holds across `load0` clears quickly and
    // doesn't itself block `close`'s `bar()` — the whole point of this
    // scenario is to exercise `cancel_all` pulling batches out of flight
    // from *beyond* admission, not to starve admission itself on a
    // saturated per-node semaphore.
    let loader = Loader::<String, i32>::builder("orders")
        .per_node_buffer_size(1)
        .per_node_parallel_load_operations(100)
        .updater(RecordingUpdater {
            recording: Arc::new(Recording::default()),
            delay: None,
        })
        .build(
            client_discovery,
            provider,
            client_transport,
            Arc::new(TokioWorkerPool),
            Arc::new(BincodeMarshaller),
        );

    let mut submissions = Vec::new();
    for i in 0..100 {
        let loader = Arc::clone(&loader);
        submissions.push(tokio::spawn(async move { loader.add_data(format!("k{i}"), i).await }));
    }
    tokio::task::yield_now().await;

    loader.close(true).await;

    for submission in submissions {
        let outcome = submission.await.unwrap();
        assert!(matches!(outcome, Err(LoaderError::Cancelled) | Err(LoaderError::LoaderClosed)));
    }

    let _ = node;
    stuck.notify_waiters();
}
