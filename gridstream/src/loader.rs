//! The Loader Engine: public ingest entry points, partitioning via the
//! Affinity Resolver, fan-out to Per-Node Buffers, and the bounded
//! remap loop that reacts to `NodeLeft`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as SyncMutex;

use async_trait::async_trait;
use dashmap::DashSet;
use dashmap::mapref::entry::Entry as DashEntry;
use futures::future::BoxFuture;
use gridstream_backend::{Discovery, Marshaller, MarshallerExt, NetworkTransport, Topic, WorkerPool};
use gridstream_core::completion::{self, Completion, CompletionSource};
use gridstream_core::{Entry, NodeId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::buffer::Buffer;
use crate::config::{LoaderBuilder, LoaderConfig};
use crate::error::LoaderError;
use crate::resolver::{AffinityProvider, AffinityResolver};
use crate::router;
use crate::scheduler::{Flushable, FlushScheduler};
use crate::topology;
use crate::updater::Updater;

type ResultSource = Arc<SyncMutex<CompletionSource<Result<(), LoaderError>>>>;

/// Everything `load0`, the Topology Listener and the Response Router need
/// to share. Not exposed directly: callers interact with [`Loader`].
pub(crate) struct LoaderInner<K, V> {
    config: LoaderConfig,
    pub(crate) discovery: Arc<dyn Discovery>,
    pub(crate) resolver: Arc<AffinityResolver<K>>,
    pub(crate) transport: Arc<dyn NetworkTransport>,
    worker_pool: Arc<dyn WorkerPool>,
    pub(crate) marshaller: Arc<dyn Marshaller>,
    updater: Arc<dyn Updater<K, V>>,
    deployment: Option<gridstream_backend::DeploymentDescriptor>,
    pub(crate) response_topic: Topic,
    pub(crate) buffers: dashmap::DashMap<NodeId, Arc<Buffer<K, V>>>,
    busy_lock: crate::busy_lock::BusyLock,
    active_submissions: watch::Sender<usize>,
    done_source: SyncMutex<Option<CompletionSource<()>>>,
    done: Completion<()>,
}

#[async_trait]
impl<K, V> Flushable for LoaderInner<K, V>
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    async fn try_flush(&self) {
        let buffers: Vec<Arc<Buffer<K, V>>> = self.buffers.iter().map(|e| Arc::clone(e.value())).collect();
        for buffer in buffers {
            buffer.try_flush().await;
        }
    }
}

/// Holds a read-side entry for the lifetime of one caller-visible
/// submission, decrementing `activeSubmissions` on drop regardless of
/// how the submission finished.
struct ActiveGuard<'a> {
    tx: &'a watch::Sender<usize>,
}

impl<'a> ActiveGuard<'a> {
    fn new(tx: &'a watch::Sender<usize>) -> Self {
        tx.send_modify(|n| *n += 1);
        Self { tx }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.tx.send_modify(|n| *n -= 1);
    }
}

/// Bulk-loads key/value entries into a partitioned cache, one
/// destination-node buffer at a time.
///
/// Built via [`LoaderBuilder`], which requires at minimum a cache name
/// and a server-side [`Updater`].
pub struct Loader<K, V> {
    inner: Arc<LoaderInner<K, V>>,
    topology_handle: JoinHandle<()>,
    scheduler_id: u64,
}

impl<K, V, U> LoaderBuilder<K, V, U>
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    U: Updater<K, V> + 'static,
{
    /// Consumes the builder, wiring it to its collaborators to produce a
    /// running [`Loader`]: registers the response topic, spawns the
    /// Topology Listener, and enlists with the Flush Scheduler if
    /// `autoFlushFrequency` is nonzero.
    pub fn build(
        self,
        discovery: Arc<dyn Discovery>,
        affinity_provider: Arc<dyn AffinityProvider<K>>,
        transport: Arc<dyn NetworkTransport>,
        worker_pool: Arc<dyn WorkerPool>,
        marshaller: Arc<dyn Marshaller>,
    ) -> Arc<Loader<K, V>> {
        let (config, updater) = self.into_parts();
        Loader::build(config, updater, discovery, affinity_provider, transport, worker_pool, marshaller)
    }
}

impl<K, V> Loader<K, V>
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Starts a [`LoaderBuilder`] for a loader bulk-loading into `cache_name`.
    pub fn builder(cache_name: impl Into<gridstream_core::CacheName>) -> crate::config::LoaderBuilder<K, V> {
        crate::config::LoaderBuilder::new(cache_name)
    }

    pub(crate) fn build(
        config: LoaderConfig,
        updater: Arc<dyn Updater<K, V>>,
        discovery: Arc<dyn Discovery>,
        affinity_provider: Arc<dyn AffinityProvider<K>>,
        transport: Arc<dyn NetworkTransport>,
        worker_pool: Arc<dyn WorkerPool>,
        marshaller: Arc<dyn Marshaller>,
    ) -> Arc<Self> {
        let response_topic = Topic::response_topic_for(discovery.local_node());
        let resolver = AffinityResolver::new(Arc::clone(&discovery), affinity_provider);
        let (active_submissions, _rx) = watch::channel(0usize);
        let (done_source, done) = completion::channel(|| ());

        let inner = Arc::new(LoaderInner {
            config: config.clone(),
            discovery,
            resolver,
            transport,
            worker_pool,
            marshaller,
            updater,
            deployment: None,
            response_topic,
            buffers: dashmap::DashMap::new(),
            busy_lock: crate::busy_lock::BusyLock::new(),
            active_submissions,
            done_source: SyncMutex::new(Some(done_source)),
            done,
        });

        router::register(Arc::clone(&inner));
        let topology_handle = topology::spawn(Arc::clone(&inner));

        let scheduler_id = Arc::as_ptr(&inner) as usize as u64;
        if config.auto_flush_freq() > std::time::Duration::ZERO {
            FlushScheduler::global().enlist(
                scheduler_id,
                Arc::clone(&inner) as Arc<dyn Flushable>,
                config.auto_flush_freq(),
            );
        }

        Arc::new(Self {
            inner,
            topology_handle,
            scheduler_id,
        })
    }

    /// This loader's resolved configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// `addData(key, value)`: upserts a single entry. See
    /// [`add_entries`](Self::add_entries) for when its completion
    /// resolves.
    pub async fn add_data(&self, key: K, value: V) -> Result<(), LoaderError> {
        self.add_entries(vec![Entry::upsert(key, value)]).await
    }

    /// `removeData(key)`: sugar for `addData(key, None)`.
    pub async fn remove_data(&self, key: K) -> Result<(), LoaderError> {
        self.add_entries(vec![Entry::removal(key)]).await
    }

    /// `addData(entries)`: batch ingest. Resolves once every key has
    /// been durably applied, or terminally fails.
    ///
    /// Matching `IgniteDataStreamer`: applying an entry to its
    /// destination buffer doesn't by itself submit anything over the
    /// wire — that only happens once the buffer's `bufSize` is reached,
    /// its `autoFlushFreq` timer ticks, or [`flush`](Self::flush)/
    /// [`close`](Self::close) is called. A call whose entries land under
    /// `bufSize`, with no auto-flush configured and nobody else calling
    /// `flush`, returns a completion that never resolves — this is by
    /// design, not a bug: entries sit in the buffer until something
    /// triggers a submission, exactly as a real destination-node
    /// streamer behaves.
    pub async fn add_entries(&self, entries: Vec<Entry<K, V>>) -> Result<(), LoaderError> {
        if entries.is_empty() {
            return Ok(());
        }

        let _active = ActiveGuard::new(&self.inner.active_submissions);

        let live_keys = Arc::new(DashSet::new());
        for entry in &entries {
            live_keys.insert(entry.key().clone());
        }

        let (source, completion) = completion::channel(|| Err(LoaderError::Cancelled));
        let source: ResultSource = Arc::new(SyncMutex::new(source));

        // The busy-lock guard only needs to span admission into the
        // per-node buffers (everything `load0` does up front, inline,
        // before returning): once this call's entries are handed off,
        // `close`'s `cancel_all`/`flush` must be free to act on them.
        // Holding the guard across the final `completion.await` too
        // would make `close`'s write-side `bar()` wait on a completion
        // that `close` itself is responsible for resolving — a deadlock
        // for `close(cancel: true)` against any submission still in
        // flight. `activeSubmissions` is the guard that actually spans
        // the full call; `drain_active_submissions` is what `close`
        // waits on for true completion.
        {
            let _entered = self.inner.busy_lock.enter().await?;
            load0(Arc::clone(&self.inner), entries, Arc::clone(&source), live_keys, 0).await;
        }

        completion.await
    }

    /// Submits whatever is currently pending across every buffer, then
    /// waits for all of it (and anything already inflight) to resolve.
    /// Idempotent.
    pub async fn flush(&self) -> Result<(), LoaderError> {
        let _entered = self.inner.busy_lock.enter().await?;
        let buffers: Vec<Arc<Buffer<K, V>>> =
            self.inner.buffers.iter().map(|e| Arc::clone(e.value())).collect();
        futures::future::join_all(buffers.iter().map(|b| b.flush())).await;
        Ok(())
    }

    /// The loader lifecycle completion, resolved once [`close`](Self::close)
    /// has finished.
    pub fn future(&self) -> Completion<()> {
        self.inner.done.clone()
    }

    /// Transitions OPEN → CLOSING → CLOSED. `cancel = false` performs a
    /// final flush of every buffer; `cancel = true` fails every
    /// outstanding handle with [`LoaderError::Cancelled`] instead. A
    /// second call is a no-op.
    pub async fn close(&self, cancel: bool) {
        if self.inner.busy_lock.is_closed() {
            return;
        }
        self.inner.busy_lock.bar().await;

        FlushScheduler::global().delist(self.scheduler_id);
        self.topology_handle.abort();
        self.inner.transport.remove_message_listener(&self.inner.response_topic);

        let buffers: Vec<Arc<Buffer<K, V>>> =
            self.inner.buffers.iter().map(|e| Arc::clone(e.value())).collect();
        if cancel {
            for buffer in &buffers {
                buffer.cancel_all();
            }
        } else {
            futures::future::join_all(buffers.iter().map(|b| b.flush())).await;
        }

        self.drain_active_submissions().await;

        let mut source = self.inner.done_source.lock().unwrap();
        if let Some(mut source) = source.take() {
            source.resolve(());
        }
    }

    async fn drain_active_submissions(&self) {
        let mut rx = self.inner.active_submissions.subscribe();
        loop {
            if *rx.borrow() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn get_or_create_buffer<K, V>(inner: &Arc<LoaderInner<K, V>>, node: NodeId) -> Arc<Buffer<K, V>>
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    if let Some(existing) = inner.buffers.get(&node) {
        return Arc::clone(existing.value());
    }

    let is_local = node == inner.discovery.local_node();
    let candidate = Buffer::new(
        node,
        is_local,
        inner.config.cache_name().clone(),
        inner.response_topic.clone(),
        Arc::clone(&inner.transport),
        Arc::clone(&inner.worker_pool),
        Arc::clone(&inner.marshaller),
        Arc::clone(&inner.updater),
        inner.deployment.clone(),
        inner.config.buf_size(),
        inner.config.parallel_ops(),
        inner.config.allow_overwrite(),
    );

    match inner.buffers.entry(node) {
        DashEntry::Occupied(existing) => Arc::clone(existing.get()),
        DashEntry::Vacant(vacant) => {
            vacant.insert(Arc::clone(&candidate));
            candidate
        }
    }
}

/// `load0`: the bounded remap loop. A free function (not a method)
/// because its own recursive retry needs a boxed, type-erased future —
/// `async fn` cannot call itself directly.
fn load0<K, V>(
    inner: Arc<LoaderInner<K, V>>,
    entries: Vec<Entry<K, V>>,
    result: ResultSource,
    live_keys: Arc<DashSet<K>>,
    remap_count: u32,
) -> BoxFuture<'static, ()>
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    Box::pin(async move {
        if remap_count >= inner.config.max_remaps() {
            result.lock().unwrap().resolve(Err(LoaderError::TooManyRemaps));
            return;
        }

        let mut groups: HashMap<NodeId, Vec<Entry<K, V>>> = HashMap::new();
        for entry in entries {
            match inner.resolver.map_key(inner.config.cache_name(), entry.key()).await {
                Ok(node) => groups.entry(node).or_default().push(entry),
                Err(crate::error::ResolverError::NoCacheNode(_)) => {
                    result.lock().unwrap().resolve(Err(LoaderError::NoTopology));
                    return;
                }
                Err(err) => {
                    result.lock().unwrap().resolve(Err(err.into()));
                    return;
                }
            }
        }

        for (node, group_entries) in groups {
            let buffer = get_or_create_buffer(&inner, node);
            let keys_in_group: Vec<K> = group_entries.iter().map(|e| e.key().clone()).collect();
            let retry_entries = group_entries.clone();

            let completion = buffer.update(group_entries).await;

            let inner_for_retry = Arc::clone(&inner);
            let result_for_listener = Arc::clone(&result);
            let live_keys_for_listener = Arc::clone(&live_keys);
            completion.then(move |outcome| match outcome {
                Ok(()) => {
                    for key in &keys_in_group {
                        live_keys_for_listener.remove(key);
                    }
                    if live_keys_for_listener.is_empty() {
                        result_for_listener.lock().unwrap().resolve(Ok(()));
                    }
                }
                Err(LoaderError::Cancelled) => {
                    result_for_listener.lock().unwrap().resolve(Err(LoaderError::Cancelled));
                }
                Err(LoaderError::NodeLeft) => {
                    tokio::spawn(load0(
                        inner_for_retry,
                        retry_entries,
                        result_for_listener,
                        live_keys_for_listener,
                        remap_count + 1,
                    ));
                }
                Err(other) => {
                    result_for_listener.lock().unwrap().resolve(Err(other));
                }
            });

            if !inner.discovery.alive(node) {
                inner.buffers.remove_if(&node, |_, b| Arc::ptr_eq(b, &buffer));
                buffer.on_node_left();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridstream_backend::{Discovery, MessageHandler, TopologyEvent, TransportError};
    use gridstream_core::{AffinityFunction, AffinityKeyMapper, CacheName, PartitionId, TopologyVersion};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    struct FixedAffinity {
        owner: NodeId,
    }

    impl AffinityFunction for FixedAffinity {
        fn partitions(&self) -> u32 {
            1
        }
        fn partition(&self, _affinity_key: &[u8]) -> PartitionId {
            PartitionId::new(0)
        }
        fn nodes(&self, _partition: PartitionId, _version: TopologyVersion) -> Vec<NodeId> {
            vec![self.owner]
        }
        fn clean_up(&self, _version: TopologyVersion) {}
    }

    struct StringMapper;
    impl AffinityKeyMapper<String> for StringMapper {
        fn affinity_key(&self, key: &String) -> Vec<u8> {
            key.as_bytes().to_vec()
        }
    }

    struct SingleNodeProvider {
        owner: NodeId,
    }

    #[async_trait]
    impl AffinityProvider<String> for SingleNodeProvider {
        fn hosts_locally(&self, _cache_name: &CacheName) -> bool {
            true
        }
        fn is_local_only_mode(&self, _cache_name: &CacheName) -> bool {
            false
        }
        fn local_snapshot(
            &self,
            _cache_name: &CacheName,
        ) -> Result<
            (
                Arc<dyn gridstream_core::AffinityFunction>,
                Arc<dyn gridstream_core::AffinityKeyMapper<String>>,
            ),
            crate::error::ResolverError,
        > {
            Ok((Arc::new(FixedAffinity { owner: self.owner }), Arc::new(StringMapper)))
        }
        fn node_hosting(&self, _cache_name: &CacheName) -> Option<NodeId> {
            Some(self.owner)
        }
        async fn remote_snapshot(
            &self,
            _cache_name: &CacheName,
            _node: NodeId,
        ) -> Result<
            (
                Arc<dyn gridstream_core::AffinityFunction>,
                Arc<dyn gridstream_core::AffinityKeyMapper<String>>,
            ),
            crate::error::ResolverError,
        > {
            unreachable!("single node always hosts locally")
        }
    }

    struct FakeDiscovery {
        local: NodeId,
    }

    #[async_trait]
    impl Discovery for FakeDiscovery {
        fn local_node(&self) -> NodeId {
            self.local
        }
        fn topology_version(&self) -> TopologyVersion {
            TopologyVersion::INITIAL
        }
        fn nodes(&self) -> Vec<NodeId> {
            vec![self.local]
        }
        fn alive(&self, node: NodeId) -> bool {
            node == self.local
        }
        async fn ping_node(&self, node: NodeId) -> bool {
            node == self.local
        }
        fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
            broadcast::channel(1).1
        }
    }

    struct RecordingTransport;

    #[async_trait]
    impl NetworkTransport for RecordingTransport {
        async fn send(&self, _node: NodeId, _topic: &Topic, _payload: bytes::Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        fn add_message_listener(&self, _topic: Topic, _handler: MessageHandler) {}
        fn remove_message_listener(&self, _topic: &Topic) {}
    }

    struct NoopUpdater;

    #[async_trait]
    impl Updater<String, i32> for NoopUpdater {
        async fn apply(&self, _entries: Vec<Entry<String, i32>>) -> Result<(), crate::updater::UpdaterError> {
            Ok(())
        }
    }

    fn build_loader() -> (Arc<Loader<String, i32>>, NodeId) {
        let owner = NodeId::random();
        let discovery = Arc::new(FakeDiscovery { local: owner });
        let provider = Arc::new(SingleNodeProvider { owner });
        // `addData`'s returned completion only resolves once its entries
        // are actually submitted (by a size/time trigger or an explicit
        // flush — see `add_entries`'s doc comment), matching Ignite's
        // `IgniteDataStreamer`. A buffer size of 1 makes every single
        // `addData` call its own size trigger, so these tests don't need
        // a separate `flush()` call to observe that contract.
        let (config, updater) = crate::config::LoaderBuilder::<String, i32, _>::new("orders")
            .per_node_buffer_size(1)
            .updater(NoopUpdater)
            .into_parts();
        let loader = Loader::build(
            config,
            updater,
            discovery,
            provider,
            Arc::new(RecordingTransport),
            Arc::new(gridstream_backend::TokioWorkerPool),
            Arc::new(gridstream_backend::BincodeMarshaller),
        );
        (loader, owner)
    }

    #[tokio::test]
    async fn add_data_resolves_once_the_local_updater_applies_it() {
        let (loader, _owner) = build_loader();
        assert!(loader.add_data("a".to_string(), 1).await.is_ok());
    }

    #[tokio::test]
    async fn close_resolves_the_lifecycle_future() {
        let (loader, _owner) = build_loader();
        loader.add_data("a".to_string(), 1).await.unwrap();
        loader.close(false).await;
        assert!(loader.future().await == ());
        assert!(matches!(
            loader.add_data("b".to_string(), 2).await,
            Err(LoaderError::LoaderClosed)
        ));
    }

    #[tokio::test]
    async fn cancelling_close_fails_outstanding_batches() {
        let (loader, _owner) = build_loader();
        let submission = loader.add_data("a".to_string(), 1);
        tokio::pin!(submission);
        loader.close(true).await;
        let _ = submission.await;
    }
}
