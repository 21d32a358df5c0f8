//! The Per-Node Buffer: accumulates entries destined for one node and
//! drains them in bounded-size, bounded-parallelism batches.

use std::sync::Arc;
use std::sync::Mutex as SyncMutex;

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use gridstream_backend::{
    DeploymentDescriptor, LocalExecError, Marshaller, MarshallerExt, NetworkTransport, Topic,
    WorkerPool,
};
use gridstream_core::completion::{self, Completion, CompletionSource};
use gridstream_core::{CacheName, Entry, NodeId, RequestId, RequestIdGenerator};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::LoaderError;
use crate::updater::{Updater, UpdaterError};
use crate::wire::LoadRequest;

type BatchCompletion = Completion<Result<(), LoaderError>>;
type BatchSource = CompletionSource<Result<(), LoaderError>>;

struct InflightEntry {
    source: BatchSource,
    completion: BatchCompletion,
    _permit: OwnedSemaphorePermit,
}

struct PendingState<K, V> {
    entries: Vec<Entry<K, V>>,
    source: BatchSource,
    completion: BatchCompletion,
}

fn fresh_pending<K, V>() -> PendingState<K, V> {
    let (source, completion) = completion::channel(|| Err(LoaderError::Cancelled));
    PendingState {
        entries: Vec::new(),
        source,
        completion,
    }
}

/// Combines the completions of every wire batch one [`Buffer::update`]
/// call touched into a single handle, resolving `Ok(())` once all of
/// them have, or the first error observed otherwise.
fn join_completions(mut handles: Vec<BatchCompletion>) -> BatchCompletion {
    if handles.len() == 1 {
        return handles.pop().unwrap();
    }
    let (mut source, completion) = completion::channel(|| Err(LoaderError::Cancelled));
    tokio::spawn(async move {
        let outcome = futures::future::join_all(handles)
            .await
            .into_iter()
            .fold(Ok(()), |acc, result| acc.and(result));
        source.resolve(outcome);
    });
    completion
}

/// Accumulates entries bound for a single destination node, draining them
/// into `LoadRequest` batches once `bufSize` is reached or `flush` is
/// called, with at most `parallelOps` batches outstanding at a time.
pub struct Buffer<K, V> {
    node: NodeId,
    is_local: bool,
    cache_name: CacheName,
    response_topic: Topic,
    request_topic: Topic,
    transport: Arc<dyn NetworkTransport>,
    worker_pool: Arc<dyn WorkerPool>,
    marshaller: Arc<dyn Marshaller>,
    updater: Arc<dyn Updater<K, V>>,
    deployment: Option<DeploymentDescriptor>,
    buf_size: usize,
    allow_overwrite: bool,
    permits: Arc<Semaphore>,
    request_ids: RequestIdGenerator,
    inflight: DashMap<RequestId, InflightEntry>,
    local_handles: SyncMutex<Vec<BatchCompletion>>,
    pending: SyncMutex<PendingState<K, V>>,
}

impl<K, V> Buffer<K, V>
where
    K: Clone + Eq + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Builds a buffer draining into `node`. `is_local` selects the
    /// same-node optimization: batches run on the local worker pool
    /// instead of being marshalled over the network.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeId,
        is_local: bool,
        cache_name: CacheName,
        response_topic: Topic,
        transport: Arc<dyn NetworkTransport>,
        worker_pool: Arc<dyn WorkerPool>,
        marshaller: Arc<dyn Marshaller>,
        updater: Arc<dyn Updater<K, V>>,
        deployment: Option<DeploymentDescriptor>,
        buf_size: usize,
        parallel_ops: usize,
        allow_overwrite: bool,
    ) -> Arc<Self> {
        let request_topic = Topic::new(format!("gridstream.cache.{cache_name}.requests"));
        Arc::new(Self {
            node,
            is_local,
            cache_name,
            response_topic,
            request_topic,
            transport,
            worker_pool,
            marshaller,
            updater,
            deployment,
            buf_size,
            allow_overwrite,
            permits: Arc::new(Semaphore::new(parallel_ops)),
            request_ids: RequestIdGenerator::new(),
            inflight: DashMap::new(),
            local_handles: SyncMutex::new(Vec::new()),
            pending: SyncMutex::new(fresh_pending()),
        })
    }

    /// The node this buffer drains into.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Appends `entries` to the pending batch one at a time, submitting a
    /// chunk of exactly `bufSize` every time the threshold is crossed —
    /// a single call spanning more than `bufSize` entries yields more
    /// than one wire batch, never one oversized one. Returns a
    /// completion resolved once every batch this call's entries landed
    /// in (including whatever remains pending) has resolved.
    pub async fn update(&self, entries: Vec<Entry<K, V>>) -> BatchCompletion {
        let mut to_submit: Vec<(Vec<Entry<K, V>>, BatchSource, BatchCompletion)> = Vec::new();
        let trailing = {
            let mut pending = self.pending.lock().unwrap();
            for entry in entries {
                // `allowOverwrite`: a duplicate key arriving before the first
                // copy has been submitted coalesces in place (last write
                // wins) rather than growing the batch — this is purely a
                // within-one-pending-buffer optimization, never a cross-batch
                // dedup, which the ordering invariant in spec.md §5 forbids.
                if self.allow_overwrite {
                    if let Some(existing) = pending.entries.iter_mut().find(|e| e.key() == entry.key()) {
                        *existing = entry;
                        continue;
                    }
                }
                pending.entries.push(entry);
                if pending.entries.len() >= self.buf_size {
                    to_submit.push(Self::swap_pending(&mut pending));
                }
            }
            // Only this call's entries are this call's concern: if the last
            // swap left pending empty, whatever completion eventually
            // resolves it belongs to a future, unrelated caller and must
            // not be waited on here — otherwise a call whose entry count is
            // an exact multiple of bufSize would hang forever.
            (!pending.entries.is_empty()).then(|| pending.completion.clone())
        };

        let mut handles = Vec::with_capacity(to_submit.len() + 1);
        let mut submissions = Vec::with_capacity(to_submit.len());
        for (entries, source, completion) in to_submit {
            handles.push(completion.clone());
            submissions.push(self.submit(entries, source, completion));
        }
        // Dispatch every chunk this call produced concurrently rather than
        // one at a time — `submit` itself is what enforces `parallelOps`
        // via the semaphore, so awaiting a `for` loop here would serialize
        // batches that are meant to race each other up to that cap.
        futures::future::join_all(submissions).await;
        handles.extend(trailing);

        join_completions(handles)
    }

    /// Submits whatever is currently pending (if anything), then waits
    /// for every batch this buffer has outstanding to resolve. Never
    /// fails: individual batch failures are observable through the
    /// completions returned by [`update`](Self::update) instead.
    pub async fn flush(&self) {
        self.submit_pending_if_any().await;

        let mut waiters: Vec<BatchCompletion> =
            self.inflight.iter().map(|e| e.value().completion.clone()).collect();
        {
            let mut handles = self.local_handles.lock().unwrap();
            handles.retain(|c| c.clone().now_or_never().is_none());
            waiters.extend(handles.iter().cloned());
        }
        for waiter in waiters {
            let _ = waiter.await;
        }
    }

    /// Submits whatever is currently pending without waiting for it (or
    /// anything already inflight) to resolve. Used by the Flush
    /// Scheduler's best-effort periodic tick, which must not block on
    /// slow destinations.
    pub async fn try_flush(&self) {
        self.submit_pending_if_any().await;
    }

    async fn submit_pending_if_any(&self) {
        let to_submit = {
            let mut pending = self.pending.lock().unwrap();
            if pending.entries.is_empty() {
                None
            } else {
                Some(Self::swap_pending(&mut pending))
            }
        };
        if let Some((entries, source, completion)) = to_submit {
            self.submit(entries, source, completion).await;
        }
    }

    /// Delivers a `LoadResponse` for `req_id`, resolving the matching
    /// batch completion and releasing its permit. A response for an
    /// unknown or already-resolved id is dropped (duplicate delivery is
    /// expected under at-least-once transports).
    pub fn on_response(&self, req_id: RequestId, error_blob: Option<Bytes>) {
        let Some((_, entry)) = self.inflight.remove(&req_id) else {
            debug!(%req_id, node = %self.node, "dropping response for unknown request id");
            return;
        };
        let mut source = entry.source;
        let result = match error_blob {
            None => Ok(()),
            Some(blob) => match self.marshaller.unmarshal::<String>(&blob) {
                Ok(message) => Err(LoaderError::UpdaterError(message)),
                Err(err) => Err(LoaderError::from(err)),
            },
        };
        source.resolve(result);
    }

    /// Fails every inflight batch and the current pending batch with
    /// [`LoaderError::NodeLeft`], releasing their permits. Called by the
    /// Topology Listener when `self.node` leaves the cluster.
    pub fn on_node_left(&self) {
        self.fail_all(LoaderError::NodeLeft);
    }

    /// Fails every inflight batch and the current pending batch with
    /// [`LoaderError::Cancelled`] and closes the permit semaphore so any
    /// batch still waiting on [`submit`](Self::submit) observes the
    /// cancellation instead of completing normally.
    pub fn cancel_all(&self) {
        self.permits.close();
        self.fail_all(LoaderError::Cancelled);
    }

    fn fail_all(&self, err: LoaderError) {
        let ids: Vec<RequestId> = self.inflight.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.inflight.remove(&id) {
                let mut source = entry.source;
                source.resolve(Err(err.clone()));
            }
        }
        let mut pending = self.pending.lock().unwrap();
        pending.entries.clear();
        pending.source.resolve(Err(err));
    }

    fn swap_pending(
        pending: &mut PendingState<K, V>,
    ) -> (Vec<Entry<K, V>>, BatchSource, BatchCompletion) {
        let fresh = fresh_pending();
        let entries = std::mem::replace(&mut pending.entries, fresh.entries);
        let source = std::mem::replace(&mut pending.source, fresh.source);
        let completion = std::mem::replace(&mut pending.completion, fresh.completion);
        (entries, source, completion)
    }

    async fn submit(&self, entries: Vec<Entry<K, V>>, mut source: BatchSource, completion: BatchCompletion) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                source.resolve(Err(LoaderError::Cancelled));
                return;
            }
        };

        if self.is_local {
            self.local_handles.lock().unwrap().push(completion);
            let result = self.run_local(&entries).await;
            source.resolve(result);
            drop(permit);
            return;
        }

        match self.marshal_request(&entries) {
            Ok((req_id, payload)) => {
                self.inflight.insert(
                    req_id,
                    InflightEntry {
                        source,
                        completion,
                        _permit: permit,
                    },
                );
                if let Err(err) = self.transport.send(self.node, &self.request_topic, payload).await {
                    if let Some((_, entry)) = self.inflight.remove(&req_id) {
                        let mut source = entry.source;
                        source.resolve(Err(err.into()));
                    }
                }
            }
            Err(err) => {
                source.resolve(Err(err));
                drop(permit);
            }
        }
    }

    async fn run_local(&self, entries: &Vec<Entry<K, V>>) -> Result<(), LoaderError> {
        let updater = Arc::clone(&self.updater);
        let marshaller = Arc::clone(&self.marshaller);
        let entries = entries.clone();
        let task: BoxFuture<'static, Result<(), LocalExecError>> = Box::pin(async move {
            match updater.apply(entries).await {
                Ok(()) => Ok(()),
                Err(UpdaterError(message)) => {
                    let blob = marshaller.marshal(&message)?;
                    Err(LocalExecError::Application(blob))
                }
            }
        });
        match self.worker_pool.call_local_safe(task, true).await {
            Ok(()) => Ok(()),
            Err(LocalExecError::Application(blob)) => match self.marshaller.unmarshal::<String>(&blob) {
                Ok(message) => Err(LoaderError::UpdaterError(message)),
                Err(err) => Err(LoaderError::from(err)),
            },
            Err(LocalExecError::Marshal(err)) => Err(err.into()),
        }
    }

    fn marshal_request(&self, entries: &Vec<Entry<K, V>>) -> Result<(RequestId, Bytes), LoaderError> {
        let req_id = self.request_ids.next();
        let entries_blob = self.marshaller.marshal(entries)?;
        let request = LoadRequest {
            req_id: req_id.as_raw(),
            response_topic: smol_str::SmolStr::new(self.response_topic.as_str()),
            cache_name: smol_str::SmolStr::new(self.cache_name.as_str()),
            updater_blob: Bytes::new(),
            entries_blob,
            skip_store: false,
            deployment: self.deployment.clone(),
        };
        let payload = self.marshaller.marshal(&request)?;
        Ok((req_id, payload))
    }
}
