//! The Topology Listener: reacts to node membership changes by evicting
//! the departed node's buffer and nudging the Affinity Resolver.

use std::sync::Arc;

use gridstream_backend::{Discovery, TopologyEvent};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::loader::LoaderInner;

/// Spawns the background task that drives `inner`'s reaction to topology
/// events for as long as the returned handle is not aborted.
pub fn spawn<K, V>(inner: Arc<LoaderInner<K, V>>) -> JoinHandle<()>
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    let mut events = inner.discovery.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "topology listener lagged, some events were dropped");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            handle_event(&inner, event);
        }
    })
}

fn handle_event<K, V>(inner: &Arc<LoaderInner<K, V>>, event: TopologyEvent)
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    inner.resolver.on_topology_change(event.topology_version());

    if !event.is_departure() {
        return;
    }

    let node = event.node();
    if let Some((_, buffer)) = inner.buffers.remove(&node) {
        // Never run onNodeLeft synchronously on this task: it resolves
        // completions whose `.then()` listeners may themselves touch
        // `inner.buffers`, and re-entering this loop's own caller would
        // deadlock against the broadcast channel.
        tokio::spawn(async move { buffer.on_node_left() });
    }
    inner.resolver.clone().on_node_departed(node);
}
