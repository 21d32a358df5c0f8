//! The Response Router: dispatches inbound `LoadResponse` messages to
//! the Buffer that owns the originating request id.

use std::sync::Arc;

use gridstream_backend::MarshallerExt;
use gridstream_core::{NodeId, RequestId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::loader::LoaderInner;
use crate::wire::LoadResponse;

/// Registers `inner`'s response topic with its transport, routing every
/// inbound message to the Buffer keyed by the sending node.
///
/// A response naming a node with no live buffer (the node already left,
/// or the buffer was never created) is dropped with a debug log — this
/// is expected under at-least-once delivery, not an error.
pub fn register<K, V>(inner: Arc<LoaderInner<K, V>>)
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    let topic = inner.response_topic.clone();
    inner.transport.add_message_listener(
        topic,
        Box::new(move |node: NodeId, payload| {
            let response: LoadResponse = match inner.marshaller.unmarshal(&payload) {
                Ok(response) => response,
                Err(err) => {
                    warn!(%err, %node, "dropping malformed LoadResponse");
                    return;
                }
            };
            let Some(buffer) = inner.buffers.get(&node) else {
                debug!(%node, req_id = response.req_id, "dropping response for a node with no live buffer");
                return;
            };
            buffer.on_response(RequestId::from_raw(response.req_id), response.error_blob);
        }),
    );
}
