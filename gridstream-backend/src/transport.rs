//! Network transport: point-to-point message delivery addressed by topic.

use async_trait::async_trait;
use bytes::Bytes;
use gridstream_core::NodeId;
use smol_str::SmolStr;

use crate::error::TransportError;

/// A topic name a [`NetworkTransport`] message is addressed to.
///
/// Every loader instance registers a unique response topic derived from
/// its local node id (see the Response Router), so destinations know
/// where to deliver `LoadResponse` messages.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(SmolStr);

impl Topic {
    /// Builds a topic from any string-like value.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self(name.into())
    }

    /// The per-loader response topic for a loader rooted at `node`.
    pub fn response_topic_for(node: NodeId) -> Self {
        Self(SmolStr::new(format!("gridstream.loader.response.{node}")))
    }

    /// Returns the topic name as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A listener invoked for every message delivered to a subscribed topic.
///
/// Boxed so `NetworkTransport` implementations can hold a homogeneous
/// collection of listeners across different message payload shapes; the
/// payload is always the marshalled bytes of a `LoadRequest`/`LoadResponse`.
pub type MessageHandler = Box<dyn Fn(NodeId, Bytes) + Send + Sync>;

/// Point-to-point message transport between cluster nodes.
///
/// `gridstream` never depends on a specific wire protocol: this trait is
/// the entire surface the loader needs — fire-and-forget send plus topic
/// subscription. Delivery is at-most-once from the transport's
/// perspective; the loader's own retry/remap logic is what provides the
/// at-least-once guarantee over multiple send attempts.
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    /// Sends `payload` to `node` on `topic`. Resolves once the message
    /// has been handed off; does not wait for a response.
    ///
    /// Fails with [`TransportError::NodeUnreachable`] when the
    /// destination is known to be down (the Per-Node Buffer turns this
    /// into a `NodeLeft` completion), or
    /// [`TransportError::SendFailed`] for any other transport-level
    /// failure (turned into a plain send-error completion, left to the
    /// Loader Engine to decide on remap).
    async fn send(&self, node: NodeId, topic: &Topic, payload: Bytes) -> Result<(), TransportError>;

    /// Registers `handler` to be invoked for every message arriving on
    /// `topic`. Replaces any handler previously registered for the same
    /// topic.
    fn add_message_listener(&self, topic: Topic, handler: MessageHandler);

    /// Unregisters the handler for `topic`, if any.
    fn remove_message_listener(&self, topic: &Topic);
}
