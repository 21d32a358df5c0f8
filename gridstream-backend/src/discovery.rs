//! Node discovery: topology enumeration, liveness and membership events.

use async_trait::async_trait;
use gridstream_core::{NodeId, TopologyVersion};

/// A membership change fired by the discovery layer.
///
/// The Topology Listener reacts to `NodeLeft`/`NodeFailed` by evicting the
/// corresponding buffer and nudging the Affinity Resolver to clean up;
/// `NodeJoined` requires no immediate action (see `gridstream`'s topology
/// module).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A node joined the cluster at the given topology version.
    NodeJoined(NodeId, TopologyVersion),
    /// A node left the cluster gracefully.
    NodeLeft(NodeId, TopologyVersion),
    /// A node was declared failed (missed heartbeats).
    NodeFailed(NodeId, TopologyVersion),
}

impl TopologyEvent {
    /// The node this event concerns.
    pub fn node(&self) -> NodeId {
        match self {
            Self::NodeJoined(id, _) | Self::NodeLeft(id, _) | Self::NodeFailed(id, _) => *id,
        }
    }

    /// The topology version this event was raised at.
    pub fn topology_version(&self) -> TopologyVersion {
        match self {
            Self::NodeJoined(_, v) | Self::NodeLeft(_, v) | Self::NodeFailed(_, v) => *v,
        }
    }

    /// `true` for `NodeLeft`/`NodeFailed`, the variants the loader must
    /// react to by evicting buffers and remapping in-flight entries.
    pub fn is_departure(&self) -> bool {
        matches!(self, Self::NodeLeft(..) | Self::NodeFailed(..))
    }
}

/// Discovery service contract: the loader's only window onto cluster
/// membership.
///
/// Implementations must deliver events in the order topology versions
/// increase, and `nodes()`/`alive()` must be internally consistent with
/// the most recently delivered event at the time of the call.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// This process's own node id.
    fn local_node(&self) -> NodeId;

    /// Current topology version.
    fn topology_version(&self) -> TopologyVersion;

    /// All nodes currently believed to be members of the cluster.
    fn nodes(&self) -> Vec<NodeId>;

    /// `true` if `node` is currently a live cluster member.
    fn alive(&self, node: NodeId) -> bool;

    /// Pings `node`, confirming liveness beyond the last known topology
    /// snapshot. Used by the resolver/buffer to distinguish a genuinely
    /// unreachable node from a transient send failure.
    async fn ping_node(&self, node: NodeId) -> bool;

    /// Subscribes to topology events. Each call returns an independent
    /// receiver; the topology listener keeps exactly one alive for the
    /// lifetime of the loader.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TopologyEvent>;
}
