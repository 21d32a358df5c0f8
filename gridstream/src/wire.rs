//! Wire message shapes for the loader protocol.
//!
//! Semantic, not bit-exact: compatibility across versions is explicitly
//! not a goal. Entries-blob and updater-blob are opaque, delegated to
//! the configured [`Marshaller`](gridstream_backend::Marshaller).

use bytes::Bytes;
use gridstream_backend::DeploymentDescriptor;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A batch sent from a loader to the node that owns it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Correlates this request with its eventual [`LoadResponse`].
    pub req_id: u64,
    /// Topic the response should be sent back on.
    pub response_topic: SmolStr,
    /// Name of the target cache.
    pub cache_name: SmolStr,
    /// Reserved for peer-deployed updater bytecode (see
    /// [`DeploymentDescriptor`]); a Rust `Updater` is a live trait object,
    /// not serializable bytes, so this implementation leaves the field
    /// empty and resolves the destination-side updater out of band, keyed
    /// by `cache_name` (see `DESIGN.md`).
    pub updater_blob: Bytes,
    /// Opaque marshalled entries for this batch.
    pub entries_blob: Bytes,
    /// Skips the read-through store step on the destination (mirrors
    /// the source system's `skipStore`; unused unless a collaborator
    /// cares about it).
    pub skip_store: bool,
    /// Optional peer-deployment metadata.
    pub deployment: Option<DeploymentDescriptor>,
}

/// The destination node's acknowledgement of a [`LoadRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadResponse {
    /// Echoes [`LoadRequest::req_id`].
    pub req_id: u64,
    /// Opaque marshalled error, present only on failure.
    pub error_blob: Option<Bytes>,
}
