//! The server-side updater contract.

use async_trait::async_trait;
use gridstream_core::Entry;

/// Applies a batch of entries to the cache on the node that owns them.
///
/// # Idempotence
///
/// Because node-left remaps entries to a new owner without knowing
/// whether the original submission was actually applied, the loader's
/// delivery semantics are at-least-once. An `Updater` **must** be
/// commutative and idempotent per key: applying the same entry more
/// than once, in any order relative to other entries for different
/// keys, must converge to the same cache state. This is the
/// correctness contract the at-least-once delivery guarantee relies
/// on.
#[async_trait]
pub trait Updater<K, V>: Send + Sync {
    /// Applies `entries` to the cache. A `None` value denotes a removal
    /// (see [`Entry::is_removal`]).
    ///
    /// Returning `Err` fails the batch's completion with
    /// [`LoaderError::UpdaterError`](crate::LoaderError::UpdaterError);
    /// the Loader Engine does not retry updater-rejected batches — only
    /// `NodeLeft` drives a remap.
    async fn apply(&self, entries: Vec<Entry<K, V>>) -> Result<(), UpdaterError>;
}

/// An application-level error returned by an [`Updater`].
#[derive(Debug, Clone)]
pub struct UpdaterError(pub String);

impl std::fmt::Display for UpdaterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UpdaterError {}
