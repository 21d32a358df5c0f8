//! Error types surfaced by the loader engine.

use gridstream_backend::{MarshalError, TransportError};
use thiserror::Error;

/// Errors a caller of [`Loader`](crate::Loader) can observe.
///
/// Retryable errors (`NodeLeft`) are handled internally by `load0`'s
/// bounded remap loop and never escape to the caller on their own —
/// they only surface wrapped in [`LoaderError::TooManyRemaps`] once the
/// remap budget is exhausted.
#[derive(Debug, Error, Clone)]
pub enum LoaderError {
    /// Submission was attempted after [`close`](crate::Loader::close).
    #[error("loader is closed")]
    LoaderClosed,

    /// No node hosts the target cache at mapping time.
    #[error("no node currently hosts this cache")]
    NoTopology,

    /// The destination node left before acknowledging; internally
    /// retryable, drives a remap. Only observed by callers once it has
    /// exhausted `maxRemaps` (see [`TooManyRemaps`](Self::TooManyRemaps)).
    #[error("destination node left before acknowledging")]
    NodeLeft,

    /// The remap budget (`maxRemaps`) was exhausted for this batch.
    #[error("exceeded the maximum number of remaps")]
    TooManyRemaps,

    /// The server-side updater rejected the batch.
    #[error("updater rejected the batch: {0}")]
    UpdaterError(String),

    /// Failed to serialize or deserialize a request, response, or
    /// updater blob. Non-retryable for the batch it occurred in.
    #[error("marshalling failed: {0}")]
    MarshalError(String),

    /// The loader was closed with `cancel = true` while the batch was
    /// in flight.
    #[error("loader closed with cancellation while the batch was in flight")]
    Cancelled,

    /// Affinity resolution failed after exhausting its retry budget.
    #[error("affinity resolution failed: {0}")]
    ResolverFailure(String),
}

impl From<MarshalError> for LoaderError {
    fn from(err: MarshalError) -> Self {
        Self::MarshalError(err.to_string())
    }
}

impl From<TransportError> for LoaderError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NodeUnreachable => Self::NodeLeft,
            TransportError::SendFailed(e) => Self::MarshalError(e.to_string()),
        }
    }
}

/// Errors returned from [`crate::resolver::AffinityResolver`].
#[derive(Debug, Error, Clone)]
pub enum ResolverError {
    /// No node currently hosts the requested cache.
    #[error("no node hosts cache {0:?}")]
    NoCacheNode(gridstream_core::CacheName),

    /// The cache is configured in a purely local (single-owner) mode,
    /// which this resolution strategy cannot serve remotely.
    #[error("cache {0:?} is in local-only mode")]
    LocalModeMismatch(gridstream_core::CacheName),

    /// A remote request for the affinity function/mapper failed on
    /// every attempt within `ERROR_RETRIES`.
    #[error("remote affinity lookup failed after retries: {0}")]
    RemoteLookupFailed(String),
}

impl From<ResolverError> for LoaderError {
    fn from(err: ResolverError) -> Self {
        Self::ResolverFailure(err.to_string())
    }
}
