#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod buffer;
mod busy_lock;
mod router;
mod topology;

/// Loader configuration and its typestate builder.
///
/// Provides [`LoaderBuilder`](config::LoaderBuilder) — every field except
/// `updater` has a sane default; `updater` is enforced at the type level
/// via the `NotSet` marker, so [`LoaderBuilder::build`] simply does not
/// compile until one has been supplied.
pub mod config;

/// Error types surfaced by the loader engine and the affinity resolver.
///
/// Defines [`LoaderError`], covering closed-loader submissions, topology
/// and remap failures, updater/marshal errors, and cancellation; and
/// [`ResolverError`], covering affinity resolution failures.
pub mod error;

/// The Loader Engine: public ingest entry points, partitioning via the
/// Affinity Resolver, fan-out to Per-Node Buffers, and the bounded
/// remap loop that reacts to node departures.
pub mod loader;

/// The Affinity Resolver: caches one affinity snapshot per cache name,
/// resolving it lazily (locally or from a remote node) and invalidating
/// it on topology change.
pub mod resolver;

/// The Flush Scheduler: a single process-wide background task driving
/// auto-flush across every loader currently enlisted.
pub mod scheduler;

/// The server-side updater contract that a [`Loader`] applies batches
/// through, plus [`UpdaterError`](updater::UpdaterError) for rejected
/// batches.
pub mod updater;

/// Wire message shapes for the loader protocol: [`LoadRequest`] and
/// [`LoadResponse`]. Semantic, not bit-exact — compatibility across
/// versions is explicitly not a goal.
///
/// [`LoadRequest`]: wire::LoadRequest
/// [`LoadResponse`]: wire::LoadResponse
pub mod wire;

pub use config::{DEFAULT_MAX_REMAPS, LoaderBuilder, LoaderConfig, NotSet};
pub use error::{LoaderError, ResolverError};
pub use loader::Loader;
pub use resolver::{AffinityProvider, AffinityResolver, CLEANUP_DELAY, ERROR_RETRIES, ERROR_WAIT};
pub use scheduler::{Flushable, FlushScheduler};
pub use updater::{Updater, UpdaterError};
pub use wire::{LoadRequest, LoadResponse};

pub use gridstream_core::{
    AffinityFunction, AffinityKeyMapper, AffinitySnapshot, CacheName, Completion, Entry, NodeId,
    PartitionId, RequestId, TopologyVersion,
};

/// The `gridstream` prelude.
///
/// Provides convenient access to the most commonly used types:
///
/// ```rust
/// use gridstream::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{Entry, Loader, LoaderBuilder, LoaderError, Updater, UpdaterError};
}
