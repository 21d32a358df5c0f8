#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod affinity;
pub mod completion;
pub mod entry;
pub mod ids;

pub use affinity::{AffinityFunction, AffinityKeyMapper, AffinitySnapshot, PartitionId};
pub use completion::{Completion, CompletionSource};
pub use entry::Entry;
pub use ids::{CacheName, NodeId, RequestId, RequestIdGenerator, TopologyVersion};

/// Raw byte data type used for marshalled entries, updaters and error blobs.
/// Using `Bytes` provides efficient zero-copy cloning via reference counting.
pub type Raw = bytes::Bytes;
