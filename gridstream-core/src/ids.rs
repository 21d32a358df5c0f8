//! Node, cache, request and topology identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use smol_str::SmolStr;
use uuid::Uuid;

/// Identifies a single node in the data grid's discovery topology.
///
/// Cheap to copy and hash; used as the key of the loader's `buffers` map
/// and as the destination of every wire message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Builds a node id from a raw UUID, as reported by the discovery service.
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generates a new random node id. Primarily useful for local harnesses and tests.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a partitioned cache, as known to the affinity resolver.
///
/// Uses [`SmolStr`] so short, common cache names are stored inline.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct CacheName(SmolStr);

impl CacheName {
    /// Builds a cache name from any string-like value.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self(name.into())
    }

    /// Returns the cache name as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<T: Into<SmolStr>> From<T> for CacheName {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// Monotonic 64-bit identifier correlating a [`LoadRequest`] with its
/// eventual `LoadResponse`.
///
/// Unique within the lifetime of one [`Buffer`], never reused.
///
/// [`LoadRequest`]: https://docs.rs/gridstream-backend/latest/gridstream_backend/struct.LoadRequest.html
/// [`Buffer`]: https://docs.rs/gridstream/latest/gridstream/struct.Buffer.html
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw numeric request id, e.g. one received over the wire.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw numeric value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates strictly increasing [`RequestId`] values for one buffer's lifetime.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    /// Creates a generator starting at zero.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Allocates the next request id. Never returns the same value twice.
    pub fn next(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Monotonic counter incremented by the discovery layer on any node
/// membership change. Affinity snapshots are scoped to a topology version
/// so that stale partition→nodes tables can be dropped on `cleanUp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct TopologyVersion(u64);

impl TopologyVersion {
    /// The initial topology version, before any membership change has been observed.
    pub const INITIAL: TopologyVersion = TopologyVersion(0);

    /// Wraps a raw topology version number.
    pub fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the next topology version.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw numeric value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_generator_is_strictly_increasing() {
        let gen = RequestIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert!(a.as_raw() < b.as_raw());
        assert!(b.as_raw() < c.as_raw());
    }

    #[test]
    fn topology_version_orders_by_succession() {
        let v0 = TopologyVersion::INITIAL;
        let v1 = v0.next();
        assert!(v1 > v0);
        assert_eq!(v1.as_raw(), 1);
    }

    #[test]
    fn cache_name_compares_by_value() {
        let a = CacheName::new("orders");
        let b: CacheName = "orders".into();
        assert_eq!(a, b);
    }
}
