//! The entry data model: immutable key/value pairs bound for a cache.

/// An immutable key/value pair submitted to the loader.
///
/// A `value` of `None` denotes a removal (`removeData` is sugar for
/// `addData` with an absent value). The key is never optional.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Entry<K, V> {
    key: K,
    value: Option<V>,
}

impl<K, V> Entry<K, V> {
    /// Builds an entry that upserts `key` to `value`.
    pub fn upsert(key: K, value: V) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    /// Builds an entry that removes `key`.
    pub fn removal(key: K) -> Self {
        Self { key, value: None }
    }

    /// Builds an entry from a key and an optional value, following the
    /// `addData(key, value)` convention where `value = None` means delete.
    pub fn new(key: K, value: Option<V>) -> Self {
        Self { key, value }
    }

    /// Returns a reference to the key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns a reference to the value, or `None` if this is a removal.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Returns `true` if this entry denotes a removal.
    pub fn is_removal(&self) -> bool {
        self.value.is_none()
    }

    /// Decomposes the entry into its (key, value) parts.
    pub fn into_parts(self) -> (K, Option<V>) {
        (self.key, self.value)
    }
}

impl<K, V> From<(K, Option<V>)> for Entry<K, V> {
    fn from((key, value): (K, Option<V>)) -> Self {
        Self::new(key, value)
    }
}
