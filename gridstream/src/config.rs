//! Loader configuration and its typestate builder.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use gridstream_core::CacheName;

use crate::updater::Updater;

/// Default remap budget: a batch fails after exactly this many
/// remap attempts.
pub const DEFAULT_MAX_REMAPS: u32 = 32;

/// Resolved, immutable configuration for one [`Loader`](crate::Loader).
#[derive(Clone)]
pub struct LoaderConfig {
    pub(crate) cache_name: CacheName,
    pub(crate) buf_size: usize,
    pub(crate) parallel_ops: usize,
    pub(crate) auto_flush_freq: Duration,
    pub(crate) max_remaps: u32,
    pub(crate) allow_overwrite: bool,
}

impl LoaderConfig {
    /// Name of the cache this loader bulk-loads into.
    pub fn cache_name(&self) -> &CacheName {
        &self.cache_name
    }

    /// Configured per-node buffer capacity.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Configured per-node parallel load operation cap.
    pub fn parallel_ops(&self) -> usize {
        self.parallel_ops
    }

    /// Auto-flush period; `Duration::ZERO` means disabled.
    pub fn auto_flush_freq(&self) -> Duration {
        self.auto_flush_freq
    }

    /// Maximum remap recursions per original caller batch.
    pub fn max_remaps(&self) -> u32 {
        self.max_remaps
    }

    /// Whether duplicate keys within one `pending` buffer coalesce to
    /// last-write-wins before submission.
    pub fn allow_overwrite(&self) -> bool {
        self.allow_overwrite
    }
}

/// Marker type for the not-yet-set `updater` typestate field.
///
/// When you see `NotSet` in a compiler error on [`LoaderBuilder::build`],
/// it means [`LoaderBuilder::updater`] hasn't been called yet — `updater`
/// is the one field that must be non-null.
pub struct NotSet;

/// Builder for [`Loader`](crate::Loader).
///
/// Every field except `updater` has a sane default; `updater` is
/// enforced via the typestate parameter `U`, matching the "must be set"
/// fields pattern used by the ambient configuration stack elsewhere in
/// this workspace.
pub struct LoaderBuilder<K, V, U = NotSet> {
    cache_name: CacheName,
    buf_size: usize,
    parallel_ops: usize,
    auto_flush_freq: Duration,
    max_remaps: u32,
    allow_overwrite: bool,
    updater: U,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> LoaderBuilder<K, V, NotSet> {
    /// Creates a new builder for a loader bulk-loading into `cache_name`.
    pub fn new(cache_name: impl Into<CacheName>) -> Self {
        Self {
            cache_name: cache_name.into(),
            buf_size: 512,
            parallel_ops: 1,
            auto_flush_freq: Duration::ZERO,
            max_remaps: DEFAULT_MAX_REMAPS,
            allow_overwrite: true,
            updater: NotSet,
            _marker: PhantomData,
        }
    }
}

impl<K, V, U> LoaderBuilder<K, V, U> {
    /// Sets `bufSize`. Panics if `n == 0`.
    pub fn per_node_buffer_size(mut self, n: usize) -> Self {
        assert!(n > 0, "per_node_buffer_size must be > 0");
        self.buf_size = n;
        self
    }

    /// Sets `parallelOps`. Panics if `n == 0`.
    pub fn per_node_parallel_load_operations(mut self, n: usize) -> Self {
        assert!(n > 0, "per_node_parallel_load_operations must be > 0");
        self.parallel_ops = n;
        self
    }

    /// Sets the auto-flush period. `Duration::ZERO` disables it.
    pub fn auto_flush_frequency(mut self, freq: Duration) -> Self {
        self.auto_flush_freq = freq;
        self
    }

    /// Overrides the default remap budget.
    pub fn max_remaps(mut self, n: u32) -> Self {
        self.max_remaps = n;
        self
    }

    /// Overrides the default `allowOverwrite` flag.
    pub fn allow_overwrite(mut self, allow: bool) -> Self {
        self.allow_overwrite = allow;
        self
    }

    /// Sets the server-side updater. Required before [`build`](Self::build).
    pub fn updater<NewU>(self, updater: NewU) -> LoaderBuilder<K, V, NewU>
    where
        NewU: Updater<K, V> + 'static,
    {
        LoaderBuilder {
            cache_name: self.cache_name,
            buf_size: self.buf_size,
            parallel_ops: self.parallel_ops,
            auto_flush_freq: self.auto_flush_freq,
            max_remaps: self.max_remaps,
            allow_overwrite: self.allow_overwrite,
            updater,
            _marker: PhantomData,
        }
    }
}

impl<K, V, U> LoaderBuilder<K, V, U>
where
    U: Updater<K, V> + 'static,
{
    /// Consumes the builder, producing the resolved config and the
    /// type-erased updater the [`Loader`](crate::Loader) will hold.
    pub(crate) fn into_parts(self) -> (LoaderConfig, Arc<dyn Updater<K, V>>) {
        let config = LoaderConfig {
            cache_name: self.cache_name,
            buf_size: self.buf_size,
            parallel_ops: self.parallel_ops,
            auto_flush_freq: self.auto_flush_freq,
            max_remaps: self.max_remaps,
            allow_overwrite: self.allow_overwrite,
        };
        (config, Arc::new(self.updater))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopUpdater;

    #[async_trait::async_trait]
    impl Updater<String, i32> for NoopUpdater {
        async fn apply(
            &self,
            _entries: Vec<gridstream_core::Entry<String, i32>>,
        ) -> Result<(), crate::updater::UpdaterError> {
            Ok(())
        }
    }

    #[test]
    fn defaults_are_sane() {
        let (config, _updater) = LoaderBuilder::<String, i32, _>::new("orders")
            .updater(NoopUpdater)
            .into_parts();
        assert_eq!(config.buf_size(), 512);
        assert_eq!(config.parallel_ops(), 1);
        assert_eq!(config.auto_flush_freq(), Duration::ZERO);
        assert_eq!(config.max_remaps(), DEFAULT_MAX_REMAPS);
        assert!(config.allow_overwrite());
    }

    #[test]
    #[should_panic(expected = "must be > 0")]
    fn rejects_zero_buffer_size() {
        let _ = LoaderBuilder::<String, i32, NotSet>::new("orders").per_node_buffer_size(0);
    }
}
