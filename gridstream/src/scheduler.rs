//! The Flush Scheduler: a single process-wide background task that
//! drives auto-flush across every loader currently enlisted.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

/// Something the scheduler can periodically, best-effort flush.
///
/// `gridstream` implements this for the Loader Engine; it is a trait
/// (rather than a concrete type) so the scheduler can hold loaders of
/// different key/value types in one process-wide map.
#[async_trait]
pub trait Flushable: Send + Sync {
    /// Flushes whatever is currently pending, swallowing errors. Must
    /// not block on requests already inflight.
    async fn try_flush(&self);
}

/// How often the scheduler wakes to check which enlisted loaders are due.
///
/// Not itself `autoFlushFreq` — an individual loader's own frequency can
/// be (and usually is) much larger; this is just the queue's own
/// polling granularity.
const TICK: Duration = Duration::from_millis(50);

struct Enlisted {
    flushable: Arc<dyn Flushable>,
    freq: Duration,
    last_flush: std::sync::Mutex<Instant>,
}

/// Process-wide auto-flush driver.
///
/// Loaders enlist on construction (if `autoFlushFreq > 0`) and delist on
/// close, or whenever `autoFlushFrequency` is reconfigured to `0`.
/// Reconfiguring to a new nonzero value takes effect at the next tick
/// rather than requiring re-enlistment bookkeeping.
pub struct FlushScheduler {
    entries: DashMap<u64, Enlisted>,
}

static GLOBAL: OnceLock<Arc<FlushScheduler>> = OnceLock::new();

impl FlushScheduler {
    /// Returns the single, lazily started scheduler for this process.
    pub fn global() -> Arc<FlushScheduler> {
        Arc::clone(GLOBAL.get_or_init(FlushScheduler::new))
    }

    /// Starts a new, independent scheduler with its own background task.
    /// Most callers want [`global`](Self::global); this exists for tests
    /// and for embedding multiple isolated loader groups in one process.
    pub fn new() -> Arc<FlushScheduler> {
        let scheduler = Arc::new(FlushScheduler {
            entries: DashMap::new(),
        });
        let background = Arc::clone(&scheduler);
        tokio::spawn(async move { background.run().await });
        scheduler
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(TICK);
        loop {
            ticker.tick().await;
            let due: Vec<Arc<dyn Flushable>> = self
                .entries
                .iter()
                .filter_map(|entry| {
                    let mut last_flush = entry.value().last_flush.lock().unwrap();
                    if last_flush.elapsed() >= entry.value().freq {
                        *last_flush = Instant::now();
                        Some(Arc::clone(&entry.value().flushable))
                    } else {
                        None
                    }
                })
                .collect();
            for flushable in due {
                tokio::spawn(async move { flushable.try_flush().await });
            }
        }
    }

    /// Enlists `flushable` under `id`, to be ticked every `freq`.
    /// Replaces any previous enlistment under the same id.
    pub fn enlist(&self, id: u64, flushable: Arc<dyn Flushable>, freq: Duration) {
        self.entries.insert(
            id,
            Enlisted {
                flushable,
                freq,
                last_flush: std::sync::Mutex::new(Instant::now()),
            },
        );
    }

    /// Removes `id` from the schedule. A no-op if not enlisted.
    pub fn delist(&self, id: u64) {
        self.entries.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFlushable(Arc<AtomicUsize>);

    #[async_trait]
    impl Flushable for CountingFlushable {
        async fn try_flush(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_enlisted_flushables_at_their_own_frequency() {
        let scheduler = FlushScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.enlist(
            9001,
            Arc::new(CountingFlushable(Arc::clone(&count))),
            Duration::from_millis(100),
        );
        tokio::time::advance(Duration::from_millis(260)).await;
        tokio::task::yield_now().await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        scheduler.delist(9001);
    }
}
