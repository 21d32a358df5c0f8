//! The busy-lock: a reader/writer gate that blocks new entries at close
//! without putting every hot-path submission behind a write lock.

use tokio::sync::RwLock;

use crate::error::LoaderError;

/// Guards the OPEN → CLOSING → CLOSED transition.
///
/// Every mutating public operation (`addData`, `flush`) takes a
/// read-side entry via [`enter`](Self::enter); `close` takes the
/// write-side barrier exactly once via [`bar`](Self::bar), after which
/// every subsequent `enter` fails with [`LoaderError::LoaderClosed`].
/// Never upgrade a held read guard to a write guard — `bar` is only ever
/// called from `close`, which does not hold a read guard itself.
pub struct BusyLock {
    gate: RwLock<()>,
    closed: std::sync::atomic::AtomicBool,
}

/// A read-side entry permit. Holding this guarantees the loader will not
/// transition to CLOSED until it is dropped.
pub struct Entered<'a>(#[allow(dead_code)] tokio::sync::RwLockReadGuard<'a, ()>);

impl BusyLock {
    /// Creates a new, open gate.
    pub fn new() -> Self {
        Self {
            gate: RwLock::new(()),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Acquires a read-side entry, failing fast if the loader is already
    /// closed (even before contending for the lock — closing is
    /// terminal and monotonic).
    pub async fn enter(&self) -> Result<Entered<'_>, LoaderError> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(LoaderError::LoaderClosed);
        }
        let guard = self.gate.read().await;
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(LoaderError::LoaderClosed);
        }
        Ok(Entered(guard))
    }

    /// Takes the write-side barrier, waiting for every outstanding
    /// `Entered` guard to drop, then marks the gate permanently closed.
    pub async fn bar(&self) {
        let _write_guard = self.gate.write().await;
        self.closed.store(true, std::sync::atomic::Ordering::Release);
    }

    /// `true` once [`bar`](Self::bar) has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl Default for BusyLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enter_succeeds_while_open() {
        let lock = BusyLock::new();
        assert!(lock.enter().await.is_ok());
    }

    #[tokio::test]
    async fn enter_fails_after_bar() {
        let lock = BusyLock::new();
        lock.bar().await;
        assert!(matches!(lock.enter().await, Err(LoaderError::LoaderClosed)));
    }

    #[tokio::test]
    async fn bar_waits_for_outstanding_entries() {
        let lock = std::sync::Arc::new(BusyLock::new());
        let entered = lock.enter().await.unwrap();
        let lock2 = std::sync::Arc::clone(&lock);
        let bar_task = tokio::spawn(async move {
            lock2.bar().await;
        });
        tokio::task::yield_now().await;
        assert!(!lock.is_closed());
        drop(entered);
        bar_task.await.unwrap();
        assert!(lock.is_closed());
    }
}
