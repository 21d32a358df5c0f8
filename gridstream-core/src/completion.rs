//! The completion (promise) primitive used throughout the loader.
//!
//! A [`Completion`] is resolved exactly once and may be observed by many
//! listeners: the caller awaiting `addData`, the Loader Engine's own
//! remap bookkeeping, and `flush()` callers all attach to the same
//! underlying value without consuming it. This mirrors the source
//! system's "attach a listener to a future" style, re-expressed as a
//! cheaply cloneable [`futures::future::Shared`] future built on top of
//! a [`tokio::sync::oneshot`] channel.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

/// A promise-like handle resolved exactly once with a value of type `T`.
///
/// Cloning a `Completion` is cheap (an `Arc` bump under the hood) and
/// every clone observes the same resolved value. `Completion` itself
/// implements [`Future`], so callers can simply `.await` it.
pub struct Completion<T>(Shared<BoxFuture<'static, T>>);

impl<T: Clone> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Builds a completion that is already resolved with `value`.
    pub fn ready(value: T) -> Self {
        Self(futures::future::ready(value).boxed().shared())
    }

    /// Registers `listener` to run once this completion resolves.
    ///
    /// The listener runs on a detached task; it must not assume it runs
    /// synchronously with resolution, and must be side-effect-free with
    /// respect to whatever lock protected the value being resolved here.
    pub fn then<F>(&self, listener: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let fut = self.0.clone();
        tokio::spawn(async move {
            let value = fut.await;
            listener(value);
        });
    }
}

impl<T: Clone + Send + 'static> Future for Completion<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        Pin::new(&mut self.get_mut().0).poll(cx)
    }
}

/// The writable side of a [`Completion`]; resolves it exactly once.
///
/// Dropping a `CompletionSource` without calling [`resolve`](Self::resolve)
/// resolves the completion with the fallback value produced by the
/// closure supplied to [`channel`].
pub struct CompletionSource<T> {
    sender: Option<oneshot::Sender<T>>,
}

impl<T: Clone + Send + 'static> CompletionSource<T> {
    /// Resolves the completion with `value`. A second call is a no-op;
    /// only the first resolution is observed by listeners.
    pub fn resolve(&mut self, value: T) {
        if let Some(sender) = self.sender.take() {
            // Ignore send errors: it just means no one is awaiting this completion.
            let _ = sender.send(value);
        }
    }

    /// Returns `true` if this source has not yet resolved its completion.
    pub fn is_pending(&self) -> bool {
        self.sender.is_some()
    }
}

/// Creates a linked [`CompletionSource`] / [`Completion`] pair.
///
/// `on_abandoned` supplies the value observed by listeners if the source
/// is dropped without ever calling `resolve` (e.g. a panic unwinds past
/// it) — every completion in this crate always resolves to *something*.
pub fn channel<T, F>(on_abandoned: F) -> (CompletionSource<T>, Completion<T>)
where
    T: Clone + Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let fut: BoxFuture<'static, T> = Box::pin(async move {
        match rx.await {
            Ok(value) => value,
            Err(_recv_error) => on_abandoned(),
        }
    });
    (
        CompletionSource { sender: Some(tx) },
        Completion(fut.shared()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once_to_all_clones() {
        let (mut source, completion) = channel(|| -1);
        let clone_a = completion.clone();
        let clone_b = completion.clone();
        source.resolve(42);
        assert_eq!(clone_a.await, 42);
        assert_eq!(clone_b.await, 42);
    }

    #[tokio::test]
    async fn then_listener_observes_the_value() {
        let (mut source, completion) = channel(|| 0);
        let (notify_tx, notify_rx) = oneshot::channel();
        completion.then(move |value| {
            let _ = notify_tx.send(value);
        });
        source.resolve(7);
        assert_eq!(notify_rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn abandoned_source_resolves_to_fallback() {
        let (source, completion) = channel(|| "abandoned");
        drop(source);
        assert_eq!(completion.await, "abandoned");
    }

    #[tokio::test]
    async fn ready_is_immediately_resolved() {
        let completion = Completion::ready(5);
        assert_eq!(completion.await, 5);
    }
}
