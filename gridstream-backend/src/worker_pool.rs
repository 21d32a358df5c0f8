//! Local worker pool: runs the updater in-process for same-node batches.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::LocalExecError;

/// Runs work on a shared thread pool the loader does not own.
///
/// When a batch's destination happens to be the local node, the Per-Node
/// Buffer skips the network entirely and calls `call_local_safe` instead
/// of marshalling a `LoadRequest`: the "same-node optimization" in the
/// data model. The caller already has the typed updater in hand (no
/// peer class loading is needed for a local call), so it builds `task`
/// itself; `WorkerPool` only decides *where* that task runs.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Runs `task` to completion and returns its result.
    ///
    /// `use_system_pool` mirrors the source's distinction between the
    /// system pool (small, latency-sensitive) and the public pool (bulk
    /// I/O); a pool implementation is free to treat both the same.
    async fn call_local_safe(
        &self,
        task: BoxFuture<'static, Result<(), LocalExecError>>,
        use_system_pool: bool,
    ) -> Result<(), LocalExecError>;
}

/// Runs the task on the caller's own async task via [`tokio::spawn`].
///
/// The default choice: tokio's runtime already is the shared worker
/// pool the loader does not own, so there is usually nothing further
/// to dispatch through.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioWorkerPool;

#[async_trait]
impl WorkerPool for TokioWorkerPool {
    async fn call_local_safe(
        &self,
        task: BoxFuture<'static, Result<(), LocalExecError>>,
        _use_system_pool: bool,
    ) -> Result<(), LocalExecError> {
        match tokio::spawn(task).await {
            Ok(result) => result,
            Err(join_error) => Err(LocalExecError::Application(bytes::Bytes::from(
                join_error.to_string(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_the_task_and_returns_its_result() {
        let pool = TokioWorkerPool;
        let result = pool
            .call_local_safe(Box::pin(async { Ok(()) }), true)
            .await;
        assert!(result.is_ok());
    }
}
