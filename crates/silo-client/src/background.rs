//! Background execution of whole batches.
//!
//! The worker pool is the process-wide multi-threaded runtime; a
//! `BackgroundOperation` is a handle to one unit of work scheduled on it.

use std::future::Future;
use tokio::task::JoinHandle;

/// A unit of work running on the shared worker pool.
///
/// Dropping the handle detaches the work; it keeps running to completion.
pub struct BackgroundOperation<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> BackgroundOperation<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Block the caller until the work completes and yield its result.
    pub async fn wait(self) -> T {
        self.handle
            .await
            .expect("background operation panicked")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn wait_returns_the_result() {
        let op = BackgroundOperation::spawn(async { 40 + 2 });
        assert_eq!(op.wait().await, 42);
    }

    #[tokio::test]
    async fn detached_work_still_runs() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        drop(BackgroundOperation::spawn(async move {
            tx.send(7).ok();
        }));
        assert_eq!(rx.await.unwrap(), 7);
    }
}
