use std::future::Future;

use tokio::task::JoinHandle;

use crate::error::{CommErr, Result};

/// Typed handle over an in-flight collective operation.
///
/// Wraps the task driving the operation. Handles compose with `then`, which
/// schedules a continuation once the current operation resolves, producing a
/// single handle for the whole chain; the terminal `wait` is the only
/// blocking point.
#[derive(Debug)]
pub struct OpHandle<T> {
    task: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> OpHandle<T> {
    /// Spawns `fut` as the task backing this handle.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            task: tokio::spawn(fut),
        }
    }

    /// Creates an already-resolved handle.
    pub fn ready(value: T) -> Self {
        Self::spawn(async move { Ok(value) })
    }

    /// Creates an already-failed handle.
    pub fn failed(err: CommErr) -> Self {
        Self::spawn(async move { Err(err) })
    }

    /// Chains `continuation` to run once this operation resolves.
    ///
    /// # Arguments
    /// * `continuation` - Consumes this operation's output and yields the
    ///   next stage's future.
    ///
    /// # Returns
    /// A handle for the combined chain. Errors short-circuit: the
    /// continuation never runs if this operation failed.
    pub fn then<U, F, Fut>(self, continuation: F) -> OpHandle<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        OpHandle::spawn(async move {
            let value = join(self.task).await?;
            continuation(value).await
        })
    }

    /// Waits for the full chain behind this handle to resolve.
    ///
    /// # Returns
    /// The chain's output, or the first error raised by any stage.
    pub async fn wait(self) -> Result<T> {
        join(self.task).await
    }
}

async fn join<T>(task: JoinHandle<Result<T>>) -> Result<T> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(CommErr::CommunicationFailure {
            stage: "join",
            detail: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn then_chains_in_order() {
        let handle = OpHandle::ready(1usize)
            .then(|n| async move { Ok(n + 1) })
            .then(|n| async move { Ok(n * 10) });

        assert_eq!(handle.wait().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn errors_short_circuit() {
        use std::sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        };

        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_continuation = Arc::clone(&ran);

        let handle = OpHandle::<usize>::failed(CommErr::BucketNotReady).then(move |n| async move {
            ran_in_continuation.store(true, Ordering::SeqCst);
            Ok(n)
        });

        assert!(matches!(
            handle.wait().await.unwrap_err(),
            CommErr::BucketNotReady
        ));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
