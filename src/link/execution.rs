//! Execution models
//!
//! The sessions are written once as async state machines. What differs
//! between the blocking and the cooperative variants is how they wait and
//! where blocking radio or sensor calls run, which is all this trait covers.

use crate::domain::error::{LinkError, Result};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait ExecutionModel: Send + Sync + 'static {
    /// Short label for logs.
    const NAME: &'static str;

    async fn pause(&self, duration: Duration);

    /// Run a blocking job and hand back its result.
    async fn offload<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static;
}

/// Everything runs on the caller's thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blocking;

#[async_trait]
impl ExecutionModel for Blocking {
    const NAME: &'static str = "blocking";

    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }

    async fn offload<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Ok(job())
    }
}

/// Tokio timers for waits, the blocking pool for radio calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cooperative;

#[async_trait]
impl ExecutionModel for Cooperative {
    const NAME: &'static str = "cooperative";

    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn offload<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| LinkError::Worker(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;
    use std::time::Instant;

    #[test]
    fn test_blocking_runs_inline() {
        let caller = std::thread::current().id();
        let ran_on = futures::executor::block_on(Blocking.offload(|| std::thread::current().id()))
            .unwrap();
        assert_eq!(ran_on, caller);
    }

    #[test]
    fn test_blocking_pause_sleeps() {
        let started = Instant::now();
        futures::executor::block_on(Blocking.pause(Duration::from_millis(15)));
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cooperative_offloads_to_worker() {
        let value = Cooperative.offload(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cooperative_panic_becomes_worker_error() {
        let err = Cooperative
            .offload(|| -> u8 { panic!("radio driver crashed") })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Worker);
    }
}
