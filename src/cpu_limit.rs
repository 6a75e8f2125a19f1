//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Limits how many CPU-heavy external processes (`pdftocairo`, `tesseract`)
/// and blocking image jobs run at once.
///
/// Cloning shares the same pool of permits.
#[derive(Clone, Debug)]
pub struct CpuLimit {
    semaphore: Arc<Semaphore>,
    permits: usize,
}

impl CpuLimit {
    /// Allow up to `permits` tasks at once. Zero is treated as one.
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    /// The maximum number of concurrent tasks.
    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Call an async function while holding a permit.
    ///
    /// Each external process we run this way should use about one core, so
    /// the number of busy cores stays close to [`CpuLimit::permits`].
    #[instrument(level = "trace", skip_all)]
    pub async fn run<Func, Fut, R>(&self, f: Func) -> Result<R>
    where
        Func: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let permit = self
            .semaphore
            .acquire()
            .await
            .context("Could not acquire CPU permit")?;
        let result = f().await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::future::join_all;

    use super::*;

    #[tokio::test]
    async fn never_exceeds_permits() -> Result<()> {
        let limit = CpuLimit::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..8).map(|_| {
            let limit = limit.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                limit
                    .run(|| async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }
        });
        for result in join_all(tasks).await {
            result?;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn zero_permits_means_one() {
        assert_eq!(CpuLimit::new(0).permits(), 1);
    }
}
