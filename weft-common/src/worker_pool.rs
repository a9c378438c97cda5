// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::{PENDING_FACTOR, THROTTLE_RELEASE_FACTOR};

/// Aggregated failure report for a pool run.
///
/// Individual task failures do not abort the pool. They are collected and
/// surfaced once, after every submitted task has been awaited.
#[derive(Debug, thiserror::Error)]
#[error("{} worker task(s) failed: {}", failures.len(), failures.join("; "))]
pub struct WorkerPoolError {
    pub failures: Vec<String>,
}

/// A bounded concurrent task executor.
///
/// At most `max_workers` tasks run concurrently (semaphore-gated). Submission
/// itself is unbounded; callers are expected to call [`WorkerPool::throttle`]
/// before submitting so that the number of pending (not yet completed)
/// submissions stays under `max_workers * 2`.
pub struct WorkerPool {
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<anyhow::Result<()>>,
    failures: Vec<String>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        assert!(max_workers > 0, "worker pool requires at least one worker");
        Self {
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            tasks: JoinSet::new(),
            failures: Vec::new(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Maximum number of pending submissions before `throttle` blocks.
    pub fn max_pending(&self) -> usize {
        self.max_workers * PENDING_FACTOR
    }

    /// Number of submitted tasks that have not completed yet.
    pub fn num_pending(&self) -> usize {
        self.tasks.len()
    }

    /// Submits a task. The task waits for a worker slot before running.
    pub fn submit<F>(&mut self, task: F)
    where F: Future<Output = anyhow::Result<()>> + Send + 'static {
        let semaphore = self.semaphore.clone();
        self.tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| anyhow::anyhow!("worker pool semaphore closed"))?;
            task.await
        });
    }

    /// Blocks until the pending count drops below the release threshold.
    ///
    /// Returns `true` if at least one wait was necessary, which only happens
    /// when the pending count reached `max_workers * 2`.
    pub async fn throttle(&mut self) -> bool {
        let max_pending = self.max_pending();
        if self.num_pending() < max_pending {
            return false;
        }
        let release_threshold = (max_pending as f64 * THROTTLE_RELEASE_FACTOR) as usize;
        debug!(
            pending = self.num_pending(),
            max_pending, release_threshold, "throttling-submissions"
        );
        while self.num_pending() > release_threshold {
            self.wait_for_batch(Duration::from_millis(500)).await;
        }
        true
    }

    /// Waits up to `timeout` for one task to complete.
    ///
    /// Returns `true` if a task completed within the timeout.
    pub async fn wait_for_batch(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.tasks.join_next()).await {
            Ok(Some(join_result)) => {
                self.record_outcome(join_result);
                true
            }
            Ok(None) | Err(_) => false,
        }
    }

    /// Awaits every remaining task and surfaces failures as one error.
    pub async fn wait_for_completion(&mut self) -> Result<(), WorkerPoolError> {
        while let Some(join_result) = self.tasks.join_next().await {
            self.record_outcome(join_result);
        }
        if self.failures.is_empty() {
            return Ok(());
        }
        Err(WorkerPoolError {
            failures: std::mem::take(&mut self.failures),
        })
    }

    fn record_outcome(&mut self, join_result: Result<anyhow::Result<()>, tokio::task::JoinError>) {
        match join_result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => self.failures.push(format!("{error:#}")),
            Err(join_error) => self.failures.push(format!("task panicked: {join_error}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_worker_pool_runs_all_tasks() {
        let mut pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait_for_completion().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn test_worker_pool_caps_concurrency() {
        let max_workers = 3;
        let mut pool = WorkerPool::new(max_workers);
        let running = Arc::new(AtomicUsize::new(0));
        let high_watermark = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let running = running.clone();
            let high_watermark = high_watermark.clone();
            pool.submit(async move {
                let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
                high_watermark.fetch_max(now_running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait_for_completion().await.unwrap();
        assert!(high_watermark.load(Ordering::SeqCst) <= max_workers);
    }

    #[tokio::test]
    async fn test_worker_pool_throttles_past_two_times_workers() {
        let max_workers = 2;
        let mut pool = WorkerPool::new(max_workers);
        let num_entities = max_workers * PENDING_FACTOR + 1;
        let mut throttled = false;
        for _ in 0..num_entities {
            throttled |= pool.throttle().await;
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(())
            });
        }
        assert!(throttled, "expected at least one throttled submission");
        pool.wait_for_completion().await.unwrap();
        assert_eq!(pool.num_pending(), 0);
    }

    #[tokio::test]
    async fn test_worker_pool_aggregates_failures() {
        let mut pool = WorkerPool::new(2);
        for i in 0..4 {
            pool.submit(async move {
                if i % 2 == 0 {
                    anyhow::bail!("task {i} failed")
                }
                Ok(())
            });
        }
        let error = pool.wait_for_completion().await.unwrap_err();
        assert_eq!(error.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_batch_times_out_when_idle() {
        let mut pool = WorkerPool::new(2);
        assert!(!pool.wait_for_batch(Duration::from_millis(10)).await);
    }
}
