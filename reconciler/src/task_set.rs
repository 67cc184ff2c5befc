// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded pool of reconciliation workers

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::task::JoinSet;

/// A collection of tokio tasks which execute in parallel, up to a fixed
/// number at a time
///
/// Tasks are spawned on a [JoinSet] right away, but each one waits for a
/// permit before doing any work.  This bounds how many agents a single
/// reconciliation cycle talks to at once, no matter how many records it
/// loaded.
pub struct ParallelTaskSet<T> {
    semaphore: Arc<Semaphore>,
    set: JoinSet<T>,
}

impl<T: 'static + Send> ParallelTaskSet<T> {
    /// Creates a new [ParallelTaskSet] that runs at most `max_parallelism`
    /// tasks at a time
    ///
    /// `max_parallelism` is clamped to at least 1.
    pub fn new_with_parallelism(max_parallelism: usize) -> ParallelTaskSet<T> {
        let semaphore = Arc::new(Semaphore::new(max_parallelism.max(1)));
        ParallelTaskSet { semaphore, set: JoinSet::new() }
    }

    /// Spawn a task immediately, but only allow it to execute if the task
    /// set is within the maximum parallelism constraint.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.set.spawn(async move {
            // The semaphore is never closed, so this only fails if that
            // changes.  Hold onto the permit until the task finishes.
            let _permit = semaphore.acquire_owned().await.ok();
            task.await
        });
    }

    /// Returns the number of tasks not yet joined
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Waits for the next task to complete and returns its output
    ///
    /// Returns `None` once every task has been joined.
    pub async fn join_next(&mut self) -> Option<Result<T, JoinError>> {
        self.set.join_next().await
    }

    /// Wait for every task and return their outputs, in completion order
    pub async fn join_all(mut self) -> Vec<Result<T, JoinError>> {
        let mut outputs = Vec::with_capacity(self.set.len());
        while let Some(output) = self.set.join_next().await {
            outputs.push(output);
        }
        outputs
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_many() {
        let count = Arc::new(AtomicUsize::new(0));

        let task_limit = 16;
        let mut set = ParallelTaskSet::new_with_parallelism(task_limit);

        for i in 0..task_limit * 10 {
            set.spawn({
                let count = count.clone();
                async move {
                    // How many tasks - including our own - are running right
                    // now?
                    let watermark = count.fetch_add(1, Ordering::SeqCst) + 1;

                    // The tasks should all execute for a short but variable
                    // amount of time.
                    let duration_ms = (i % 10) as u64;
                    tokio::time::sleep(Duration::from_millis(duration_ms))
                        .await;

                    count.fetch_sub(1, Ordering::SeqCst);

                    watermark
                }
            });
        }
        assert_eq!(set.len(), task_limit * 10);

        let watermarks = set.join_all().await;
        assert_eq!(watermarks.len(), task_limit * 10);
        for (i, watermark) in watermarks.into_iter().enumerate() {
            let watermark = watermark.unwrap();
            assert!(
                watermark <= task_limit,
                "Observed simultaneous task execution of {watermark} tasks \
                 on the {i}-th worker"
            );
        }
    }

    #[tokio::test]
    async fn test_zero_parallelism_still_runs() {
        let mut set = ParallelTaskSet::new_with_parallelism(0);
        set.spawn(async { 7 });
        assert_eq!(set.join_next().await.unwrap().unwrap(), 7);
        assert!(set.join_next().await.is_none());
        assert!(set.is_empty());
    }
}
