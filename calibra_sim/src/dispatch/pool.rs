//! In-process rayon pool.
//!
//! `Static` hands each thread one contiguous slice of the batch; `Dynamic`
//! lets idle threads steal single tasks, which pays off when task cost
//! varies a lot between parameter draws.

use super::{contiguous_chunks, DispatchError, Dispatcher, Progress, TaskPayload};
use calibra_core::config::Distribution;
use calibra_core::{TaskOutcome, TaskWorker};
use calibra_env::threading;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use tracing::debug;

pub struct LocalPoolDispatcher {
    pool: ThreadPool,
    workers: usize,
    distribution: Distribution,
    progress_every: usize,
}

impl LocalPoolDispatcher {
    pub fn new(
        workers: usize,
        distribution: Distribution,
        progress_every: usize,
    ) -> Result<Self, DispatchError> {
        // Before any pool thread exists
        threading::pin_single_thread();

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("calibra-worker-{}", i))
            .start_handler(|_| {
                threading::pin_single_thread();
            })
            .build()
            .map_err(|e| DispatchError::Setup(e.to_string()))?;

        debug!("Local pool ready: {} threads, {:?}", workers, distribution);
        Ok(Self {
            pool,
            workers,
            distribution,
            progress_every,
        })
    }
}

impl Dispatcher for LocalPoolDispatcher {
    fn execute(
        &self,
        payloads: &[TaskPayload],
        worker: Arc<dyn TaskWorker>,
    ) -> Result<Vec<TaskOutcome>, DispatchError> {
        let progress = Progress::new(self.progress_every, payloads.len());
        let run = |p: &TaskPayload| {
            let outcome = worker.run_task(p.sim_id);
            progress.tick();
            outcome
        };

        let outcomes: Vec<TaskOutcome> = self.pool.install(|| match self.distribution {
            Distribution::Static => contiguous_chunks(payloads, self.workers)
                .into_par_iter()
                .map(|chunk| chunk.iter().map(&run).collect::<Vec<_>>())
                .collect::<Vec<_>>()
                .into_iter()
                .flatten()
                .collect(),
            Distribution::Dynamic => payloads.par_iter().with_max_len(1).map(&run).collect(),
        });
        Ok(outcomes)
    }

    fn name(&self) -> &str {
        "local_pool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::test_support::{payloads, FakeWorker};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_both_distributions_keep_order() {
        for distribution in [Distribution::Static, Distribution::Dynamic] {
            let worker = Arc::new(FakeWorker::new(7));
            let dispatcher = LocalPoolDispatcher::new(3, distribution, 0).unwrap();
            let input = payloads(1..=50);

            let outcomes = dispatcher.execute(&input, worker.clone()).unwrap();

            let ids: Vec<u64> = outcomes.iter().map(|o| o.sim_id).collect();
            assert_eq!(ids, (1..=50).collect::<Vec<_>>());
            assert_eq!(worker.calls.load(Ordering::SeqCst), 50);
            assert_eq!(outcomes.iter().filter(|o| !o.success).count(), 7);
        }
    }

    #[test]
    fn test_pool_threads_are_pinned() {
        let dispatcher = LocalPoolDispatcher::new(2, Distribution::Dynamic, 0).unwrap();
        let pinned = dispatcher.pool.install(threading::is_single_threaded);
        assert!(pinned);
    }

    #[test]
    fn test_empty_batch() {
        let dispatcher = LocalPoolDispatcher::new(2, Distribution::Static, 0).unwrap();
        let outcomes = dispatcher
            .execute(&[], Arc::new(FakeWorker::new(0)))
            .unwrap();
        assert!(outcomes.is_empty());
    }
}
