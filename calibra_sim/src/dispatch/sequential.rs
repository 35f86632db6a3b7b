//! In-order execution on the calling thread.

use super::{DispatchError, Dispatcher, Progress, TaskPayload};
use calibra_core::{TaskOutcome, TaskWorker};
use std::sync::Arc;

pub struct SequentialDispatcher {
    progress_every: usize,
}

impl SequentialDispatcher {
    pub fn new(progress_every: usize) -> Self {
        Self { progress_every }
    }
}

impl Dispatcher for SequentialDispatcher {
    fn execute(
        &self,
        payloads: &[TaskPayload],
        worker: Arc<dyn TaskWorker>,
    ) -> Result<Vec<TaskOutcome>, DispatchError> {
        let progress = Progress::new(self.progress_every, payloads.len());
        Ok(payloads
            .iter()
            .map(|p| {
                let outcome = worker.run_task(p.sim_id);
                progress.tick();
                outcome
            })
            .collect())
    }

    fn name(&self) -> &str {
        "sequential"
    }
}
