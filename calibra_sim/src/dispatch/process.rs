//! Pool of `calibra-sim worker` child processes.
//!
//! The batch is split into one contiguous chunk per worker. Each child gets
//! its chunk as a JSON payload file, starts single-threaded, and prints its
//! outcomes as JSON on stdout. A child that crashes or prints garbage fails
//! exactly the tasks of its chunk.

use super::{align_outcomes, contiguous_chunks, ChunkPayload, DispatchError, Dispatcher, TaskPayload};
use calibra_core::storage;
use calibra_core::{TaskOutcome, TaskWorker};
use calibra_env::threading;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ProcessPoolDispatcher {
    program: PathBuf,
    workers: usize,
    staging_dir: PathBuf,
}

impl ProcessPoolDispatcher {
    pub fn new(program: PathBuf, workers: usize, staging_dir: PathBuf) -> Self {
        Self {
            program,
            workers,
            staging_dir,
        }
    }

    fn spawn(&self, payload_path: &std::path::Path) -> std::io::Result<Child> {
        Command::new(&self.program)
            .arg("worker")
            .arg("--payload")
            .arg(payload_path)
            .envs(threading::single_thread_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
    }
}

enum Launched {
    Running(Child),
    Failed(String),
}

impl Dispatcher for ProcessPoolDispatcher {
    fn execute(
        &self,
        payloads: &[TaskPayload],
        _worker: Arc<dyn TaskWorker>,
    ) -> Result<Vec<TaskOutcome>, DispatchError> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let chunks = contiguous_chunks(payloads, self.workers);

        // Start every child before waiting on any of them
        let mut launched = Vec::with_capacity(chunks.len());
        let mut payload_files = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let path = self.staging_dir.join(format!(
                "chunk_{}_{:04}.json",
                std::process::id(),
                index
            ));
            storage::write_json_atomic(&path, &ChunkPayload::new(chunk))
                .map_err(|e| DispatchError::Setup(e.to_string()))?;
            let child = match self.spawn(&path) {
                Ok(child) => Launched::Running(child),
                Err(e) => Launched::Failed(format!("cannot start {}: {}", self.program.display(), e)),
            };
            launched.push(child);
            payload_files.push(path);
        }
        debug!("Started {} worker processes", launched.len());

        let mut outcomes = Vec::with_capacity(payloads.len());
        for (chunk, child) in chunks.iter().zip(launched) {
            match collect(child) {
                Ok(chunk_outcomes) => outcomes.extend(chunk_outcomes),
                Err(reason) => {
                    warn!(
                        "Worker for sims {}..={} failed: {}",
                        chunk.first().map_or(0, |p| p.sim_id),
                        chunk.last().map_or(0, |p| p.sim_id),
                        reason
                    );
                    outcomes.extend(chunk.iter().map(|p| TaskOutcome::failed(p.sim_id, &reason)));
                }
            }
        }

        for path in payload_files {
            let _ = std::fs::remove_file(path);
        }
        Ok(align_outcomes(payloads, outcomes))
    }

    fn name(&self) -> &str {
        "process_pool"
    }
}

fn collect(child: Launched) -> Result<Vec<TaskOutcome>, String> {
    let child = match child {
        Launched::Running(child) => child,
        Launched::Failed(reason) => return Err(reason),
    };
    let output = child.wait_with_output().map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(format!("worker exited with {}", output.status));
    }
    serde_json::from_slice(&output.stdout).map_err(|e| format!("unreadable worker output: {}", e))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::dispatch::test_support::{payloads, FakeWorker};

    #[test]
    fn test_missing_program_fails_every_task() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ProcessPoolDispatcher::new(
            dir.path().join("no-such-binary"),
            2,
            dir.path().join("staging"),
        );
        let outcomes = dispatcher
            .execute(&payloads(1..=5), Arc::new(FakeWorker::new(0)))
            .unwrap();

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| !o.success));
        assert!(outcomes[0].error.as_deref().unwrap().contains("cannot start"));
    }

    #[test]
    fn test_crashing_child_fails_its_chunk() {
        let dir = tempfile::tempdir().unwrap();
        // `false` ignores its arguments and exits 1
        let dispatcher =
            ProcessPoolDispatcher::new(PathBuf::from("false"), 1, dir.path().join("staging"));
        let outcomes = dispatcher
            .execute(&payloads([4, 9]), Arc::new(FakeWorker::new(0)))
            .unwrap();

        let ids: Vec<u64> = outcomes.iter().map(|o| o.sim_id).collect();
        assert_eq!(ids, vec![4, 9]);
        assert!(outcomes.iter().all(|o| o.error.as_deref().unwrap().contains("exited")));
        // Payload files are cleaned up
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }
}
