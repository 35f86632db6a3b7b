//! Remote batch-scheduler backend.
//!
//! The batch is cut into chunks of `chunk_size` tasks; each chunk becomes
//! one cluster job running `calibra-sim worker --payload <file>`. The job
//! writes its outcomes into the staging directory, and the backend polls
//! job status until every job is terminal or the wall-clock budget runs
//! out. Failure is per job: a job that fails, times out or leaves no
//! readable outcome file fails every task it carried.

use super::{align_outcomes, ChunkPayload, DispatchError, Dispatcher, TaskPayload};
use calibra_core::storage;
use calibra_core::{TaskOutcome, TaskWorker};
use calibra_env::{threading, ClusterClient, EnvError, JobHandle, JobId, JobSpec, JobStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct RemoteDispatcher {
    client: Arc<dyn ClusterClient>,
    program: PathBuf,
    staging_dir: PathBuf,
    chunk_size: usize,
    poll_interval: Duration,
    wall_clock: Duration,
    memory_mb: u64,
}

/// One submitted chunk.
struct Job<'a> {
    tasks: &'a [TaskPayload],
    payload_path: PathBuf,
    handle: Option<JobHandle>,
    outcomes: Option<Vec<TaskOutcome>>,
}

impl<'a> Job<'a> {
    fn fail(&mut self, reason: &str) {
        self.outcomes = Some(
            self.tasks
                .iter()
                .map(|p| TaskOutcome::failed(p.sim_id, reason))
                .collect(),
        );
    }

    fn is_done(&self) -> bool {
        self.outcomes.is_some()
    }
}

impl RemoteDispatcher {
    pub fn new(client: Arc<dyn ClusterClient>, program: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            client,
            program,
            staging_dir,
            chunk_size: 50,
            poll_interval: Duration::from_secs(10),
            wall_clock: Duration::from_secs(24 * 3600),
            memory_mb: 512,
        }
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wall_clock(mut self, budget: Duration) -> Self {
        self.wall_clock = budget;
        self
    }

    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Submits, polls and collects one batch.
    pub async fn run_jobs(&self, payloads: &[TaskPayload]) -> Result<Vec<TaskOutcome>, DispatchError> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let mut jobs = Vec::new();
        for tasks in payloads.chunks(self.chunk_size) {
            jobs.push(self.submit(tasks).await?);
        }
        info!(
            "Submitted {} jobs to {} ({} tasks)",
            jobs.iter().filter(|j| j.handle.is_some()).count(),
            self.client.name(),
            payloads.len()
        );

        let deadline = Instant::now() + self.wall_clock;
        loop {
            for job in jobs.iter_mut().filter(|j| !j.is_done()) {
                self.poll(job).await;
            }
            let pending = jobs.iter().filter(|j| !j.is_done()).count();
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("{} jobs still running after {}s; failing them", pending, self.wall_clock.as_secs());
                let reason = EnvError::Timeout(self.wall_clock.as_secs()).to_string();
                for job in jobs.iter_mut().filter(|j| !j.is_done()) {
                    job.fail(&reason);
                }
                break;
            }
            debug!("{} jobs pending", pending);
            tokio::time::sleep(self.poll_interval.min(deadline - Instant::now())).await;
        }

        let mut outcomes = Vec::with_capacity(payloads.len());
        for job in jobs {
            let _ = tokio::fs::remove_file(&job.payload_path).await;
            if let Some(handle) = &job.handle {
                let _ = tokio::fs::remove_file(&handle.outcome_path).await;
            }
            outcomes.extend(job.outcomes.unwrap_or_default());
        }
        Ok(align_outcomes(payloads, outcomes))
    }

    async fn submit<'a>(&self, tasks: &'a [TaskPayload]) -> Result<Job<'a>, DispatchError> {
        let job_id = JobId::new();
        let payload_path = self.staging_dir.join(format!("payload_{}.json", job_id));
        let outcome_path = self.staging_dir.join(format!("outcome_{}.json", job_id));

        let chunk = ChunkPayload::new(tasks).with_outcome_path(outcome_path.clone());
        storage::write_json_atomic(&payload_path, &chunk)
            .map_err(|e| DispatchError::Setup(e.to_string()))?;

        let first = tasks.first().map_or(0, |p| p.sim_id);
        let last = tasks.last().map_or(0, |p| p.sim_id);
        let spec = JobSpec {
            job_id,
            name: format!("calibra_{}_{}", first, last),
            command: vec![
                self.program.display().to_string(),
                "worker".into(),
                "--payload".into(),
                payload_path.display().to_string(),
            ],
            env: threading::single_thread_env(),
            outcome_path,
            wall_clock_secs: self.wall_clock.as_secs(),
            memory_mb: self.memory_mb,
        };

        let mut job = Job {
            tasks,
            payload_path,
            handle: None,
            outcomes: None,
        };
        match self.client.submit(&spec).await {
            Ok(handle) => {
                debug!("Job {} -> {} (sims {}..={})", job_id, handle.external_id, first, last);
                job.handle = Some(handle);
            }
            Err(e) => {
                warn!("Submission of sims {}..={} failed: {}", first, last, e);
                job.fail(&format!("submission failed: {}", e));
            }
        }
        Ok(job)
    }

    async fn poll(&self, job: &mut Job<'_>) {
        let Some(handle) = job.handle.clone() else {
            return;
        };
        match self.client.status(&handle).await {
            Ok(JobStatus::Completed) => match read_outcomes(&handle).await {
                Ok(outcomes) => job.outcomes = Some(outcomes),
                Err(reason) => {
                    warn!("Job {} completed without usable outcomes: {}", handle.external_id, reason);
                    job.fail(&reason);
                }
            },
            Ok(JobStatus::Failed(reason)) => {
                warn!("Job {} failed: {}", handle.external_id, reason);
                job.fail(&format!("job failed: {}", reason));
            }
            Ok(JobStatus::Pending) | Ok(JobStatus::Running) => {}
            // Transient; the deadline bounds how long we keep asking
            Err(e) => debug!("Status of job {} unavailable: {}", handle.external_id, e),
        }
    }
}

async fn read_outcomes(handle: &JobHandle) -> Result<Vec<TaskOutcome>, String> {
    let bytes = tokio::fs::read(&handle.outcome_path)
        .await
        .map_err(|e| format!("outcome file {}: {}", handle.outcome_path.display(), e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("outcome file unreadable: {}", e))
}

impl Dispatcher for RemoteDispatcher {
    fn execute(
        &self,
        payloads: &[TaskPayload],
        _worker: Arc<dyn TaskWorker>,
    ) -> Result<Vec<TaskOutcome>, DispatchError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        runtime.block_on(self.run_jobs(payloads))
    }

    fn name(&self) -> &str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::test_support::{payloads, FakeWorker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runs each job at submission time, except the `fail_job`-th one.
    struct InlineCluster {
        fail_job: Option<usize>,
        submitted: AtomicUsize,
    }

    #[async_trait]
    impl ClusterClient for InlineCluster {
        async fn submit(&self, job: &JobSpec) -> Result<JobHandle, EnvError> {
            let n = self.submitted.fetch_add(1, Ordering::SeqCst);
            let payload_path = job.command.last().ok_or_else(|| EnvError::cluster("no payload"))?;
            let bytes = std::fs::read(payload_path).map_err(EnvError::cluster)?;
            let chunk: ChunkPayload = serde_json::from_slice(&bytes).map_err(EnvError::cluster)?;

            if self.fail_job != Some(n) {
                let outcomes: Vec<TaskOutcome> = chunk
                    .tasks
                    .iter()
                    .map(|t| TaskOutcome {
                        sim_id: t.sim_id,
                        success: true,
                        likelihood: Some(-(t.sim_id as f64)),
                        shard_path: None,
                        error: None,
                    })
                    .collect();
                let out = chunk.outcome_path.ok_or_else(|| EnvError::cluster("no outcome path"))?;
                std::fs::write(out, serde_json::to_vec(&outcomes).map_err(EnvError::cluster)?)
                    .map_err(EnvError::cluster)?;
            }
            Ok(JobHandle {
                job_id: job.job_id,
                external_id: n.to_string(),
                outcome_path: job.outcome_path.clone(),
            })
        }

        async fn status(&self, handle: &JobHandle) -> Result<JobStatus, EnvError> {
            if handle.outcome_path.exists() {
                Ok(JobStatus::Completed)
            } else {
                Ok(JobStatus::Failed("NODE_FAIL".into()))
            }
        }

        fn name(&self) -> &str {
            "inline"
        }
    }

    /// Accepts jobs and never finishes them.
    struct StuckCluster;

    #[async_trait]
    impl ClusterClient for StuckCluster {
        async fn submit(&self, job: &JobSpec) -> Result<JobHandle, EnvError> {
            Ok(JobHandle {
                job_id: job.job_id,
                external_id: "stuck".into(),
                outcome_path: job.outcome_path.clone(),
            })
        }

        async fn status(&self, _handle: &JobHandle) -> Result<JobStatus, EnvError> {
            Ok(JobStatus::Running)
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    fn dispatcher(client: Arc<dyn ClusterClient>, dir: &std::path::Path) -> RemoteDispatcher {
        RemoteDispatcher::new(client, PathBuf::from("calibra-sim"), dir.join("staging"))
            .with_chunk_size(4)
            .with_poll_interval(Duration::from_millis(5))
            .with_wall_clock(Duration::from_millis(200))
    }

    #[test]
    fn test_failed_job_fails_only_its_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(InlineCluster {
            fail_job: Some(1),
            submitted: AtomicUsize::new(0),
        });
        let outcomes = dispatcher(client, dir.path())
            .execute(&payloads(1..=10), Arc::new(FakeWorker::new(0)))
            .unwrap();

        assert_eq!(outcomes.len(), 10);
        let failed: Vec<u64> = outcomes.iter().filter(|o| !o.success).map(|o| o.sim_id).collect();
        assert_eq!(failed, vec![5, 6, 7, 8]);
        assert_eq!(outcomes[9].likelihood, Some(-10.0));
        // Staging is cleaned up
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_stuck_jobs_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = dispatcher(Arc::new(StuckCluster), dir.path())
            .execute(&payloads(1..=6), Arc::new(FakeWorker::new(0)))
            .unwrap();

        assert_eq!(outcomes.len(), 6);
        assert!(outcomes
            .iter()
            .all(|o| o.error.as_deref().unwrap().contains("Timeout after")));
    }

    #[tokio::test]
    async fn test_run_jobs_inside_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(InlineCluster {
            fail_job: None,
            submitted: AtomicUsize::new(0),
        });
        let outcomes = dispatcher(client.clone(), dir.path())
            .run_jobs(&payloads([3, 1, 2]))
            .await
            .unwrap();

        let ids: Vec<u64> = outcomes.iter().map(|o| o.sim_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(client.submitted.load(Ordering::SeqCst), 1);
    }
}
