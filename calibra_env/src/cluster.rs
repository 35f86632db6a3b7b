//! Cluster scheduler abstraction for remote batch execution.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::JobId;
use std::path::PathBuf;

/// A fully self-contained job description.
///
/// Nothing is captured from the submitting process: the command line, the
/// environment and the location the job must write its outcome to are all
/// spelled out here.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Engine-side identifier of the job
    pub job_id: JobId,
    
    /// Human-readable name (shows up in the scheduler queue)
    pub name: String,
    
    /// Command the job executes on the compute node
    pub command: Vec<String>,
    
    /// Extra environment variables for the job
    pub env: Vec<(String, String)>,
    
    /// File the job writes its outcomes to; its presence marks completion
    pub outcome_path: PathBuf,
    
    /// Wall-clock budget enforced by the scheduler
    pub wall_clock_secs: u64,
    
    /// Memory request
    pub memory_mb: u64,
}

/// Handle returned by a successful submission.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: JobId,
    
    /// Identifier assigned by the external scheduler
    pub external_id: String,
    
    pub outcome_path: PathBuf,
}

/// Lifecycle of a submitted job as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed(String),
}

impl JobStatus {
    /// True once the job will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed(_))
    }
}

/// Abstraction over an external batch scheduler.
///
/// # Implementations
///
/// - **Production**: `CommandCluster` - shells out to submit/status commands
/// - **Tests**: in-process fakes that run the job inline
///
/// # Failure granularity
///
/// The engine only learns about a job as a whole. A job that fails or never
/// writes its outcome file fails every task it carried.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Submits a job.
    async fn submit(&self, job: &JobSpec) -> Result<JobHandle, EnvError>;
    
    /// Queries the state of a previously submitted job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, EnvError>;
    
    /// Returns the scheduler name (for logging).
    fn name(&self) -> &str;
}
