//! Production ClusterClient that drives a batch scheduler through its CLI.

use crate::cluster::{ClusterClient, JobHandle, JobSpec, JobStatus};
use crate::error::EnvError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Cluster client backed by external submit/status commands.
///
/// Templates are argument vectors with placeholders:
///
/// | placeholder          | replaced by                                   |
/// |----------------------|-----------------------------------------------|
/// | `{command}`          | the job command, shell-quoted into one string |
/// | `{args}`             | the job command spliced in as separate args   |
/// | `{name}`             | the job name                                  |
/// | `{wall_clock_secs}`  | wall-clock budget                             |
/// | `{memory_mb}`        | memory request                                |
/// | `{outcome}`          | outcome file path                             |
/// | `{external_id}`      | scheduler job id (status template only)       |
///
/// For example a SLURM setup might use
/// `["sbatch", "--parsable", "--job-name={name}", "--time=0:0:{wall_clock_secs}", "--wrap", "{command}"]`
/// and `["squeue", "--noheader", "--format=%T", "--job", "{external_id}"]`.
pub struct CommandCluster {
    submit_template: Vec<String>,
    status_template: Option<Vec<String>>,
}

impl CommandCluster {
    /// Creates a client from a submit template.
    pub fn new(submit_template: Vec<String>) -> Self {
        Self {
            submit_template,
            status_template: None,
        }
    }
    
    /// Sets a status command used while the outcome file is missing.
    pub fn with_status_command(mut self, template: Vec<String>) -> Self {
        self.status_template = Some(template);
        self
    }
    
    fn render(template: &[String], job: &JobSpec, external_id: &str) -> Vec<String> {
        let mut rendered = Vec::with_capacity(template.len() + job.command.len());
        for part in template {
            if part == "{args}" {
                rendered.extend(job.command.iter().cloned());
                continue;
            }
            let value = part
                .replace("{command}", &shell_join(&job.command))
                .replace("{name}", &job.name)
                .replace("{wall_clock_secs}", &job.wall_clock_secs.to_string())
                .replace("{memory_mb}", &job.memory_mb.to_string())
                .replace("{outcome}", &job.outcome_path.to_string_lossy())
                .replace("{external_id}", external_id);
            rendered.push(value);
        }
        rendered
    }
    
    async fn run(argv: &[String], env: &[(String, String)]) -> Result<String, EnvError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EnvError::cluster("empty command template"))?;
        let output = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EnvError::cluster(format!("failed to spawn {}: {}", program, e)))?;
        
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EnvError::cluster(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ClusterClient for CommandCluster {
    async fn submit(&self, job: &JobSpec) -> Result<JobHandle, EnvError> {
        let argv = Self::render(&self.submit_template, job, "");
        let stdout = Self::run(&argv, &job.env).await?;
        
        // "Submitted batch job 123" and "123" both yield "123"
        let external_id = stdout
            .split_whitespace()
            .last()
            .map(str::to_string)
            .unwrap_or_else(|| job.job_id.to_string());
        debug!("Submitted job {} as {}", job.name, external_id);
        
        Ok(JobHandle {
            job_id: job.job_id,
            external_id,
            outcome_path: job.outcome_path.clone(),
        })
    }
    
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, EnvError> {
        if tokio::fs::try_exists(&handle.outcome_path).await.unwrap_or(false) {
            return Ok(JobStatus::Completed);
        }
        
        let Some(template) = &self.status_template else {
            return Ok(JobStatus::Running);
        };
        
        let argv: Vec<String> = template
            .iter()
            .map(|part| part.replace("{external_id}", &handle.external_id))
            .collect();
        let state = Self::run(&argv, &[]).await?.to_uppercase();
        
        let failed = ["FAILED", "CANCELLED", "TIMEOUT", "OUT_OF_MEMORY", "NODE_FAIL"];
        if let Some(reason) = failed.iter().find(|s| state.contains(*s)) {
            return Ok(JobStatus::Failed(reason.to_string()));
        }
        if state.contains("PENDING") {
            return Ok(JobStatus::Pending);
        }
        // Finished but the outcome file is not visible yet (shared filesystems lag)
        Ok(JobStatus::Running)
    }
    
    fn name(&self) -> &str {
        "command"
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
