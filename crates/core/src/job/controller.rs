use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::registry::JobRegistry;
use super::runner::{JobRunner, RunnerSettings};
use super::{Job, JobStatus, JobView};

/// What a job executes: `program [args..] <script file>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Human-readable name used in the start and end banners.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub script: String,
    pub script_extension: String,
}

impl Invocation {
    pub fn validate(&self) -> Result<(), StartJobError> {
        if self.program.trim().is_empty() {
            return Err(StartJobError::InvalidInvocation(
                "program must not be empty".to_string(),
            ));
        }
        if self.script.trim().is_empty() {
            return Err(StartJobError::InvalidInvocation(
                "script body must not be empty".to_string(),
            ));
        }
        if self.script_extension.is_empty()
            || !self
                .script_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(StartJobError::InvalidInvocation(format!(
                "unsupported script extension: {:?}",
                self.script_extension
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StartJobError {
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),
    #[error("failed to start job worker for {job_id}: {source}")]
    Spawn {
        job_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Boundary for starting jobs and answering status polls.
#[derive(Clone)]
pub struct JobController {
    registry: Arc<JobRegistry>,
    settings: RunnerSettings,
}

impl JobController {
    pub fn new(registry: Arc<JobRegistry>, settings: RunnerSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Registers a running job and hands it to a detached runner. Returns
    /// immediately with the new id.
    pub fn start(&self, invocation: Invocation) -> Result<String, StartJobError> {
        invocation.validate()?;

        let id = Uuid::new_v4().to_string();
        let job = Job::new_running(id.clone());
        self.registry.put(job);
        if let Err(err) = self.registry.persist(&id) {
            warn!(job_id = %id, error = ?err, "Failed to persist new job; continuing in memory");
        }

        let label = invocation.label.clone();
        let runner = JobRunner::new(
            id.clone(),
            invocation,
            Arc::clone(&self.registry),
            self.settings.clone(),
        );

        if let Err(source) = runner.spawn() {
            error!(job_id = %id, error = %source, "Failed to spawn job worker thread");
            self.registry.update(&id, |job| {
                job.finish(
                    JobStatus::Failed,
                    format!("<br>Error: failed to start job worker: {source}"),
                )
            });
            if let Err(err) = self.registry.persist(&id) {
                warn!(job_id = %id, error = ?err, "Failed to persist worker spawn failure");
            }
            return Err(StartJobError::Spawn { job_id: id, source });
        }

        info!(job_id = %id, label = %label, "Job created");
        Ok(id)
    }

    /// Current snapshot of `id`; unknown ids yield a `not_found` view.
    pub fn status(&self, id: &str) -> JobView {
        match self.registry.get(id) {
            Some(job) => job.view(),
            None => JobView::not_found(id),
        }
    }

    pub fn list(&self) -> Vec<JobView> {
        self.registry.list().iter().map(Job::view).collect()
    }

    /// Saves every known job; used on shutdown.
    pub fn flush(&self) -> usize {
        let failures = self.registry.flush();
        info!(
            jobs = self.registry.len(),
            failures, "Flushed job registry to storage"
        );
        failures
    }
}
