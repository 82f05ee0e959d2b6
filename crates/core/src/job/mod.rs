//! Background job lifecycle: records, persistence, the per-job runner and the
//! controller that ties them together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod controller;
pub mod registry;
pub mod runner;
pub mod store;
pub mod transform;

pub use controller::{Invocation, JobController, StartJobError};
pub use registry::JobRegistry;
pub use runner::{JobRunner, RunnerSettings};
pub use store::{open_job_store, JobStore, JsonFileJobStore, SqliteJobStore};

pub const NOT_FOUND_MESSAGE: &str = "Job not found";

const STATUS_RUNNING: &str = "running";
const STATUS_COMPLETED: &str = "completed";
const STATUS_FAILED: &str = "failed";

/// Stored lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => STATUS_RUNNING,
            JobStatus::Completed => STATUS_COMPLETED,
            JobStatus::Failed => STATUS_FAILED,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            STATUS_RUNNING => Some(JobStatus::Running),
            STATUS_COMPLETED => Some(JobStatus::Completed),
            STATUS_FAILED => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Status as reported to pollers. `NotFound` never reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Running,
    Completed,
    Failed,
    NotFound,
}

impl From<JobStatus> for PollStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Running => PollStatus::Running,
            JobStatus::Completed => PollStatus::Completed,
            JobStatus::Failed => PollStatus::Failed,
        }
    }
}

/// Append-only markup log. Fragments are kept separate so a long job does not
/// reallocate the whole string on every line; `render` joins them on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputLog {
    fragments: Vec<String>,
    len: usize,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rendered(rendered: String) -> Self {
        if rendered.is_empty() {
            return Self::default();
        }
        Self {
            len: rendered.len(),
            fragments: vec![rendered],
        }
    }

    pub fn push(&mut self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if fragment.is_empty() {
            return;
        }
        self.len += fragment.len();
        self.fragments.push(fragment);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn render(&self) -> String {
        let mut rendered = String::with_capacity(self.len);
        for fragment in &self.fragments {
            rendered.push_str(fragment);
        }
        rendered
    }
}

/// Live external process owned by a running job. In-memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub output: OutputLog,
    pub created_at: Option<DateTime<Utc>>,
    pub process: Option<ProcessHandle>,
}

impl Job {
    pub fn new_running(id: String) -> Self {
        Self {
            id,
            status: JobStatus::Running,
            output: OutputLog::new(),
            created_at: Some(Utc::now()),
            process: None,
        }
    }

    /// Appends a fragment while the job is running; terminal jobs are frozen.
    pub fn append(&mut self, fragment: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.output.push(fragment);
        true
    }

    /// Moves a running job to a terminal status and writes the closing banner.
    /// Returns false, leaving the job untouched, if it is already terminal.
    pub fn finish(&mut self, status: JobStatus, banner: impl Into<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.output.push(banner);
        self.status = status;
        self.process = None;
        true
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            status: self.status.into(),
            output: self.output.render(),
            created_at: self.created_at,
            message: None,
        }
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub status: PollStatus,
    pub output: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobView {
    pub fn not_found(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: PollStatus::NotFound,
            output: String::new(),
            created_at: None,
            message: Some(NOT_FOUND_MESSAGE.to_string()),
        }
    }
}
