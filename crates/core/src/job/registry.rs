use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tracing::{info, warn};

use super::store::JobStore;
use super::{Job, JobStatus};

pub const INTERRUPTED_BANNER: &str =
    "<br>Job was interrupted because the server restarted before it finished";

/// In-memory view of jobs, backed by a [`JobStore`].
///
/// Each map entry is guarded by its shard lock, so a reader always clones a
/// whole job and never sees a half-applied append.
pub struct JobRegistry {
    jobs: DashMap<String, Job>,
    store: Arc<dyn JobStore>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            jobs: DashMap::new(),
            store,
        }
    }

    /// Builds a registry and eagerly seeds it from storage.
    pub fn restored(store: Arc<dyn JobStore>) -> Self {
        let registry = Self::new(store);
        registry.restore();
        registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Snapshot of a job, falling back to storage on a miss.
    pub fn get(&self, id: &str) -> Option<Job> {
        if let Some(job) = self.jobs.get(id) {
            return Some(job.value().clone());
        }

        let job = self.store.load(id)?;
        // Another caller may have rehydrated or created the entry meanwhile.
        let entry = self.jobs.entry(id.to_string()).or_insert(job);
        Some(entry.value().clone())
    }

    pub fn put(&self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    /// Applies `op` to the job under its entry lock.
    pub fn update<R>(&self, id: &str, op: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut entry = self.jobs.get_mut(id)?;
        Some(op(entry.value_mut()))
    }

    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Writes the current in-memory snapshot of `id` to storage.
    ///
    /// The entry's read lock is held across the save, so no update can land
    /// between reading the snapshot and writing it. Saves of one job are
    /// therefore ordered like its updates and an older snapshot never
    /// overwrites a newer record.
    pub fn persist(&self, id: &str) -> Result<bool> {
        let Some(entry) = self.jobs.get(id) else {
            return Ok(false);
        };
        self.store.save(entry.value())?;
        Ok(true)
    }

    /// Seeds memory with every stored job.
    ///
    /// A stored `running` job has no runner left in this process, so it is
    /// closed as failed and written back.
    pub fn restore(&self) -> usize {
        let restored = match self.store.load_all() {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(
                    error = %format!("{err:#}"),
                    backend = self.store.backend_name(),
                    "Failed to restore persisted jobs; continuing with empty registry"
                );
                return 0;
            }
        };

        let mut reconciled = 0usize;
        let restored_count = restored.len();
        for mut job in restored {
            if job.finish(JobStatus::Failed, INTERRUPTED_BANNER) {
                reconciled += 1;
                if let Err(err) = self.store.save(&job) {
                    warn!(job_id = %job.id, error = %format!("{err:#}"), "Failed to persist startup reconciliation");
                }
            }
            self.jobs.insert(job.id.clone(), job);
        }

        info!(
            restored_count,
            reconciled,
            backend = self.store.backend_name(),
            "Restored persisted jobs into registry"
        );
        restored_count
    }

    /// Persists every job currently held in memory. Returns how many saves failed.
    pub fn flush(&self) -> usize {
        let ids: Vec<String> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        let mut failures = 0usize;
        for id in &ids {
            if let Err(err) = self.persist(id) {
                failures += 1;
                warn!(job_id = %id, error = %format!("{err:#}"), "Failed to flush job snapshot");
            }
        }
        failures
    }
}
