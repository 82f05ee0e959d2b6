use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Job, JobStatus, OutputLog};
use crate::config::{AppConfig, StoreBackend};

const SQLITE_FILE_NAME: &str = "jobs.db";
const JSON_DIR_NAME: &str = "jobs";

static TMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Durable job records keyed by id. Implementations do no caching.
pub trait JobStore: Send + Sync {
    /// Overwrites the record for `job.id`. The process handle is never written.
    fn save(&self, job: &Job) -> Result<()>;

    /// Missing and corrupt records both come back as `None`.
    fn load(&self, id: &str) -> Option<Job>;

    /// Every readable record; corrupt ones are skipped with a warning.
    fn load_all(&self) -> Result<Vec<Job>>;

    fn backend_name(&self) -> &'static str;
}

pub fn open_job_store(config: &AppConfig, data_dir: &Path) -> Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match config.jobs.store {
        StoreBackend::Sqlite => Arc::new(SqliteJobStore::new(data_dir)?),
        StoreBackend::Json => Arc::new(JsonFileJobStore::new(data_dir)?),
    };
    Ok(store)
}

/// Wire shape shared by both backends.
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    status: String,
    output: String,
    created_at: Option<String>,
}

impl JobRecord {
    fn from_job(job: &Job) -> Self {
        Self {
            status: job.status.as_str().to_string(),
            output: job.output.render(),
            created_at: job.created_at.map(|ts| ts.to_rfc3339()),
        }
    }

    fn into_job(self, id: String) -> Result<Job> {
        let Some(status) = JobStatus::parse(&self.status) else {
            bail!("unknown persisted status: {}", self.status);
        };
        let created_at = self
            .created_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;

        Ok(Job {
            id,
            status,
            output: OutputLog::from_rendered(self.output),
            created_at,
            process: None,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
        .map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

impl SqliteJobStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).with_context(|| {
            format!(
                "failed to create data directory for jobs db: {}",
                data_dir.display()
            )
        })?;

        let store = Self {
            db_path: data_dir.join(SQLITE_FILE_NAME),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    output TEXT NOT NULL,
                    created_at TEXT,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize jobs schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open jobs db: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set jobs db busy timeout")?;
        op(&conn)
    }

    fn load_record(&self, id: &str) -> Result<Option<JobRecord>> {
        self.with_connection(|conn| {
            let record = conn
                .query_row(
                    "SELECT status, output, created_at FROM jobs WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(JobRecord {
                            status: row.get(0)?,
                            output: row.get(1)?,
                            created_at: row.get(2)?,
                        })
                    },
                )
                .optional()
                .with_context(|| format!("failed to query persisted job {id}"))?;
            Ok(record)
        })
    }
}

impl JobStore for SqliteJobStore {
    fn save(&self, job: &Job) -> Result<()> {
        let record = JobRecord::from_job(job);
        let updated_at = Utc::now().to_rfc3339();

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, status, output, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    output = excluded.output,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
                params![
                    job.id,
                    record.status,
                    record.output,
                    record.created_at,
                    updated_at
                ],
            )
            .with_context(|| format!("failed to upsert persisted job {}", job.id))?;
            Ok(())
        })
    }

    fn load(&self, id: &str) -> Option<Job> {
        let record = match self.load_record(id) {
            Ok(record) => record?,
            Err(err) => {
                warn!(job_id = %id, error = %err, "Failed to read persisted job");
                return None;
            }
        };

        match record.into_job(id.to_string()) {
            Ok(job) => Some(job),
            Err(err) => {
                warn!(job_id = %id, error = %err, "Ignoring corrupt persisted job");
                None
            }
        }
    }

    fn load_all(&self) -> Result<Vec<Job>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, output, created_at
                 FROM jobs
                 ORDER BY created_at ASC, id ASC",
            )?;

            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    JobRecord {
                        status: row.get(1)?,
                        output: row.get(2)?,
                        created_at: row.get(3)?,
                    },
                ))
            })?;

            let mut jobs = Vec::new();
            for row in rows {
                let (id, record) = match row {
                    Ok(row) => row,
                    Err(err) => {
                        warn!(error = %err, "Skipping unreadable persisted job row");
                        continue;
                    }
                };
                match record.into_job(id.clone()) {
                    Ok(job) => jobs.push(job),
                    Err(err) => {
                        warn!(job_id = %id, error = %err, "Skipping corrupt persisted job");
                    }
                }
            }

            Ok(jobs)
        })
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// One JSON document per job under `<data_dir>/jobs/`.
#[derive(Debug, Clone)]
pub struct JsonFileJobStore {
    dir: PathBuf,
}

impl JsonFileJobStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(JSON_DIR_NAME);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create job record directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Option<PathBuf> {
        is_safe_record_id(id).then(|| self.dir.join(format!("{id}.json")))
    }

    fn read_record(path: &Path) -> Result<JobRecord> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read job record: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse job record: {}", path.display()))
    }
}

fn is_safe_record_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl JobStore for JsonFileJobStore {
    fn save(&self, job: &Job) -> Result<()> {
        let Some(path) = self.record_path(&job.id) else {
            bail!("job id is not usable as a record name: {}", job.id);
        };
        let encoded = serde_json::to_vec_pretty(&JobRecord::from_job(job))
            .context("failed to serialize job record")?;

        // Unique per write: the runner and a shutdown flush may save the same id at once.
        let sequence = TMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("json.{}-{sequence}.tmp", std::process::id()));
        fs::write(&tmp_path, encoded)
            .with_context(|| format!("failed to write job record: {}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err)
                .with_context(|| format!("failed to replace job record: {}", path.display()));
        }
        Ok(())
    }

    fn load(&self, id: &str) -> Option<Job> {
        let path = self.record_path(id)?;
        if !path.is_file() {
            return None;
        }

        match Self::read_record(&path).and_then(|record| record.into_job(id.to_string())) {
            Ok(job) => Some(job),
            Err(err) => {
                warn!(job_id = %id, error = %format!("{err:#}"), "Ignoring corrupt persisted job");
                None
            }
        }
    }

    fn load_all(&self) -> Result<Vec<Job>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list job records: {}", self.dir.display()))?;

        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match Self::read_record(&path).and_then(|record| record.into_job(id.to_string())) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "Skipping corrupt persisted job");
                }
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn backend_name(&self) -> &'static str {
        "json"
    }
}
