use std::fs;
use std::io::{BufRead, BufReader, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::logging::JOB_OUTPUT_TARGET;
use super::controller::Invocation;
use super::registry::JobRegistry;
use super::transform::transform;
use super::{JobStatus, ProcessHandle};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Minimum time between intermediate saves while output streams in.
    pub persist_interval: Duration,
    /// Pause after the process exits so files it wrote are visible to readers.
    pub settle_delay: Duration,
    pub scripts_dir: PathBuf,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(10),
            settle_delay: Duration::from_secs(2),
            scripts_dir: std::env::temp_dir(),
        }
    }
}

/// Owns one job from process launch to its terminal record.
///
/// Runs on a dedicated OS thread: line reads and the exit wait block, and that
/// must never happen on the async runtime serving requests. The thread is not
/// joined on shutdown.
pub struct JobRunner {
    job_id: String,
    invocation: Invocation,
    registry: Arc<JobRegistry>,
    settings: RunnerSettings,
    script_path: Option<PathBuf>,
    last_persist: Instant,
}

impl JobRunner {
    pub fn new(
        job_id: String,
        invocation: Invocation,
        registry: Arc<JobRegistry>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            job_id,
            invocation,
            registry,
            settings,
            script_path: None,
            last_persist: Instant::now(),
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("job-{}", self.job_id))
            .spawn(move || self.run())
    }

    /// Drives the job to completion. Every failure ends up as a `failed`
    /// record; nothing is propagated to the caller.
    pub fn run(mut self) {
        info!(job_id = %self.job_id, label = %self.invocation.label, "Job runner started");
        self.append(format!("Starting {}...<br>", self.invocation.label));

        let outcome = self.execute();
        self.remove_script();

        let label = self.invocation.label.clone();
        let (status, banner) = match outcome {
            Ok(exit) => match exit.code() {
                Some(0) => (
                    JobStatus::Completed,
                    format!("<br>{label} completed successfully!"),
                ),
                Some(code) => (
                    JobStatus::Failed,
                    format!("<br>{label} failed with exit code {code}"),
                ),
                None => (
                    JobStatus::Failed,
                    format!("<br>{label} was terminated by a signal{}", signal_suffix(&exit)),
                ),
            },
            Err(err) => {
                error!(job_id = %self.job_id, error = ?err, "Job execution failed");
                (JobStatus::Failed, format!("<br>Error: {err:#}"))
            }
        };

        let finished = self
            .registry
            .update(&self.job_id, |job| job.finish(status, banner))
            .unwrap_or(false);
        if !finished {
            warn!(job_id = %self.job_id, "Job was already terminal or missing when runner finished");
        }

        self.persist_now("terminal");
        info!(job_id = %self.job_id, status = status.as_str(), "Job finished");
    }

    fn execute(&mut self) -> Result<ExitStatus> {
        let script_path = self.write_script()?;

        let (reader, writer) = std::io::pipe().context("failed to create output pipe")?;
        let stderr_writer = writer
            .try_clone()
            .context("failed to share output pipe with stderr")?;

        let mut command = Command::new(&self.invocation.program);
        command
            .args(&self.invocation.args)
            .arg(&script_path)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {}", self.invocation.program))?;
        // The command still holds our copies of the pipe's write end; the
        // reader only sees EOF once they are closed.
        drop(command);

        let pid = child.id();
        self.registry.update(&self.job_id, |job| {
            job.process = Some(ProcessHandle { pid });
        });
        debug!(job_id = %self.job_id, pid, "External process spawned");

        if let Err(err) = self.pump_output(reader) {
            reap_after_failure(&mut child);
            return Err(err);
        }

        let exit = child
            .wait()
            .context("failed to wait for external process")?;

        if !self.settings.settle_delay.is_zero() {
            thread::sleep(self.settings.settle_delay);
        }

        Ok(exit)
    }

    fn pump_output(&mut self, reader: PipeReader) -> Result<()> {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .context("failed to read process output")?;
            if read == 0 {
                return Ok(());
            }

            let raw = String::from_utf8_lossy(&buf);
            let line = raw.trim_end_matches(['\n', '\r']);
            debug!(target: JOB_OUTPUT_TARGET, job_id = %self.job_id, "{line}");
            self.append(transform(line));

            if self.last_persist.elapsed() >= self.settings.persist_interval {
                self.persist_now("periodic");
            }
        }
    }

    fn append(&self, fragment: String) {
        self.registry.update(&self.job_id, |job| job.append(fragment));
    }

    fn persist_now(&mut self, reason: &'static str) {
        self.last_persist = Instant::now();
        match self.registry.persist(&self.job_id) {
            Ok(_) => debug!(job_id = %self.job_id, reason, "Persisted job snapshot"),
            Err(err) => error!(
                job_id = %self.job_id,
                reason,
                error = ?err,
                "Failed to persist job snapshot; in-memory state remains authoritative"
            ),
        }
    }

    fn write_script(&mut self) -> Result<PathBuf> {
        let dir = &self.settings.scripts_dir;
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create scripts directory: {}", dir.display()))?;

        let path = dir.join(format!(
            "job-{}.{}",
            self.job_id, self.invocation.script_extension
        ));
        fs::write(&path, &self.invocation.script)
            .with_context(|| format!("failed to write job script: {}", path.display()))?;
        self.script_path = Some(path.clone());
        mark_executable(&path)?;

        Ok(path)
    }

    fn remove_script(&mut self) {
        let Some(path) = self.script_path.take() else {
            return;
        };
        if let Err(err) = fs::remove_file(&path) {
            debug!(job_id = %self.job_id, path = %path.display(), error = %err, "Failed to remove job script");
        }
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("failed to mark script executable: {}", path.display()))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_suffix(exit: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    exit.signal()
        .map(|signal| format!(" ({signal})"))
        .unwrap_or_default()
}

#[cfg(not(unix))]
fn signal_suffix(_exit: &ExitStatus) -> String {
    String::new()
}

fn reap_after_failure(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(error = %err, "Failed to kill external process after stream error");
    }
    if let Err(err) = child.wait() {
        debug!(error = %err, "Failed to reap external process after stream error");
    }
}
