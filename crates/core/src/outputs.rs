//! Report files written by finished jobs.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

const REPORT_EXTENSIONS: &[&str] = &["xlsx", "xml", "log", "json", "csv", "txt"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportFile {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Whether `path` carries one of the report extensions served to users.
pub fn is_report_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            REPORT_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Lists downloadable reports in `dir`, sorted by name. A missing directory
/// has no reports.
pub fn list_report_files(dir: &Path) -> Result<Vec<ReportFile>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read output directory: {}", dir.display()))
        }
    };

    let mut reports = Vec::new();
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !is_report_file(&path) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        reports.push(ReportFile {
            name: entry.file_name().to_string_lossy().to_string(),
            size_bytes: metadata.len(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }

    reports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(reports)
}

/// Maps a requested download name onto a path inside `dir`.
///
/// Only a single plain file name is accepted. Existence is not checked here.
pub fn resolve_report_file(dir: &Path, name: &str) -> Result<PathBuf> {
    let requested = Path::new(name);
    let mut components = requested.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(file_name)), None) if !name.contains('\\') => {
            Ok(dir.join(file_name))
        }
        _ => bail!("invalid report file name: {name:?}"),
    }
}
