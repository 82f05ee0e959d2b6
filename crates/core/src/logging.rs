//! Log filter selection, the rolling file sink and secret redaction for it.

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::LazyLock,
};

use regex::{Captures, Regex};
use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,tower_http=warn,job_output=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "ari-web";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

/// Target the job runner uses for raw script output lines. Quiet on the
/// console, kept at debug in the log file.
pub const JOB_OUTPUT_TARGET: &str = "job_output";

static URL_CREDENTIALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?P<scheme>[A-Za-z][A-Za-z0-9+.-]*://)[^/?#\s"'<>@]+@"#)
        .expect("url credentials pattern")
});

static SENSITIVE_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?P<key>\b(?:[A-Za-z0-9_-]*(?:token|secret|password)[A-Za-z0-9_-]*|[A-Za-z0-9_-]*(?:_key|-key|apikey)|key|pwd|passwd|authorization))(?P<sep>\s*[=:]\s*)(?P<bearer>bearer\s+)?(?P<value>"[^"]*"|'[^']*'|[^\s&,;)\]}"']+)"#,
    )
    .expect("sensitive assignment pattern")
});

static DEVICE_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<prefix>enter the code\s+)[A-Za-z0-9]{6,12}\b")
        .expect("device code pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Console and file filters. Noise directives only apply when the user did not
/// pick a filter explicitly; the file keeps job output at debug either way.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let include_noise = options.include_noise_filter_when_implicit
        && options.cli_log_filter.is_none()
        && options.verbose == 0;

    let console_filter = if include_noise {
        prepend_directives(&options.noise_filter, &user_filter)
    } else {
        user_filter.clone()
    };
    let file_filter = if include_noise {
        prepend_directives(&file_noise_filter(&options.noise_filter), &user_filter)
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    match (options.cli_log_filter.as_deref(), options.verbose) {
        (Some(filter), _) => filter.to_string(),
        (None, v) if v >= 2 => "trace".to_string(),
        (None, 1) => "debug".to_string(),
        (None, _) => options
            .rust_log_env
            .clone()
            .unwrap_or_else(|| options.default_log_filter.clone()),
    }
}

fn prepend_directives(directives: &str, user_filter: &str) -> String {
    if directives.trim().is_empty() {
        user_filter.to_string()
    } else {
        format!("{directives},{user_filter}")
    }
}

fn file_noise_filter(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            directive
                .split_once('=')
                .is_none_or(|(target, _)| target.trim() != JOB_OUTPUT_TARGET)
        })
        .map(ToString::to_string)
        .collect();
    directives.push(format!("{JOB_OUTPUT_TARGET}=debug"));
    directives.join(",")
}

/// Masks URL userinfo, secret-looking assignments and device login codes.
pub fn redact_sensitive_text(input: &str) -> String {
    let text = URL_CREDENTIALS.replace_all(input, |caps: &Captures<'_>| {
        format!("{}{REDACTION_PLACEHOLDER}@", &caps["scheme"])
    });

    let text = SENSITIVE_ASSIGNMENT.replace_all(&text, |caps: &Captures<'_>| {
        let value = &caps["value"];
        let masked = match value.chars().next() {
            Some(quote @ ('"' | '\'')) => format!("{quote}{REDACTION_PLACEHOLDER}{quote}"),
            _ => REDACTION_PLACEHOLDER.to_string(),
        };
        format!(
            "{}{}{}{masked}",
            &caps["key"],
            &caps["sep"],
            caps.name("bearer").map_or("", |m| m.as_str())
        )
    });

    DEVICE_CODE
        .replace_all(&text, |caps: &Captures<'_>| {
            format!("{}{REDACTION_PLACEHOLDER}", &caps["prefix"])
        })
        .into_owned()
}

#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

pub fn redacting_make_writer<M>(inner: M) -> RedactingMakeWriter<M> {
    RedactingMakeWriter { inner }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

/// Buffers until a newline so a secret split across writes is still masked.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn write_lines(&mut self, all: bool) -> io::Result<()> {
        let end = if all {
            self.pending.len()
        } else {
            match self.pending.iter().rposition(|byte| *byte == b'\n') {
                Some(index) => index + 1,
                None => return Ok(()),
            }
        };
        if end == 0 {
            return Ok(());
        }

        let chunk: Vec<u8> = self.pending.drain(..end).collect();
        let redacted = String::from_utf8_lossy(&chunk)
            .split_inclusive('\n')
            .map(redact_sensitive_text)
            .collect::<String>();
        self.inner.write_all(redacted.as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.write_lines(false)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_lines(true)?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.write_lines(true);
        let _ = self.inner.flush();
    }
}
