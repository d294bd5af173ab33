use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target every milestone is logged under; filter on it to follow sessions.
pub const MILESTONE_TARGET: &str = "skiff.obs";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Core,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Core => "core",
        }
    }

    fn file_prefix(self) -> String {
        format!("skiff.{}", self.as_str())
    }
}

/// A point in a session's or sandbox's life worth keeping in the JSONL log:
/// `sandbox.create.ready`, `session.turn.finish` and so on. The component
/// is the first segment of `event`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Milestone<'a> {
    pub event: &'a str,
    pub session_id: Option<&'a str>,
    pub sandbox_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub elapsed: Option<Duration>,
    pub detail: Option<&'a str>,
}

impl Milestone<'_> {
    pub fn component(&self) -> &str {
        self.event.split('.').next().unwrap_or(self.event)
    }
}

macro_rules! milestone_at {
    ($level:expr, $process:expr, $m:expr) => {
        tracing::event!(
            target: MILESTONE_TARGET,
            $level,
            process = $process.as_str(),
            component = $m.component(),
            event = $m.event,
            session_id = $m.session_id.unwrap_or(""),
            sandbox_id = $m.sandbox_id.unwrap_or(""),
            status = $m.status.unwrap_or(""),
            error_code = $m.error_code.unwrap_or(""),
            elapsed_ms = $m.elapsed.map(|d| d.as_millis() as u64),
            detail = $m.detail.unwrap_or(""),
            "milestone"
        )
    };
}

pub fn record_milestone(level: Level, process: ProcessKind, milestone: Milestone<'_>) {
    if level == Level::ERROR {
        milestone_at!(Level::ERROR, process, milestone);
    } else if level == Level::WARN {
        milestone_at!(Level::WARN, process, milestone);
    } else if level == Level::DEBUG || level == Level::TRACE {
        milestone_at!(Level::DEBUG, process, milestone);
    } else {
        milestone_at!(Level::INFO, process, milestone);
    }
}

/// Stand-in for a secret: its length and a fingerprint, so two log lines can
/// be compared without either one carrying the value.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", trimmed.len(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Replaces every occurrence of a known secret in free text (command
/// stderr, agent log tails) with its redacted form. Very short values are
/// left alone; they would match ordinary words.
pub fn scrub_secrets<S: AsRef<str>>(text: &str, secrets: &[S]) -> String {
    let mut scrubbed = text.to_string();
    for secret in secrets {
        let secret = secret.as_ref().trim();
        if secret.len() < 6 || !scrubbed.contains(secret) {
            continue;
        }
        scrubbed = scrubbed.replace(secret, &redact_text(secret));
    }
    scrubbed
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Keeps the file writer flushing; drop it only at process exit.
pub struct LoggingHandle {
    _guard: WorkerGuard,
    pub info: LoggingInitInfo,
}

/// Daily-rolled JSONL under `logs_dir` plus a compact console layer on
/// stderr, so stdout stays free for framed events. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<LoggingHandle> {
    fs::create_dir_all(logs_dir)?;
    let removed = prune_expired_logs(logs_dir, process, retention_days, Utc::now())?;

    let prefix = process.file_prefix();
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A subscriber installed earlier (tests, embedding hosts) wins.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
    if removed > 0 {
        tracing::debug!("Pruned {} expired log file(s) from {:?}", removed, logs_dir);
    }

    Ok(LoggingHandle {
        _guard: guard,
        info: LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: logs_dir.display().to_string(),
            prefix,
            retention_days,
            initialized_at: Utc::now(),
        },
    })
}

/// `skiff.<process>.YYYY-MM-DD.jsonl` -> the date, for this process only.
fn log_file_date(name: &str, process: ProcessKind) -> Option<NaiveDate> {
    let date = name
        .strip_prefix(&process.file_prefix())?
        .strip_prefix('.')?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn prune_expired_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let cutoff = (now - chrono::Duration::days(retention_days as i64)).date_naive();
    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| log_file_date(name, process))
            .is_some_and(|date| date < cutoff);
        if expired && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
