use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_PREFIX: &str = "delve";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// A structured lifecycle record for one run, stream or request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub session_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub message_id: Option<&'a str>,
    pub stream_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            ..Self::default()
        }
    }
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.chars().count(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

macro_rules! obs_record {
    ($macro:ident, $process:expr, $event:expr) => {
        tracing::$macro!(
            target: "delve.obs",
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            session_id = $event.session_id.unwrap_or(""),
            run_id = $event.run_id.unwrap_or(""),
            message_id = $event.message_id.unwrap_or(""),
            stream_id = $event.stream_id.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_record!(error, process, event),
        Level::WARN => obs_record!(warn, process, event),
        Level::DEBUG | Level::TRACE => obs_record!(debug, process, event),
        _ => obs_record!(info, process, event),
    }
}

pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let prefix = format!("{LOG_PREFIX}.{}", process.as_str());
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // stderr keeps stdout clean for `delve-engine run`
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix,
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{LOG_PREFIX}.{process}.");

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date) = parse_log_file_date(name, &prefix) else {
            continue;
        };
        if date < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

// expected: delve.<proc>.YYYY-MM-DD.jsonl
fn parse_log_file_date(name: &str, prefix: &str) -> Option<DateTime<Utc>> {
    let date_part = name.strip_prefix(prefix)?.strip_suffix(".jsonl")?;
    let date = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let dt = date.and_hms_opt(0, 0, 0)?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "what is the capital of france";
        let redacted = redact_text(raw);
        assert!(redacted.starts_with("[redacted len=29"));
        assert!(!redacted.contains("france"));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn parses_dated_log_names_only() {
        let prefix = "delve.engine.";
        assert!(parse_log_file_date("delve.engine.2024-03-01.jsonl", prefix).is_some());
        assert!(parse_log_file_date("delve.engine.latest.jsonl", prefix).is_none());
        assert!(parse_log_file_date("delve.cli.2024-03-01.jsonl", prefix).is_none());
    }

    #[test]
    fn cleanup_removes_expired_files_and_keeps_recent() {
        let dir = std::env::temp_dir().join(format!(
            "delve-obs-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).expect("logs dir");
        let old = dir.join("delve.engine.2000-01-01.jsonl");
        let today = dir.join(format!("delve.engine.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        fs::write(&old, "{}").expect("old");
        fs::write(&today, "{}").expect("today");

        cleanup_old_jsonl(&dir, "engine", 14).expect("cleanup");
        assert!(!old.exists());
        assert!(today.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/delve");
        assert_eq!(canonical_logs_dir_from_root(&root), root.join("logs"));
    }
}
