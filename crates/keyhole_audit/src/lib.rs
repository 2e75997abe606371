//! keyhole_audit
//!
//! The structured event logger (§4.10): one JSON object per line, a level
//! cutoff, and three sinks. Every log line already carries a sanitized
//! path — nothing downstream of this crate ever sees a raw query string
//! from a query-param-auth service.
//!
//! This deliberately stops short of a hash-chained append log: no
//! `prev_hash`/`hash` fields, no `verify_log`. A stream of structured log
//! lines is the whole surface here, not a tamper-evident store.

use chrono::Utc;
use keyhole_common::SensitiveString;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),
    #[error("invalid sink '{0}'")]
    InvalidSink(String),
    #[error("sink is 'file' but no path was configured")]
    MissingFilePath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn parse(s: &str) -> Result<Self, AuditError> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            other => Err(AuditError::InvalidLevel(other.to_string())),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Sink {
    Stderr,
    Stdout,
    File,
}

impl Sink {
    pub fn parse(s: &str) -> Result<Self, AuditError> {
        match s.to_ascii_lowercase().as_str() {
            "stderr" => Ok(Sink::Stderr),
            "stdout" => Ok(Sink::Stdout),
            "file" => Ok(Sink::File),
            other => Err(AuditError::InvalidSink(other.to_string())),
        }
    }
}

/// Per-request context folded into one log line (§4.10). Every field is
/// optional except `service`/`method`/`path` since non-request events
/// (bootstrap, restart) don't have a status/duration/redaction outcome.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    pub service: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub duration_ms: Option<u64>,
    pub redacted: Option<bool>,
    pub layers_fired: Option<Vec<String>>,
    pub heuristic_keys: Option<Vec<String>>,
    pub agent: Option<String>,
    pub error: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    timestamp: String,
    level: &'a str,
    event: &'a str,
    #[serde(flatten)]
    context: &'a RequestContext,
}

enum Writer {
    Stderr,
    Stdout,
    File(Mutex<std::fs::File>),
}

/// A leveled JSON-lines logger over one of the three §4.10 sinks.
pub struct AuditLogger {
    level: Level,
    writer: Writer,
}

impl AuditLogger {
    pub fn new(level: Level, sink: Sink, file_path: Option<&Path>) -> Result<Self, AuditError> {
        let writer = match sink {
            Sink::Stderr => Writer::Stderr,
            Sink::Stdout => Writer::Stdout,
            Sink::File => {
                let path = file_path.ok_or(AuditError::MissingFilePath)?;
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Writer::File(Mutex::new(file))
            }
        };
        Ok(Self { level, writer })
    }

    /// Build a logger straight from the config's optional `logging` block,
    /// defaulting to info/stderr when absent (§4.10's implied default).
    pub fn from_config(logging: Option<&keyhole_config::LoggingConfig>) -> Result<Self, AuditError> {
        let level = logging
            .and_then(|l| l.level.as_deref())
            .map(Level::parse)
            .transpose()?
            .unwrap_or(Level::Info);
        let sink = logging
            .and_then(|l| l.sink.as_deref())
            .map(Sink::parse)
            .transpose()?
            .unwrap_or(Sink::Stderr);
        let file_path = logging.and_then(|l| l.file.as_deref()).map(PathBuf::from);
        Self::new(level, sink, file_path.as_deref())
    }

    pub fn log(&self, level: Level, event: &str, context: &RequestContext) {
        if level < self.level {
            return;
        }
        let line = LogLine {
            timestamp: Utc::now().to_rfc3339(),
            level: level.as_str(),
            event,
            context,
        };
        let Ok(mut serialized) = serde_json::to_string(&line) else { return };
        serialized.push('\n');
        let _ = self.write_line(&serialized);
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        match &self.writer {
            Writer::Stderr => std::io::stderr().write_all(line.as_bytes()),
            Writer::Stdout => std::io::stdout().write_all(line.as_bytes()),
            Writer::File(f) => {
                let mut f = f.lock().unwrap_or_else(|p| p.into_inner());
                f.write_all(line.as_bytes())
            }
        }
    }

    pub fn debug(&self, event: &str, context: &RequestContext) {
        self.log(Level::Debug, event, context)
    }
    pub fn info(&self, event: &str, context: &RequestContext) {
        self.log(Level::Info, event, context)
    }
    pub fn warn(&self, event: &str, context: &RequestContext) {
        self.log(Level::Warn, event, context)
    }
    pub fn error(&self, event: &str, context: &RequestContext) {
        self.log(Level::Error, event, context)
    }
}

/// Sanitize a request path for a query-param-auth service (§4.10): parse
/// as a URL, drop `param_name`, keep every other query parameter. If the
/// path can't be parsed as a URL at all, fall back to truncating at `?`
/// and appending a fixed marker rather than risk leaking the secret.
pub fn sanitize_path(path: &str, param_name: &str) -> String {
    let placeholder_base = "http://keyhole.invalid";
    let full = format!("{placeholder_base}{path}");
    match url::Url::parse(&full) {
        Ok(url) => {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != param_name)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            let mut out = url.path().to_string();
            if !kept.is_empty() {
                let query = kept
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&");
                out.push('?');
                out.push_str(&query);
            }
            out
        }
        Err(_) => match path.split_once('?') {
            Some((base, _)) => format!("{base}?[query redacted]"),
            None => path.to_string(),
        },
    }
}

/// Scrub a passphrase-shaped value from a context's `error` field before
/// logging, in case an upstream error message happened to echo it back.
pub fn redact_if_matches(text: &str, secret: &SensitiveString) -> String {
    if !secret.is_empty() && text.contains(secret.expose()) {
        text.replace(secret.expose(), "[REDACTED BY KEYHOLE]")
    } else {
        text.to_string()
    }
}
