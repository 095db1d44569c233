//! Per-request logging: structured log calls for every request, response,
//! decision, and modification, plus optional JSON-lines files for combined
//! traffic events and decisions.
//!
//! Log methods never fail from the caller's point of view; file write
//! failures are reported through the structured logger and otherwise
//! swallowed.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::LoggingConfig;
use crate::decision::Decision;
use crate::error::Error;
use crate::request::{Request, Response, TrafficRecord};

#[derive(Default)]
struct LogFiles {
    traffic: Option<File>,
    decisions: Option<File>,
}

/// Sink for per-request log events.
pub struct TrafficLogger {
    config: LoggingConfig,
    // One lock for both files keeps interleaved JSON lines well-formed.
    files: Mutex<LogFiles>,
}

impl TrafficLogger {
    /// Create a logger, opening the configured log files.
    ///
    /// A file that cannot be opened is disabled with a warning; structured
    /// logging continues regardless.
    pub fn new(config: &LoggingConfig) -> Self {
        let mut files = LogFiles::default();

        if config.log_requests {
            if let Some(path) = &config.traffic_log_file {
                files.traffic = open_append(path);
            }
        }
        if config.log_decisions {
            if let Some(path) = &config.decisions_file {
                files.decisions = open_append(path);
            }
        }

        Self {
            config: config.clone(),
            files: Mutex::new(files),
        }
    }

    pub fn log_request(&self, req: &Request) {
        if !self.config.log_requests {
            return;
        }

        debug!(
            req_id = %req.id,
            protocol = %req.protocol,
            method = %req.method,
            domain = %req.domain,
            path = %req.path,
            content_length = req.content_length,
            "Request"
        );
    }

    pub fn log_response(&self, resp: &Response) {
        if !self.config.log_responses {
            return;
        }

        debug!(
            resp_id = %resp.id,
            status_code = resp.status_code,
            content_length = resp.content_length,
            source = %resp.source,
            "Response"
        );
    }

    /// Log a decision and append it to the decisions file.
    pub fn log_decision(&self, req: &Request, decision: &Decision) {
        if !self.config.log_decisions {
            return;
        }

        info!(
            req_id = %req.id,
            action = %decision.action,
            rule = %decision.rule_name,
            reason = %decision.reason,
            "Decision made"
        );

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "req_id": req.id,
            "protocol": req.protocol,
            "domain": req.domain,
            "path": req.path,
            "decision": {
                "action": decision.action,
                "reason": decision.reason,
                "rule_name": decision.rule_name,
                "confidence": decision.confidence,
            },
        });

        let mut files = self
            .files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(file) = files.decisions.as_mut() {
            write_json_line(file, &entry, "decision");
        }
    }

    pub fn log_modification(&self, req: &Request, modification: &str) {
        if !self.config.log_modifications {
            return;
        }

        info!(
            req_id = %req.id,
            modification = %modification,
            domain = %req.domain,
            "Traffic modification"
        );
    }

    /// Log the combined traffic record and append it to the traffic file.
    pub fn log_traffic(&self, record: &TrafficRecord<'_>) {
        if !self.config.log_requests {
            return;
        }

        info!(
            req_id = %record.request.id,
            protocol = %record.request.protocol,
            domain = %record.request.domain,
            path = %record.request.path,
            action = %record.action,
            rule = %record.decision.rule_name,
            duration_ms = record.duration_ms,
            "Traffic event"
        );

        let entry = match serde_json::to_value(record) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "Failed to serialize traffic record");
                return;
            }
        };

        let mut files = self
            .files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(file) = files.traffic.as_mut() {
            write_json_line(file, &entry, "traffic");
        }
    }

    pub fn log_error(&self, req: &Request, err: &Error) {
        error!(
            req_id = %req.id,
            domain = %req.domain,
            error = %err,
            "Request handling failed"
        );
    }

    /// Flush and drop the log file handles.
    pub fn close(&self) {
        let mut files = self
            .files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(file) = files.traffic.take() {
            drop(file);
        }
        if let Some(file) = files.decisions.take() {
            drop(file);
        }
    }
}

fn open_append(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Failed to create log directory, disabling file log"
                );
                return None;
            }
        }
    }

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "Failed to open log file, disabling file log"
            );
            None
        }
    }
}

fn write_json_line(file: &mut File, entry: &serde_json::Value, kind: &str) {
    if serde_json::to_writer(&mut *file, entry)
        .map_err(std::io::Error::from)
        .and_then(|_| file.write_all(b"\n"))
        .is_err()
    {
        warn!(kind, "Failed to write log entry");
    }
}
