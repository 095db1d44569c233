//! Core traffic types: requests, responses, and the combined traffic record.
//!
//! A [`Request`] is produced by an upstream interceptor (or constructed
//! synthetically by a caller) and is never mutated in place once observed.
//! Pipeline stages that rewrite traffic produce a modified copy; the bodies
//! are [`Bytes`], so copies share the underlying buffer.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::decision::Decision;

/// Well-known protocol names as they appear in [`Request::protocol`].
///
/// The field itself stays a free-form string: traffic arrives from the
/// interceptor on a best-effort basis and may carry protocols this crate has
/// no special handling for.
pub mod protocols {
    pub const HTTP: &str = "HTTP";
    pub const HTTPS: &str = "HTTPS";
    pub const DNS: &str = "DNS";
    pub const SMTP: &str = "SMTP";
    pub const FTP: &str = "FTP";
    pub const TCP: &str = "TCP";
    pub const UDP: &str = "UDP";
    pub const ICMP: &str = "ICMP";
}

/// A network request observed from the sample under analysis.
///
/// Absent fields are zero-valued, not omitted: the interceptor fills in what
/// it could parse and leaves the rest at their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request ID.
    pub id: String,

    /// Request timestamp.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Network protocol (see [`protocols`]).
    #[serde(default)]
    pub protocol: String,

    /// HTTP method, when applicable.
    #[serde(default)]
    pub method: String,

    /// Destination domain.
    #[serde(default)]
    pub domain: String,

    /// Destination IP address.
    #[serde(default)]
    pub ip: String,

    /// Destination port.
    #[serde(default)]
    pub port: u16,

    /// URL path, when applicable.
    #[serde(default)]
    pub path: String,

    /// Query parameters (unique keys).
    #[serde(default)]
    pub query: HashMap<String, String>,

    /// Request headers (unique keys, case-sensitive as stored).
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body.
    #[serde(default)]
    pub body: Bytes,

    /// Content length in bytes.
    #[serde(default)]
    pub content_length: u64,

    /// Source IP address.
    #[serde(default)]
    pub source_ip: String,

    /// Source port.
    #[serde(default)]
    pub source_port: u16,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            id: String::new(),
            timestamp: Utc::now(),
            protocol: String::new(),
            method: String::new(),
            domain: String::new(),
            ip: String::new(),
            port: 0,
            path: String::new(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: Bytes::new(),
            content_length: 0,
            source_ip: String::new(),
            source_port: 0,
        }
    }
}

impl Request {
    /// Construct a request with a fresh ID and the current timestamp.
    pub fn new(protocol: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            protocol: protocol.into(),
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Fabricated by the simulation services path.
    Simulated,
    /// Came back from (a placeholder for) the real destination.
    Real,
    /// Synthesized denial.
    Blocked,
    /// Executable download replaced with a harmless placeholder.
    Sandboxed,
    /// Passive observation; traffic passed through untouched.
    TransparentPassthrough,
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Simulated => "simulated",
            Self::Real => "real",
            Self::Blocked => "blocked",
            Self::Sandboxed => "sandboxed",
            Self::TransparentPassthrough => "transparent_passthrough",
        };
        f.write_str(s)
    }
}

/// The response handed back to the caller for a handled request.
///
/// Created exactly once per request by the router or the transparent
/// observer; the controller attaches the [`Decision`] before returning it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Matches the originating [`Request::id`].
    pub id: String,

    /// Response timestamp.
    pub timestamp: DateTime<Utc>,

    /// HTTP status code, when applicable (zero otherwise).
    #[serde(default)]
    pub status_code: u16,

    /// Response headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body.
    #[serde(default)]
    pub body: Bytes,

    /// Content length in bytes.
    #[serde(default)]
    pub content_length: u64,

    /// Where this response came from.
    pub source: ResponseSource,

    /// The decision that produced this response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,

    /// Additional metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Response {
    /// Replace the body and keep `content_length` consistent with it.
    pub fn set_body(&mut self, body: Bytes) {
        self.content_length = body.len() as u64;
        self.body = body;
    }
}

/// One combined traffic log record, written per handled request.
///
/// Borrows the request/response so serialization does not clone bodies.
#[derive(Debug, Serialize)]
pub struct TrafficRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub request: &'a Request,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<&'a Response>,
    pub decision: &'a Decision,
    pub action: crate::decision::Action,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modifications: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}
