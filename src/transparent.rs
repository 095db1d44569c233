//! Passive traffic observation for transparent mode.
//!
//! In transparent mode nothing is altered: connections are tracked, the
//! application protocol is classified, and interesting payload data is
//! extracted and logged, but the traffic itself passes through untouched.
//! The observer's output contract is absolute: it never asks for blocking or
//! modification, and every response it produces is tagged
//! [`ResponseSource::TransparentPassthrough`].
//!
//! Connections are tracked for the lifetime of the observer; there is no
//! eviction. Long-running processes grow the table without bound.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{Mode, TransparentModeConfig};
use crate::error::{Error, Result};
use crate::request::{Request, Response, ResponseSource};

/// Connection key: 4-tuple plus transport protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnKey {
    src_ip: String,
    src_port: u16,
    dst_ip: String,
    dst_port: u16,
    protocol: String,
}

impl ConnKey {
    fn for_request(req: &Request) -> Self {
        Self {
            src_ip: req.source_ip.clone(),
            src_port: req.source_port,
            dst_ip: req.ip.clone(),
            dst_port: req.port,
            protocol: req.protocol.clone(),
        }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}/{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.protocol
        )
    }
}

/// A tracked logical connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Unique connection identifier.
    pub id: String,

    /// Transport protocol as reported by the interceptor.
    pub protocol: String,

    /// Identified application protocol, when classifiable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,

    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,

    /// Last-seen destination domain.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,

    pub start_time: DateTime<Utc>,

    /// Bytes sent by the sample over this connection.
    pub bytes_sent: u64,

    /// Bytes received by the sample. Response traffic is not observed by
    /// this pipeline, so this stays zero.
    pub bytes_received: u64,
}

/// Protocol-specific data extracted from a payload.
#[derive(Debug, Serialize)]
pub struct ExtractedPayload {
    pub connection_id: String,
    pub timestamp: DateTime<Utc>,
    pub protocol: String,
    /// `outgoing` (from the sample) or `incoming` (to the sample).
    pub direction: &'static str,
    #[serde(skip_serializing_if = "bytes::Bytes::is_empty")]
    pub raw_data: bytes::Bytes,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub parsed_data: HashMap<String, serde_json::Value>,
    /// Original payload size before truncation.
    pub size: u64,
    pub truncated: bool,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    tcp_connections: AtomicU64,
    udp_connections: AtomicU64,
    icmp_packets: AtomicU64,
    total_bytes_observed: AtomicU64,
    extracted_payloads: AtomicU64,
    unknown_protocols: AtomicU64,
}

#[derive(Default)]
struct LogWriters {
    connections: Option<BufWriter<File>>,
    payloads: Option<BufWriter<File>>,
}

#[derive(Clone, Copy)]
enum LogStream {
    Connection,
    Payload,
}

impl LogStream {
    fn name(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Payload => "payload",
        }
    }
}

/// Passive observer for transparent mode.
pub struct TransparentObserver {
    config: TransparentModeConfig,
    connections: RwLock<HashMap<ConnKey, ConnectionInfo>>,
    // One lock for both streams keeps interleaved JSON lines well-formed.
    writers: Mutex<LogWriters>,
    counters: Counters,
    protocol_breakdown: DashMap<String, u64>,
}

impl TransparentObserver {
    /// Create an observer. The configuration must be enabled.
    ///
    /// Log files that fail to open are disabled with a warning; their
    /// entries fall back to the structured logger.
    pub fn new(config: TransparentModeConfig) -> Result<Self> {
        if !config.enabled {
            return Err(Error::ModeNotEnabled(Mode::Transparent));
        }

        let mut writers = LogWriters::default();

        if config.log_connections {
            if let Some(path) = &config.connection_log_file {
                writers.connections = open_log_file(path);
            }
        }
        if config.extract_payloads {
            if let Some(path) = &config.payload_log_file {
                writers.payloads = open_log_file(path);
            }
        }

        info!(
            extract_payloads = config.extract_payloads,
            log_connections = config.log_connections,
            log_icmp = config.log_icmp,
            supported_protocols = ?config.supported_protocols,
            "Transparent observer initialized"
        );

        Ok(Self {
            config,
            connections: RwLock::new(HashMap::new()),
            writers: Mutex::new(writers),
            counters: Counters::default(),
            protocol_breakdown: DashMap::new(),
        })
    }

    /// Observe a request and pass it through.
    ///
    /// Never blocks or modifies; the returned response is always tagged
    /// `transparent_passthrough`.
    pub fn handle_request(&self, req: &Request) -> Response {
        let conn = self.track_connection(req);

        if self.config.log_connections {
            self.write_connection_log(&conn, "observed");
        }

        if self.config.extract_payloads {
            self.extract_and_log_payload(req, &conn);
        }

        if self.config.log_icmp && req.protocol.eq_ignore_ascii_case("ICMP") {
            self.counters.icmp_packets.fetch_add(1, Ordering::Relaxed);
            info!(
                src_ip = %req.source_ip,
                dst_ip = %req.ip,
                conn_id = %conn.id,
                "ICMP observed"
            );
        }

        self.counters
            .total_bytes_observed
            .fetch_add(req.content_length, Ordering::Relaxed);

        debug!(
            req_id = %req.id,
            protocol = %req.protocol,
            src = %format!("{}:{}", req.source_ip, req.source_port),
            dst = %format!("{}:{}", req.ip, req.port),
            domain = %req.domain,
            "Traffic observed, passing through unmodified"
        );

        let mut metadata = HashMap::new();
        metadata.insert("mode".to_string(), "transparent".into());
        metadata.insert("connection_id".to_string(), conn.id.clone().into());
        metadata.insert("action".to_string(), "passthrough".into());
        metadata.insert(
            "note".to_string(),
            "Traffic observed only - no modification applied".into(),
        );

        Response {
            id: req.id.clone(),
            timestamp: Utc::now(),
            status_code: 0,
            headers: HashMap::new(),
            body: bytes::Bytes::new(),
            content_length: 0,
            source: ResponseSource::TransparentPassthrough,
            decision: None,
            metadata,
        }
    }

    /// Track or update the connection record for a request, returning a
    /// snapshot of its current state.
    fn track_connection(&self, req: &Request) -> ConnectionInfo {
        let key = ConnKey::for_request(req);

        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(conn) = connections.get_mut(&key) {
            conn.bytes_sent += req.content_length;
            if !req.domain.is_empty() {
                conn.domain = req.domain.clone();
            }
            if conn.app_protocol.is_none() {
                conn.app_protocol = identify_app_protocol(req);
            }
            return conn.clone();
        }

        let conn = ConnectionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            protocol: req.protocol.clone(),
            app_protocol: identify_app_protocol(req),
            src_ip: req.source_ip.clone(),
            src_port: req.source_port,
            dst_ip: req.ip.clone(),
            dst_port: req.port,
            domain: req.domain.clone(),
            start_time: Utc::now(),
            bytes_sent: req.content_length,
            bytes_received: 0,
        };

        self.counters
            .total_connections
            .fetch_add(1, Ordering::Relaxed);
        match req.protocol.to_ascii_uppercase().as_str() {
            "TCP" => {
                self.counters.tcp_connections.fetch_add(1, Ordering::Relaxed);
            }
            "UDP" => {
                self.counters.udp_connections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        match &conn.app_protocol {
            Some(app) => {
                *self.protocol_breakdown.entry(app.clone()).or_insert(0) += 1;
            }
            None => {
                self.counters
                    .unknown_protocols
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        let snapshot = conn.clone();
        connections.insert(key, conn);
        snapshot
    }

    /// Extract protocol-specific payload data for supported protocols and
    /// append it to the payload log.
    fn extract_and_log_payload(&self, req: &Request, conn: &ConnectionInfo) {
        let app_protocol = conn
            .app_protocol
            .clone()
            .or_else(|| identify_app_protocol(req));

        let Some(app_protocol) = app_protocol else {
            return;
        };
        if !self.is_protocol_supported(&app_protocol) {
            return;
        }

        let mut raw_data = req.body.clone();
        let mut truncated = false;
        if self.config.max_payload_size > 0
            && raw_data.len() as u64 > self.config.max_payload_size
        {
            raw_data = raw_data.slice(0..self.config.max_payload_size as usize);
            truncated = true;
        }

        let mut parsed_data = HashMap::new();
        match app_protocol.as_str() {
            "HTTP" | "HTTPS" => parse_http_payload(req, &mut parsed_data),
            "DNS" => parse_dns_payload(req, &mut parsed_data),
            "SMTP" => parse_smtp_payload(req, &mut parsed_data),
            "FTP" => parse_ftp_payload(req, &mut parsed_data),
            _ => {}
        }

        let payload = ExtractedPayload {
            connection_id: conn.id.clone(),
            timestamp: Utc::now(),
            protocol: app_protocol.clone(),
            direction: "outgoing",
            raw_data,
            parsed_data,
            size: req.content_length,
            truncated,
        };

        match serde_json::to_value(&payload) {
            Ok(value) => self.write_json_line(LogStream::Payload, &value),
            Err(err) => warn!(error = %err, "Failed to serialize payload entry"),
        }

        self.counters
            .extracted_payloads
            .fetch_add(1, Ordering::Relaxed);

        debug!(
            protocol = %app_protocol,
            conn_id = %conn.id,
            size = req.content_length,
            truncated,
            "Payload extracted"
        );
    }

    fn is_protocol_supported(&self, protocol: &str) -> bool {
        self.config
            .supported_protocols
            .iter()
            .any(|p| p.eq_ignore_ascii_case(protocol))
    }

    fn write_connection_log(&self, conn: &ConnectionInfo, event: &str) {
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "connection_id": conn.id,
            "protocol": conn.protocol,
            "app_protocol": conn.app_protocol,
            "src": format!("{}:{}", conn.src_ip, conn.src_port),
            "dst": format!("{}:{}", conn.dst_ip, conn.dst_port),
            "domain": conn.domain,
            "bytes_sent": conn.bytes_sent,
        });
        self.write_json_line(LogStream::Connection, &entry);
    }

    /// Append one JSON line to the given stream, falling back to the
    /// structured logger when no file is configured.
    fn write_json_line(&self, stream: LogStream, value: &serde_json::Value) {
        let mut writers = self
            .writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let writer = match stream {
            LogStream::Connection => &mut writers.connections,
            LogStream::Payload => &mut writers.payloads,
        };

        match writer {
            Some(w) => {
                if serde_json::to_writer(&mut *w, value)
                    .map_err(std::io::Error::from)
                    .and_then(|_| w.write_all(b"\n"))
                    .and_then(|_| w.flush())
                    .is_err()
                {
                    warn!(stream = stream.name(), "Failed to write log entry");
                }
            }
            None => {
                info!(
                    stream = stream.name(),
                    data = %value,
                    "Transparent log entry"
                );
            }
        }
    }

    /// Point-in-time statistics snapshot.
    pub fn connection_stats(&self) -> HashMap<String, serde_json::Value> {
        let mut stats = HashMap::new();
        stats.insert(
            "total_connections".to_string(),
            self.counters.total_connections.load(Ordering::Relaxed).into(),
        );
        stats.insert(
            "tcp_connections".to_string(),
            self.counters.tcp_connections.load(Ordering::Relaxed).into(),
        );
        stats.insert(
            "udp_connections".to_string(),
            self.counters.udp_connections.load(Ordering::Relaxed).into(),
        );
        stats.insert(
            "icmp_packets".to_string(),
            self.counters.icmp_packets.load(Ordering::Relaxed).into(),
        );
        stats.insert(
            "total_bytes".to_string(),
            self.counters
                .total_bytes_observed
                .load(Ordering::Relaxed)
                .into(),
        );
        stats.insert(
            "extracted_payloads".to_string(),
            self.counters
                .extracted_payloads
                .load(Ordering::Relaxed)
                .into(),
        );
        stats.insert(
            "unknown_protocols".to_string(),
            self.counters
                .unknown_protocols
                .load(Ordering::Relaxed)
                .into(),
        );

        let mut breakdown = serde_json::Map::new();
        for entry in self.protocol_breakdown.iter() {
            breakdown.insert(entry.key().clone(), (*entry.value()).into());
        }
        stats.insert(
            "protocol_breakdown".to_string(),
            serde_json::Value::Object(breakdown),
        );

        stats
    }

    /// Snapshot of all tracked connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Human-readable traffic summary for operator visibility.
    pub fn print_summary(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "\n=== TRANSPARENT MODE TRAFFIC SUMMARY ===");
        let _ = writeln!(
            out,
            "Total Connections:    {}",
            self.counters.total_connections.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  TCP:                {}",
            self.counters.tcp_connections.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  UDP:                {}",
            self.counters.udp_connections.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "  ICMP packets:       {}",
            self.counters.icmp_packets.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "Total Bytes Observed: {}",
            self.counters.total_bytes_observed.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "Extracted Payloads:   {}",
            self.counters.extracted_payloads.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "Unknown Protocols:    {}",
            self.counters.unknown_protocols.load(Ordering::Relaxed)
        );

        let _ = writeln!(out, "\nProtocol Breakdown:");
        for entry in self.protocol_breakdown.iter() {
            let _ = writeln!(out, "  {:<10}: {} connections", entry.key(), entry.value());
        }

        let connections = self
            .connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = writeln!(out, "\nTracked Connections ({}):", connections.len());
        for conn in connections.values() {
            let _ = write!(
                out,
                "  [{}] {}:{} -> {}:{}",
                conn.protocol, conn.src_ip, conn.src_port, conn.dst_ip, conn.dst_port
            );
            if !conn.domain.is_empty() {
                let _ = write!(out, " ({})", conn.domain);
            }
            if let Some(app) = &conn.app_protocol {
                let _ = write!(out, " [{app}]");
            }
            let _ = writeln!(out, " sent={} bytes", conn.bytes_sent);
        }

        let _ = writeln!(out, "=========================================");
        out
    }

    /// Flush log writers.
    pub fn close(&self) {
        let mut writers = self
            .writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(w) = writers.connections.as_mut() {
            let _ = w.flush();
        }
        if let Some(w) = writers.payloads.as_mut() {
            let _ = w.flush();
        }
    }
}

/// Open a log file for appending, creating parent directories as needed.
fn open_log_file(path: &Path) -> Option<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Failed to create log directory, falling back to structured logger"
                );
                return None;
            }
        }
    }

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(BufWriter::new(file)),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "Failed to open log file, falling back to structured logger"
            );
            None
        }
    }
}

/// Classify the application protocol of a request.
///
/// Precedence: already-identified named protocol, destination port,
/// payload prefix. Unclassifiable traffic yields `None`.
fn identify_app_protocol(req: &Request) -> Option<String> {
    let named = req.protocol.to_ascii_uppercase();
    if matches!(named.as_str(), "HTTP" | "HTTPS" | "DNS" | "SMTP" | "FTP") {
        return Some(named);
    }

    if let Some(proto) = protocol_for_port(req.port) {
        return Some(proto.to_string());
    }

    sniff_payload(&req.body)
}

fn protocol_for_port(port: u16) -> Option<&'static str> {
    match port {
        80 => Some("HTTP"),
        443 => Some("HTTPS"),
        53 => Some("DNS"),
        25 | 587 => Some("SMTP"),
        465 => Some("SMTPS"),
        21 => Some("FTP"),
        22 => Some("SSH"),
        110 => Some("POP3"),
        143 => Some("IMAP"),
        _ => None,
    }
}

fn sniff_payload(body: &[u8]) -> Option<String> {
    if body.len() < 4 {
        return None;
    }

    if body.starts_with(b"GET ")
        || body.starts_with(b"POST")
        || body.starts_with(b"PUT ")
        || body.starts_with(b"HEAD")
    {
        return Some("HTTP".to_string());
    }

    match &body[..4] {
        b"EHLO" | b"HELO" | b"MAIL" => Some("SMTP".to_string()),
        b"USER" | b"PASS" | b"RETR" => Some("FTP".to_string()),
        _ => None,
    }
}

/// HTTP payload extraction: request line data, headers of interest, and a
/// reconstructed URL.
fn parse_http_payload(req: &Request, parsed: &mut HashMap<String, serde_json::Value>) {
    if !req.method.is_empty() {
        parsed.insert("method".to_string(), req.method.clone().into());
    }
    if !req.path.is_empty() {
        parsed.insert("path".to_string(), req.path.clone().into());
    }
    if !req.domain.is_empty() {
        parsed.insert("host".to_string(), req.domain.clone().into());
    }
    if !req.headers.is_empty() {
        if let Ok(headers) = serde_json::to_value(&req.headers) {
            parsed.insert("headers".to_string(), headers);
        }
    }
    if !req.query.is_empty() {
        if let Ok(query) = serde_json::to_value(&req.query) {
            parsed.insert("query_params".to_string(), query);
        }
    }

    // User-Agent helps fingerprint the sample's HTTP stack.
    if let Some(ua) = req.header("User-Agent") {
        parsed.insert("user_agent".to_string(), ua.into());
    }

    let interesting = [
        "Authorization",
        "X-Api-Key",
        "X-Auth-Token",
        "Cookie",
        "Referer",
        "Origin",
    ];
    let mut sensitive = serde_json::Map::new();
    for name in interesting {
        if let Some(value) = req.header(name) {
            sensitive.insert(name.to_string(), value.into());
        }
    }
    if !sensitive.is_empty() {
        parsed.insert(
            "sensitive_headers".to_string(),
            serde_json::Value::Object(sensitive),
        );
    }

    if !req.domain.is_empty() && !req.path.is_empty() {
        let scheme = if req.port == 443 { "https" } else { "http" };
        parsed.insert(
            "full_url".to_string(),
            format!("{scheme}://{}{}", req.domain, req.path).into(),
        );
    }

    if let Some(ct) = req.header("Content-Type") {
        parsed.insert("content_type".to_string(), ct.into());
        let body_type = if ct.contains("application/x-www-form-urlencoded") {
            Some("form_data")
        } else if ct.contains("application/json") {
            Some("json")
        } else if ct.contains("multipart") {
            Some("multipart")
        } else {
            None
        };
        if let Some(body_type) = body_type {
            parsed.insert("body_type".to_string(), body_type.into());
        }
    }
}

/// DNS payload extraction: the queried domain and port classification.
fn parse_dns_payload(req: &Request, parsed: &mut HashMap<String, serde_json::Value>) {
    if !req.domain.is_empty() {
        parsed.insert("queried_domain".to_string(), req.domain.clone().into());
    }
    parsed.insert("dst_ip".to_string(), req.ip.clone().into());

    if req.port == 53 {
        parsed.insert("dns_port".to_string(), "standard".into());
    } else if req.port == 853 {
        parsed.insert("dns_port".to_string(), "DNS_over_TLS".into());
    }
}

/// SMTP payload extraction. Only envelope commands are recorded; anything
/// resembling credentials (AUTH exchanges, message bodies) is excluded.
fn parse_smtp_payload(req: &Request, parsed: &mut HashMap<String, serde_json::Value>) {
    if req.body.is_empty() {
        return;
    }

    let body = String::from_utf8_lossy(&req.body).to_string();
    let mut commands = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let upper = line.to_ascii_uppercase();
        if upper.starts_with("EHLO")
            || upper.starts_with("HELO")
            || upper.starts_with("MAIL FROM")
            || upper.starts_with("RCPT TO")
        {
            commands.push(line.to_string());
        }
    }

    if !commands.is_empty() {
        if let Ok(commands) = serde_json::to_value(&commands) {
            parsed.insert("smtp_commands".to_string(), commands);
        }
    }
    parsed.insert("dst_ip".to_string(), req.ip.clone().into());
    parsed.insert("dst_port".to_string(), req.port.into());
}

/// FTP payload extraction. `USER` arguments and a small whitelist of benign
/// commands are recorded; `PASS` is deliberately excluded.
fn parse_ftp_payload(req: &Request, parsed: &mut HashMap<String, serde_json::Value>) {
    if req.body.is_empty() {
        return;
    }

    let body = String::from_utf8_lossy(&req.body).trim().to_string();
    let upper = body.to_ascii_uppercase();

    if upper.starts_with("USER") {
        if let Some((_, arg)) = body.split_once(' ') {
            parsed.insert("ftp_user".to_string(), arg.to_string().into());
        }
    } else if upper.starts_with("RETR")
        || upper.starts_with("STOR")
        || upper.starts_with("LIST")
        || upper.starts_with("CWD")
        || upper.starts_with("PWD")
    {
        parsed.insert("ftp_command".to_string(), body.clone().into());
    }

    parsed.insert("dst_ip".to_string(), req.ip.clone().into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::protocols;

    fn observer() -> TransparentObserver {
        TransparentObserver::new(TransparentModeConfig {
            enabled: true,
            ..TransparentModeConfig::default()
        })
        .unwrap()
    }

    fn tcp_request(src_port: u16, dst_port: u16) -> Request {
        let mut req = Request::new(protocols::TCP, "");
        req.source_ip = "192.168.1.100".to_string();
        req.source_port = src_port;
        req.ip = "93.184.216.34".to_string();
        req.port = dst_port;
        req.body = bytes::Bytes::from_static(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        req.content_length = req.body.len() as u64;
        req
    }

    #[test]
    fn construction_requires_enabled_config() {
        let result = TransparentObserver::new(TransparentModeConfig::default());
        assert!(matches!(result, Err(Error::ModeNotEnabled(_))));
    }

    #[test]
    fn passthrough_response_never_modifies() {
        let observer = observer();
        let req = tcp_request(54321, 80);

        let resp = observer.handle_request(&req);
        assert_eq!(resp.source, ResponseSource::TransparentPassthrough);
        assert!(resp.body.is_empty());
        assert_eq!(resp.metadata["action"], "passthrough");
        assert_eq!(resp.id, req.id);
    }

    #[test]
    fn same_four_tuple_updates_one_connection() {
        let observer = observer();

        let req = tcp_request(54321, 80);
        observer.handle_request(&req);
        observer.handle_request(&req);

        let stats = observer.connection_stats();
        assert_eq!(stats["total_connections"], 1);

        let connections = observer.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].bytes_sent, 2 * req.content_length);
    }

    #[test]
    fn distinct_four_tuples_create_distinct_connections() {
        let observer = observer();

        observer.handle_request(&tcp_request(54321, 80));
        observer.handle_request(&tcp_request(54322, 80));
        observer.handle_request(&tcp_request(54321, 443));

        let stats = observer.connection_stats();
        assert_eq!(stats["total_connections"], 3);
        assert_eq!(stats["tcp_connections"], 3);
    }

    #[test]
    fn classification_prefers_named_protocol() {
        let mut req = Request::new("https", "example.com");
        req.port = 8443;
        assert_eq!(identify_app_protocol(&req).as_deref(), Some("HTTPS"));
    }

    #[test]
    fn classification_falls_back_to_port_then_payload() {
        let mut req = Request::new(protocols::TCP, "");
        req.port = 25;
        assert_eq!(identify_app_protocol(&req).as_deref(), Some("SMTP"));

        let mut req = Request::new(protocols::TCP, "");
        req.port = 50000;
        req.body = bytes::Bytes::from_static(b"EHLO mail.example\r\n");
        assert_eq!(identify_app_protocol(&req).as_deref(), Some("SMTP"));

        let mut req = Request::new(protocols::TCP, "");
        req.port = 50000;
        req.body = bytes::Bytes::from_static(b"USER anonymous\r\n");
        assert_eq!(identify_app_protocol(&req).as_deref(), Some("FTP"));
    }

    #[test]
    fn unclassifiable_traffic_counts_as_unknown() {
        let observer = observer();
        let mut req = tcp_request(40000, 50000);
        req.body = bytes::Bytes::from_static(b"\x00\x01\x02\x03");
        req.content_length = 4;

        observer.handle_request(&req);

        let stats = observer.connection_stats();
        assert_eq!(stats["unknown_protocols"], 1);
    }

    #[test]
    fn payload_extraction_respects_supported_protocols() {
        let observer = TransparentObserver::new(TransparentModeConfig {
            enabled: true,
            supported_protocols: vec!["dns".to_string()],
            ..TransparentModeConfig::default()
        })
        .unwrap();

        // HTTP is classified but not in the allowlist.
        observer.handle_request(&tcp_request(54321, 80));
        assert_eq!(observer.connection_stats()["extracted_payloads"], 0);

        let mut dns = Request::new(protocols::DNS, "c2.example");
        dns.port = 53;
        dns.source_port = 5353;
        dns.body = bytes::Bytes::from_static(b"query-bytes");
        dns.content_length = 11;
        observer.handle_request(&dns);
        assert_eq!(observer.connection_stats()["extracted_payloads"], 1);
    }

    #[test]
    fn icmp_packets_are_counted() {
        let observer = observer();
        let mut req = Request::new(protocols::ICMP, "");
        req.source_ip = "192.168.1.100".to_string();
        req.ip = "8.8.8.8".to_string();

        observer.handle_request(&req);
        observer.handle_request(&req);

        assert_eq!(observer.connection_stats()["icmp_packets"], 2);
    }

    #[test]
    fn http_extraction_reconstructs_url_and_sensitive_headers() {
        let mut req = Request::new(protocols::HTTP, "evil.example");
        req.method = "POST".to_string();
        req.path = "/gate.php".to_string();
        req.port = 443;
        req.headers
            .insert("Authorization".to_string(), "Bearer stolen".to_string());
        req.headers
            .insert("User-Agent".to_string(), "Sample/1.0".to_string());
        req.headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );

        let mut parsed = HashMap::new();
        parse_http_payload(&req, &mut parsed);

        assert_eq!(parsed["full_url"], "https://evil.example/gate.php");
        assert_eq!(parsed["user_agent"], "Sample/1.0");
        assert_eq!(parsed["body_type"], "form_data");
        assert_eq!(parsed["sensitive_headers"]["Authorization"], "Bearer stolen");
    }

    #[test]
    fn smtp_extraction_excludes_credentials() {
        let mut req = Request::new(protocols::SMTP, "");
        req.ip = "10.0.0.5".to_string();
        req.port = 25;
        req.body = bytes::Bytes::from_static(
            b"EHLO sample.local\r\nAUTH PLAIN c2VjcmV0\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\n",
        );

        let mut parsed = HashMap::new();
        parse_smtp_payload(&req, &mut parsed);

        let commands = parsed["smtp_commands"].as_array().unwrap();
        assert_eq!(commands.len(), 3);
        assert!(commands.iter().all(|c| !c.as_str().unwrap().contains("AUTH")));
    }

    #[test]
    fn ftp_extraction_excludes_pass() {
        let mut user = Request::new(protocols::FTP, "");
        user.body = bytes::Bytes::from_static(b"USER backdoor\r\n");
        let mut parsed = HashMap::new();
        parse_ftp_payload(&user, &mut parsed);
        assert_eq!(parsed["ftp_user"], "backdoor");

        let mut pass = Request::new(protocols::FTP, "");
        pass.body = bytes::Bytes::from_static(b"PASS hunter2\r\n");
        let mut parsed = HashMap::new();
        parse_ftp_payload(&pass, &mut parsed);
        assert!(!parsed.contains_key("ftp_command"));
        assert!(!parsed.contains_key("ftp_user"));
    }

    #[test]
    fn payloads_are_truncated_to_configured_maximum() {
        let observer = TransparentObserver::new(TransparentModeConfig {
            enabled: true,
            max_payload_size: 8,
            connection_log_file: None,
            payload_log_file: None,
            ..TransparentModeConfig::default()
        })
        .unwrap();

        let mut req = tcp_request(54321, 80);
        req.body = bytes::Bytes::from_static(b"GET /a-very-long-path HTTP/1.1\r\n");
        req.content_length = req.body.len() as u64;
        observer.handle_request(&req);

        assert_eq!(observer.connection_stats()["extracted_payloads"], 1);
    }

    #[test]
    fn connection_and_payload_logs_are_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let conn_log = dir.path().join("connections.log");
        let payload_log = dir.path().join("payloads.log");

        let observer = TransparentObserver::new(TransparentModeConfig {
            enabled: true,
            connection_log_file: Some(conn_log.clone()),
            payload_log_file: Some(payload_log.clone()),
            ..TransparentModeConfig::default()
        })
        .unwrap();

        observer.handle_request(&tcp_request(54321, 80));
        observer.handle_request(&tcp_request(54321, 80));
        observer.close();

        let conn_lines = std::fs::read_to_string(&conn_log).unwrap();
        let conn_entries: Vec<serde_json::Value> = conn_lines
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(conn_entries.len(), 2);
        assert_eq!(conn_entries[0]["event"], "observed");
        assert_eq!(conn_entries[0]["src"], "192.168.1.100:54321");

        let payload_lines = std::fs::read_to_string(&payload_log).unwrap();
        let payload_entries: Vec<serde_json::Value> = payload_lines
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(payload_entries.len(), 2);
        assert_eq!(payload_entries[0]["protocol"], "HTTP");
        assert_eq!(payload_entries[0]["direction"], "outgoing");
    }

    #[test]
    fn summary_reflects_observed_traffic() {
        let observer = observer();
        observer.handle_request(&tcp_request(54321, 80));

        let summary = observer.print_summary();
        assert!(summary.contains("TRANSPARENT MODE TRAFFIC SUMMARY"));
        assert!(summary.contains("Total Connections:    1"));
        assert!(summary.contains("HTTP"));
    }
}
