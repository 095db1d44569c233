//! Mode-specific request routing.
//!
//! The router produces exactly one response per request: a simulated answer
//! in full mode, and a decision-driven forward/block/simulate answer in half
//! mode. It dispatches on the mode value the controller sampled at dispatch
//! start, never on shared mutable state, so each request is internally
//! consistent even when a mode switch races with it.
//!
//! Real network forwarding is out of scope: `forward` fabricates a
//! placeholder tagged [`ResponseSource::Real`]. This is the extension point
//! where an actual HTTP client belongs.

use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::{Mode, ServiceConfig};
use crate::decision::{Action, Decision};
use crate::error::Result;
use crate::request::{Request, Response, ResponseSource, protocols};

pub struct Router {
    services: ServiceConfig,
}

impl Router {
    pub fn new(services: ServiceConfig) -> Self {
        Self { services }
    }

    /// Produce a response for the request under the given mode.
    ///
    /// Always returns a response on success.
    pub async fn route_request(
        &self,
        mode: Mode,
        req: &Request,
        decision: &Decision,
    ) -> Result<Response> {
        match mode {
            Mode::Half => self.route_half_mode(req, decision).await,
            // Transparent traffic never reaches the router; if it does, the
            // safe answer is the isolation path.
            Mode::Full | Mode::Transparent => self.route_full_mode(req).await,
        }
    }

    /// Full mode: everything is answered by a simulation service.
    async fn route_full_mode(&self, req: &Request) -> Result<Response> {
        info!(
            req_id = %req.id,
            protocol = %req.protocol,
            domain = %req.domain,
            "Routing in full mode"
        );

        let service_addr = self.service_address(&req.protocol);

        let mut headers = HashMap::new();
        headers.insert("X-Sandgate-Mode".to_string(), "full".to_string());
        headers.insert("X-Sandgate-Source".to_string(), "simulated".to_string());
        headers.insert("X-Sandgate-Service".to_string(), service_addr.clone());

        let mut metadata = HashMap::new();
        metadata.insert("service".to_string(), service_addr.into());
        metadata.insert("mode".to_string(), "full".into());
        metadata.insert("isolated".to_string(), true.into());

        let body = simulated_body(req);

        let mut resp = Response {
            id: req.id.clone(),
            timestamp: req.timestamp,
            status_code: 200,
            headers,
            content_length: 0,
            body,
            source: ResponseSource::Simulated,
            decision: None,
            metadata,
        };
        resp.content_length = resp.body.len() as u64;

        Ok(resp)
    }

    /// Half mode: the decision's action governs.
    async fn route_half_mode(&self, req: &Request, decision: &Decision) -> Result<Response> {
        info!(
            req_id = %req.id,
            domain = %req.domain,
            action = %decision.action,
            rule = %decision.rule_name,
            "Routing in half mode"
        );

        match decision.action {
            // Content rewriting for `modify` happens in the controller
            // around routing; here both actions take the forward path.
            Action::Forward | Action::Modify => self.forward_placeholder(req).await,
            Action::Block => self.block_request(req, &decision.reason).await,
            Action::Simulate => self.route_full_mode(req).await,
        }
    }

    /// Placeholder for forwarding to the real destination.
    async fn forward_placeholder(&self, req: &Request) -> Result<Response> {
        warn!(
            req_id = %req.id,
            domain = %req.domain,
            ip = %req.ip,
            port = req.port,
            "Forwarding to real destination"
        );

        let mut headers = HashMap::new();
        headers.insert("X-Sandgate-Mode".to_string(), "half".to_string());
        headers.insert("X-Sandgate-Source".to_string(), "real".to_string());

        let mut metadata = HashMap::new();
        metadata.insert("mode".to_string(), "half".into());
        metadata.insert("action".to_string(), "forward".into());
        metadata.insert(
            "destination".to_string(),
            format!("{}:{}", req.domain, req.port).into(),
        );

        let body = bytes::Bytes::from(format!("Forwarded to {}", req.domain));

        let mut resp = Response {
            id: req.id.clone(),
            timestamp: req.timestamp,
            status_code: 200,
            headers,
            content_length: 0,
            body,
            source: ResponseSource::Real,
            decision: None,
            metadata,
        };
        resp.content_length = resp.body.len() as u64;

        Ok(resp)
    }

    /// Synthesize a denial for a blocked request.
    async fn block_request(&self, req: &Request, reason: &str) -> Result<Response> {
        warn!(
            req_id = %req.id,
            domain = %req.domain,
            reason = %reason,
            "Request blocked"
        );

        let mut headers = HashMap::new();
        headers.insert("X-Sandgate-Mode".to_string(), "half".to_string());
        headers.insert("X-Sandgate-Source".to_string(), "blocked".to_string());
        headers.insert("X-Sandgate-Reason".to_string(), reason.to_string());

        let mut metadata = HashMap::new();
        metadata.insert("mode".to_string(), "half".into());
        metadata.insert("action".to_string(), "block".into());
        metadata.insert("reason".to_string(), reason.into());

        let body = bytes::Bytes::from(format!("Request blocked: {reason}"));

        let mut resp = Response {
            id: req.id.clone(),
            timestamp: req.timestamp,
            status_code: 403,
            headers,
            content_length: 0,
            body,
            source: ResponseSource::Blocked,
            decision: None,
            metadata,
        };
        resp.content_length = resp.body.len() as u64;

        Ok(resp)
    }

    /// Resolve the simulation service address for a protocol.
    ///
    /// The per-protocol address wins over the handler name; unknown
    /// protocols default to the HTTP service.
    fn service_address(&self, protocol: &str) -> String {
        let (address, name) = match protocol {
            protocols::DNS => (&self.services.dns_address, &self.services.dns),
            protocols::HTTP => (&self.services.http_address, &self.services.http),
            protocols::HTTPS => (&self.services.https_address, &self.services.https),
            protocols::SMTP => (&self.services.smtp_address, &self.services.smtp),
            protocols::FTP => (&self.services.ftp_address, &self.services.ftp),
            _ => (&self.services.http_address, &self.services.http),
        };

        if address.is_empty() {
            name.clone()
        } else {
            address.clone()
        }
    }
}

/// A protocol-appropriate canned body for a simulated response.
fn simulated_body(req: &Request) -> bytes::Bytes {
    let content = match req.protocol.as_str() {
        protocols::DNS => format!("DNS response for {}: 127.0.0.1", req.domain),
        protocols::HTTP | protocols::HTTPS => format!(
            "<!DOCTYPE html>\n\
             <html>\n\
             <head><title>Simulated Response</title></head>\n\
             <body>\n\
             <h1>Sandgate Simulated Response</h1>\n\
             <p>Domain: {}</p>\n\
             <p>Path: {}</p>\n\
             <p>This is a simulated response for security analysis.</p>\n\
             </body>\n\
             </html>",
            req.domain, req.path
        ),
        protocols::SMTP => "250 OK - Simulated SMTP response".to_string(),
        protocols::FTP => "230 User logged in - Simulated FTP response".to_string(),
        other => format!("Simulated response for {other} protocol"),
    };
    bytes::Bytes::from(content)
}
