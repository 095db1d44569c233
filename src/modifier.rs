//! Request/response rewriting: header surgery, PII redaction, and
//! executable sandboxing.
//!
//! Modification never fails from the caller's point of view. Request-side
//! rewriting is pure; response-side sandbox persistence can fail internally,
//! but failures are logged and the placeholder substitution proceeds anyway.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::TrafficModifierConfig;
use crate::decision::{Modifier, ModifierKind};
use crate::request::{Request, Response, ResponseSource};

/// Authentication headers removed when global auth stripping is on.
const AUTH_HEADERS: [&str; 4] = ["Authorization", "Cookie", "X-Auth-Token", "X-API-Key"];

/// Tokens replaced by the PII redaction pass, longest-overlap first so
/// `password` is consumed before `passwd` and `pwd` can partially match.
const PII_TOKENS: [(&str, &str); 6] = [
    ("password", "[REDACTED_PASSWORD]"),
    ("passwd", "[REDACTED_PASSWORD]"),
    ("pwd", "[REDACTED_PASSWORD]"),
    ("token", "[REDACTED_TOKEN]"),
    ("secret", "[REDACTED_SECRET]"),
    ("key", "[REDACTED_KEY]"),
];

/// Rewrites traffic chosen for modification by the decision engine.
pub struct TrafficModifier {
    config: TrafficModifierConfig,
}

impl TrafficModifier {
    pub fn new(config: TrafficModifierConfig) -> Self {
        Self { config }
    }

    /// Apply a modifier to a request, returning a modified copy.
    ///
    /// A no-op (clone of the original) when the modifier subsystem is
    /// disabled or no modifier is given.
    pub fn modify_request(&self, req: &Request, modifier: Option<&Modifier>) -> Request {
        let Some(modifier) = modifier else {
            return req.clone();
        };
        if !self.config.enabled {
            return req.clone();
        }

        let mut modified = req.clone();

        if !modifier.strip_headers.is_empty() {
            for header in &modifier.strip_headers {
                modified.headers.remove(header);
            }
            info!(
                req_id = %req.id,
                headers = ?modifier.strip_headers,
                "Stripped headers from request"
            );
        }

        if !modifier.inject_headers.is_empty() {
            for (key, value) in &modifier.inject_headers {
                modified.headers.insert(key.clone(), value.clone());
            }
            info!(
                req_id = %req.id,
                headers = ?modifier.inject_headers,
                "Injected headers into request"
            );
        }

        if self.config.strip_auth_headers {
            for header in AUTH_HEADERS {
                modified.headers.remove(header);
            }
        }

        if self.config.inject_tracking_headers {
            modified
                .headers
                .insert("X-Sandgate-Analysis".to_string(), "true".to_string());
            modified
                .headers
                .insert("X-Sandgate-Request-ID".to_string(), req.id.clone());
            modified.headers.insert(
                "X-Sandgate-Timestamp".to_string(),
                req.timestamp.to_rfc3339(),
            );
        }

        modified
    }

    /// Apply a modifier to a response.
    ///
    /// Applies, in order: size truncation, executable sandboxing (which
    /// short-circuits the remaining steps), full-content logging, and PII
    /// redaction.
    pub async fn modify_response(
        &self,
        resp: Response,
        req: &Request,
        modifier: Option<&Modifier>,
    ) -> Response {
        let Some(modifier) = modifier else {
            return resp;
        };
        if !self.config.enabled {
            return resp;
        }

        let mut modified = resp;

        if self.config.max_response_size > 0
            && modified.content_length > self.config.max_response_size
        {
            warn!(
                req_id = %req.id,
                original_size = modified.content_length,
                max_size = self.config.max_response_size,
                "Response size exceeds limit, truncating"
            );
            let keep = (self.config.max_response_size as usize).min(modified.body.len());
            modified.body = modified.body.slice(0..keep);
            modified.content_length = self.config.max_response_size.min(modified.content_length);
        }

        if modifier.kind == ModifierKind::SandboxExecutable && self.config.sandbox_executables {
            return self.sandbox_executable(&modified, req, modifier).await;
        }

        if modifier.log_full_content {
            info!(
                req_id = %req.id,
                content_length = modified.content_length,
                body = %String::from_utf8_lossy(&modified.body),
                "Full response content"
            );
        }

        if modifier.strip_pii {
            modified.set_body(strip_pii(&modified.body));
        }

        modified
    }

    /// Replace an executable download with a harmless placeholder,
    /// optionally preserving the original for offline analysis.
    async fn sandbox_executable(
        &self,
        resp: &Response,
        req: &Request,
        modifier: &Modifier,
    ) -> Response {
        warn!(
            domain = %req.domain,
            path = %req.path,
            size = resp.content_length,
            "Executable download detected"
        );

        if modifier.save_original {
            if let Err(err) = self.save_artifact(req, resp).await {
                error!(
                    req_id = %req.id,
                    error = %err,
                    "Failed to save sandboxed artifact"
                );
            }
        }

        let body = placeholder_body(req);

        let mut headers = resp.headers.clone();
        headers.insert("X-Sandgate-Sandboxed".to_string(), "true".to_string());
        headers.insert(
            "X-Sandgate-Original-Size".to_string(),
            resp.content_length.to_string(),
        );
        headers.insert("Content-Length".to_string(), body.len().to_string());

        let placeholder = Response {
            id: resp.id.clone(),
            timestamp: resp.timestamp,
            status_code: 200,
            headers,
            content_length: body.len() as u64,
            body,
            source: ResponseSource::Sandboxed,
            decision: resp.decision.clone(),
            metadata: HashMap::new(),
        };

        info!(
            req_id = %req.id,
            original_size = resp.content_length,
            placeholder_size = placeholder.content_length,
            "Executable sandboxed"
        );

        placeholder
    }

    /// Persist the original body plus a JSON sidecar of request metadata.
    ///
    /// The sidecar write is best-effort; only the artifact write itself is
    /// an error.
    async fn save_artifact(&self, req: &Request, resp: &Response) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config.sandbox_dir).await?;

        let digest = Sha256::digest(&resp.body);
        let short = hex::encode(&digest[..8]);
        let file_name = format!("{short}_{}", artifact_basename(&req.path));
        let full_path = self.config.sandbox_dir.join(&file_name);

        tokio::fs::write(&full_path, &resp.body).await?;

        let metadata = serde_json::json!({
            "request_id": req.id,
            "timestamp": req.timestamp.to_rfc3339(),
            "domain": req.domain,
            "path": req.path,
            "size": resp.content_length,
            "sha256": hex::encode(digest),
            "headers": req.headers,
        });

        let mut sidecar = full_path.clone().into_os_string();
        sidecar.push(".metadata.json");
        let sidecar = PathBuf::from(sidecar);

        match serde_json::to_vec_pretty(&metadata) {
            Ok(json) => {
                if let Err(err) = tokio::fs::write(&sidecar, json).await {
                    warn!(
                        path = %sidecar.display(),
                        error = %err,
                        "Failed to write artifact metadata"
                    );
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to serialize artifact metadata");
            }
        }

        info!(
            req_id = %req.id,
            path = %full_path.display(),
            size = resp.content_length,
            "Sandboxed artifact saved"
        );

        Ok(())
    }
}

/// Basename of the request path for the artifact filename, with a fallback
/// when the path has no usable final component.
fn artifact_basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "/")
        .unwrap_or("download.bin")
}

/// Harmless placeholder content substituted for a sandboxed download.
fn placeholder_body(req: &Request) -> Bytes {
    let content = format!(
        "# Sandgate sandbox placeholder\n\
         # This file stands in for a download withheld during analysis\n\
         # Original request: {}\n\
         # Domain: {}\n\
         # Path: {}\n\
         # Timestamp: {}\n\
         # Request ID: {}\n",
        req.method,
        req.domain,
        req.path,
        req.timestamp.to_rfc3339(),
        req.id,
    );
    Bytes::from(content)
}

/// Replace known sensitive tokens with redaction markers.
///
/// The replacement operates on a lower-cased copy of the whole body, so
/// redacted bodies lose their original casing even in non-sensitive content.
fn strip_pii(data: &[u8]) -> Bytes {
    let mut content = String::from_utf8_lossy(data).to_ascii_lowercase();
    for (token, marker) in PII_TOKENS {
        content = content.replace(token, marker);
    }
    Bytes::from(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::protocols;

    fn config() -> TrafficModifierConfig {
        TrafficModifierConfig {
            enabled: true,
            strip_auth_headers: false,
            inject_tracking_headers: false,
            ..TrafficModifierConfig::default()
        }
    }

    fn request() -> Request {
        let mut req = Request::new(protocols::HTTP, "files.example");
        req.method = "GET".to_string();
        req.path = "/payload.exe".to_string();
        req
    }

    fn response(body: &'static [u8]) -> Response {
        Response {
            id: "resp-1".to_string(),
            timestamp: chrono::Utc::now(),
            status_code: 200,
            headers: HashMap::new(),
            body: Bytes::from_static(body),
            content_length: body.len() as u64,
            source: ResponseSource::Real,
            decision: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn disabled_modifier_returns_original_request() {
        let modifier = TrafficModifier::new(TrafficModifierConfig {
            enabled: false,
            ..config()
        });
        let mut req = request();
        req.headers
            .insert("Authorization".to_string(), "Bearer x".to_string());

        let instructions = Modifier {
            strip_headers: vec!["Authorization".to_string()],
            ..Modifier::of_kind(ModifierKind::ContentLogging)
        };
        let out = modifier.modify_request(&req, Some(&instructions));
        assert_eq!(out.headers.get("Authorization").map(String::as_str), Some("Bearer x"));
    }

    #[test]
    fn strips_and_injects_headers() {
        let modifier = TrafficModifier::new(config());
        let mut req = request();
        req.headers
            .insert("X-Evil-Beacon".to_string(), "1".to_string());

        let mut inject = HashMap::new();
        inject.insert("X-Replaced".to_string(), "yes".to_string());
        let instructions = Modifier {
            strip_headers: vec!["X-Evil-Beacon".to_string()],
            inject_headers: inject,
            ..Modifier::of_kind(ModifierKind::ContentLogging)
        };

        let out = modifier.modify_request(&req, Some(&instructions));
        assert!(!out.headers.contains_key("X-Evil-Beacon"));
        assert_eq!(out.headers.get("X-Replaced").map(String::as_str), Some("yes"));
        // The original is untouched.
        assert!(req.headers.contains_key("X-Evil-Beacon"));
    }

    #[test]
    fn global_auth_stripping_applies_regardless_of_rule_modifier() {
        let modifier = TrafficModifier::new(TrafficModifierConfig {
            strip_auth_headers: true,
            ..config()
        });
        let mut req = request();
        for h in AUTH_HEADERS {
            req.headers.insert(h.to_string(), "secret".to_string());
        }

        let instructions = Modifier::of_kind(ModifierKind::ContentLogging);
        let out = modifier.modify_request(&req, Some(&instructions));
        for h in AUTH_HEADERS {
            assert!(!out.headers.contains_key(h), "{h} should be stripped");
        }
    }

    #[test]
    fn tracking_headers_are_stamped_unconditionally() {
        let modifier = TrafficModifier::new(TrafficModifierConfig {
            inject_tracking_headers: true,
            ..config()
        });
        let req = request();

        let instructions = Modifier::of_kind(ModifierKind::ContentLogging);
        let out = modifier.modify_request(&req, Some(&instructions));
        assert_eq!(
            out.headers.get("X-Sandgate-Analysis").map(String::as_str),
            Some("true")
        );
        assert_eq!(
            out.headers.get("X-Sandgate-Request-ID"),
            Some(&req.id)
        );
        assert!(out.headers.contains_key("X-Sandgate-Timestamp"));
    }

    #[tokio::test]
    async fn truncates_oversized_responses() {
        let modifier = TrafficModifier::new(TrafficModifierConfig {
            max_response_size: 4,
            ..config()
        });
        let resp = response(b"0123456789");
        let instructions = Modifier::of_kind(ModifierKind::ContentLogging);

        let out = modifier
            .modify_response(resp, &request(), Some(&instructions))
            .await;
        assert_eq!(&out.body[..], b"0123");
        assert_eq!(out.content_length, 4);
    }

    #[tokio::test]
    async fn pii_redaction_is_lossy_and_lower_cases() {
        let modifier = TrafficModifier::new(config());
        let resp = response(b"User=Alice PASSWORD=hunter2 Token=abc Plain=HELLO");
        let instructions = Modifier {
            strip_pii: true,
            ..Modifier::of_kind(ModifierKind::ContentLogging)
        };

        let out = modifier
            .modify_response(resp, &request(), Some(&instructions))
            .await;
        let body = String::from_utf8_lossy(&out.body).to_string();

        assert!(body.contains("[REDACTED_PASSWORD]"), "body: {body}");
        assert!(body.contains("[REDACTED_TOKEN]"), "body: {body}");
        // The whole body is lower-cased as part of redaction.
        assert!(body.contains("plain=hello"), "body: {body}");
        assert!(!body.contains("HELLO"));
        assert_eq!(out.content_length, out.body.len() as u64);
    }

    #[tokio::test]
    async fn sandboxes_executables_and_preserves_original() {
        let dir = tempfile::tempdir().unwrap();
        let modifier = TrafficModifier::new(TrafficModifierConfig {
            sandbox_executables: true,
            sandbox_dir: dir.path().to_path_buf(),
            ..config()
        });

        let req = request();
        let original: &'static [u8] = b"MZ\x90\x00fake-executable";
        let resp = response(original);
        let instructions = Modifier {
            save_original: true,
            ..Modifier::of_kind(ModifierKind::SandboxExecutable)
        };

        let out = modifier
            .modify_response(resp, &req, Some(&instructions))
            .await;

        assert_eq!(out.source, ResponseSource::Sandboxed);
        assert_eq!(out.status_code, 200);
        assert_eq!(
            out.headers.get("X-Sandgate-Sandboxed").map(String::as_str),
            Some("true")
        );
        assert_eq!(
            out.headers.get("X-Sandgate-Original-Size").map(String::as_str),
            Some(&*original.len().to_string())
        );
        assert_eq!(
            out.headers.get("Content-Length").map(String::as_str),
            Some(&*out.body.len().to_string())
        );

        let placeholder = String::from_utf8_lossy(&out.body).to_string();
        assert!(placeholder.contains(&req.id));
        assert!(placeholder.contains("files.example"));
        assert!(placeholder.contains("/payload.exe"));

        // The original body and its metadata sidecar landed on disk.
        let mut artifact = None;
        let mut sidecar = None;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if name.ends_with(".metadata.json") {
                sidecar = Some(path);
            } else if name.ends_with("_payload.exe") {
                artifact = Some(path);
            }
        }

        let artifact = artifact.expect("artifact file present");
        assert_eq!(std::fs::read(&artifact).unwrap(), original);

        let sidecar = sidecar.expect("metadata sidecar present");
        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&sidecar).unwrap()).unwrap();
        assert_eq!(meta["request_id"], req.id.as_str());
        assert_eq!(meta["domain"], "files.example");
        assert_eq!(meta["size"], original.len() as u64);
    }

    #[tokio::test]
    async fn sandbox_path_is_skipped_when_globally_disabled() {
        let modifier = TrafficModifier::new(TrafficModifierConfig {
            sandbox_executables: false,
            ..config()
        });
        let resp = response(b"not-replaced");
        let instructions = Modifier {
            save_original: true,
            ..Modifier::of_kind(ModifierKind::SandboxExecutable)
        };

        let out = modifier
            .modify_response(resp, &request(), Some(&instructions))
            .await;
        assert_eq!(out.source, ResponseSource::Real);
        assert_eq!(&out.body[..], b"not-replaced");
    }

    #[test]
    fn artifact_basename_falls_back_for_unusable_paths() {
        assert_eq!(artifact_basename("/downloads/evil.exe"), "evil.exe");
        assert_eq!(artifact_basename("/"), "download.bin");
        assert_eq!(artifact_basename(""), "download.bin");
        assert_eq!(artifact_basename("/dir/"), "dir");
    }

    #[test]
    fn pii_token_replacement_handles_overlapping_tokens() {
        let out = String::from_utf8_lossy(&strip_pii(b"passwd=x pwd=y key=z")).to_string();
        assert!(out.contains("[REDACTED_PASSWORD]=x"));
        assert!(out.contains("[REDACTED_PASSWORD]=y"));
        assert!(out.contains("[REDACTED_KEY]=z"));
    }
}
