//! Rule-based decision engine for half mode.
//!
//! The engine evaluates an ordered, priority-sorted rule set against each
//! request and produces a [`Decision`]. Decisions produced by a rule match
//! are cached per `(protocol, domain, path)` key; the default-action
//! fallback is never cached, so rules added later still take effect for
//! previously unmatched keys.
//!
//! Rule evaluation is deliberately forgiving: a condition that fails to
//! evaluate (e.g. a malformed regex) is logged and treated as "did not
//! match", never propagated. The only hard error out of [`DecisionEngine::
//! decide`] is a poisoned rule-list lock, which the controller maps to a
//! zero-confidence simulate fallback.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::config::HalfModeConfig;
use crate::error::Error;
use crate::request::Request;

/// The action a decision prescribes for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Forward the request to its real destination.
    Forward,
    /// Block the request.
    Block,
    /// Modify, then forward.
    Modify,
    /// Answer from the simulation services.
    Simulate,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Forward => "forward",
            Self::Block => "block",
            Self::Modify => "modify",
            Self::Simulate => "simulate",
        };
        f.write_str(s)
    }
}

/// What kind of rewriting a [`Modifier`] asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierKind {
    /// Replace an executable download with a placeholder, preserving the
    /// original for offline analysis.
    SandboxExecutable,
    /// Log and/or redact request or response content.
    ContentLogging,
}

/// Instructions for rewriting a request or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Modifier {
    /// Kind of modification.
    #[serde(rename = "type")]
    pub kind: ModifierKind,

    /// Persist the original content before replacing it.
    #[serde(default)]
    pub save_original: bool,

    /// What to replace sandboxed content with (informational).
    #[serde(default)]
    pub replace_with: String,

    /// Header names to remove from the request (case-sensitive match
    /// against the stored header keys).
    #[serde(default)]
    pub strip_headers: Vec<String>,

    /// Headers to add to the request; collisions overwrite.
    #[serde(default)]
    pub inject_headers: HashMap<String, String>,

    /// Log the full response body.
    #[serde(default)]
    pub log_full_content: bool,

    /// Redact sensitive tokens in the response body.
    #[serde(default)]
    pub strip_pii: bool,
}

impl Modifier {
    /// A bare modifier of the given kind with everything else off.
    pub fn of_kind(kind: ModifierKind) -> Self {
        Self {
            kind,
            save_original: false,
            replace_with: String::new(),
            strip_headers: Vec::new(),
            inject_headers: HashMap::new(),
            log_full_content: false,
            strip_pii: false,
        }
    }
}

/// The per-request verdict: action plus justification.
///
/// Produced fresh per request (or reused from the cache) and never mutated
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// The action to take.
    pub action: Action,

    /// Why this decision was made.
    pub reason: String,

    /// The rule that produced it, or a sentinel such as `default`,
    /// `full_mode`, `failsafe`, or `transparent_passthrough`.
    pub rule_name: String,

    /// Optional modification instructions carried from the rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifier: Option<Modifier>,

    /// Confidence in [0, 1]. Rule matches are 1.0; fallbacks are lower.
    pub confidence: f64,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Decision {
    /// A decision carrying only an action and its justification.
    pub fn sentinel(
        action: Action,
        reason: impl Into<String>,
        rule_name: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            action,
            reason: reason.into(),
            rule_name: rule_name.into(),
            modifier: None,
            confidence,
            metadata: HashMap::new(),
        }
    }
}

/// A traffic-pattern condition, tagged by type.
///
/// The enum is closed: a rule file with an unknown condition type fails to
/// deserialize instead of producing an inert rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Domain is on the list (exact or `*.suffix` wildcard).
    DomainWhitelist { domains: Vec<String> },
    /// Domain is on the list (exact or `*.suffix` wildcard).
    DomainBlacklist { domains: Vec<String> },
    /// Domain matches a regular expression.
    DomainPattern { pattern: String },
    /// Protocol equals (case-insensitive).
    Protocol { protocol: String },
    /// Request path ends with one of the extensions.
    FileExtension { extensions: Vec<String> },
    /// `Content-Type` header contains the value (case-insensitive).
    ContentType { content_type: String },
    /// HTTP method equals (case-insensitive).
    Method { method: String },
    /// Upload heuristic: optional method match and minimum body size.
    UploadDetection {
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        min_size: Option<u64>,
    },
    /// Always matches; used as a catch-all terminal rule.
    Default,
}

/// A priority-ordered policy entry mapping a traffic pattern to an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRule {
    /// Rule name. Uniqueness is conventional, not enforced.
    pub name: String,

    /// Higher priority rules are evaluated first.
    pub priority: i32,

    /// Disabled rules are skipped during evaluation.
    pub enabled: bool,

    /// The condition that must match.
    pub condition: RuleCondition,

    /// Action taken on match.
    pub action: Action,

    /// Optional modification instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<Modifier>,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Decision cache key. A proper tuple of fields, so separator characters
/// inside a domain or path cannot collide with another key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    protocol: String,
    domain: String,
    path: String,
}

impl CacheKey {
    fn for_request(req: &Request) -> Self {
        Self {
            protocol: req.protocol.clone(),
            domain: req.domain.clone(),
            path: req.path.clone(),
        }
    }
}

/// Rule-based decision engine.
///
/// The rule list lives behind a read/write lock: [`DecisionEngine::decide`]
/// holds a read lock for the whole iteration, so it can never observe a
/// half-mutated list. The decision cache is a concurrent map of shared,
/// immutable decisions.
pub struct DecisionEngine {
    rules: RwLock<Vec<DecisionRule>>,
    cache: DashMap<CacheKey, Arc<Decision>>,
    default_action: Action,
}

impl DecisionEngine {
    /// Create an engine with an empty rule set.
    pub fn new(config: &HalfModeConfig) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            cache: DashMap::new(),
            default_action: config.default_action,
        }
    }

    /// Create an engine loaded with the built-in default rules, plus any
    /// rules from the configured rule file.
    pub fn with_default_rules(config: &HalfModeConfig) -> Result<Self, Error> {
        let engine = Self::new(config);
        engine.add_rules(default_rules())?;

        if let Some(path) = &config.decision_rules_file {
            let rules = load_rules_file(path)?;
            info!(
                path = %path.display(),
                count = rules.len(),
                "Loaded decision rules from file"
            );
            engine.add_rules(rules)?;
        }

        Ok(engine)
    }

    /// Add a decision rule and re-sort the rule set by descending priority.
    ///
    /// The sort is stable: rules with equal priority keep insertion order.
    /// A rejected rule leaves the rule set unchanged.
    pub fn add_rule(&self, rule: DecisionRule) -> Result<(), Error> {
        if rule.name.trim().is_empty() {
            return Err(Error::InvalidRule {
                name: rule.name,
                reason: "rule name must not be empty".to_string(),
            });
        }

        let mut rules = self.rules.write().map_err(|_| Error::EnginePoisoned)?;
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    /// Add rules in order, surfacing the first failure.
    ///
    /// Not transactional: rules added before the failing one stay in place.
    pub fn add_rules(&self, rules: Vec<DecisionRule>) -> Result<(), Error> {
        for rule in rules {
            self.add_rule(rule)?;
        }
        Ok(())
    }

    /// Decide how to handle a request.
    ///
    /// Cached decisions are keyed on `(protocol, domain, path)` only: a
    /// request that previously matched a size-based rule returns the same
    /// cached decision for a differently-sized body with the same key.
    pub fn decide(&self, req: &Request) -> Result<Arc<Decision>, Error> {
        let key = CacheKey::for_request(req);
        if let Some(cached) = self.cache.get(&key) {
            debug!(
                req_id = %req.id,
                domain = %req.domain,
                rule = %cached.rule_name,
                "Using cached decision"
            );
            return Ok(cached.value().clone());
        }

        let rules = self.rules.read().map_err(|_| Error::EnginePoisoned)?;

        for rule in rules.iter().filter(|r| r.enabled) {
            let matches = match evaluate_condition(req, &rule.condition) {
                Ok(matches) => matches,
                Err(err) => {
                    warn!(
                        rule = %rule.name,
                        error = %err,
                        "Failed to evaluate rule condition"
                    );
                    continue;
                }
            };

            if matches {
                let mut metadata = HashMap::new();
                metadata.insert("rule_priority".to_string(), rule.priority.into());

                let decision = Arc::new(Decision {
                    action: rule.action,
                    reason: format!("Matched rule: {}", rule.name),
                    rule_name: rule.name.clone(),
                    modifier: rule.modifier.clone(),
                    confidence: 1.0,
                    metadata,
                });

                info!(
                    req_id = %req.id,
                    rule = %rule.name,
                    action = %decision.action,
                    domain = %req.domain,
                    protocol = %req.protocol,
                    "Decision made"
                );

                self.cache.insert(key, decision.clone());
                return Ok(decision);
            }
        }

        // No rule matched. The fallback is not cached so that rules added
        // later still take effect for this key.
        let decision = Arc::new(Decision::sentinel(
            self.default_action,
            "No matching rule, using default action",
            "default",
            0.5,
        ));

        info!(
            req_id = %req.id,
            action = %decision.action,
            domain = %req.domain,
            "Using default action"
        );

        Ok(decision)
    }

    /// Snapshot of the rule set, in evaluation order.
    pub fn rules(&self) -> Vec<DecisionRule> {
        self.rules
            .read()
            .map(|rules| rules.clone())
            .unwrap_or_default()
    }

    /// Empty the decision cache. The rule set is untouched.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Evaluate a rule condition against a request.
///
/// Only the regex condition can fail; everything else is total.
fn evaluate_condition(req: &Request, condition: &RuleCondition) -> Result<bool, Error> {
    match condition {
        RuleCondition::DomainWhitelist { domains } | RuleCondition::DomainBlacklist { domains } => {
            Ok(match_domain_list(&req.domain, domains))
        }
        RuleCondition::DomainPattern { pattern } => match_domain_pattern(&req.domain, pattern),
        RuleCondition::Protocol { protocol } => Ok(req.protocol.eq_ignore_ascii_case(protocol)),
        RuleCondition::FileExtension { extensions } => {
            Ok(match_file_extension(&req.path, extensions))
        }
        RuleCondition::ContentType { content_type } => {
            Ok(match_content_type(req, content_type))
        }
        RuleCondition::Method { method } => Ok(req.method.eq_ignore_ascii_case(method)),
        RuleCondition::UploadDetection { method, min_size } => {
            Ok(detect_upload(req, method.as_deref(), *min_size))
        }
        RuleCondition::Default => Ok(true),
    }
}

/// Case-insensitive domain list match with `*.suffix` wildcard support.
///
/// The wildcard matches the bare suffix itself and any subdomain of it:
/// `*.example.com` matches `example.com` and `sub.example.com`, but not
/// `notexample.com`.
fn match_domain_list(domain: &str, patterns: &[String]) -> bool {
    let domain = domain.to_ascii_lowercase();

    for pattern in patterns {
        let pattern = pattern.to_ascii_lowercase();

        if domain == pattern {
            return true;
        }

        if let Some(suffix) = pattern.strip_prefix("*.") {
            if domain == suffix || domain.ends_with(&format!(".{suffix}")) {
                return true;
            }
        }
    }

    false
}

/// Regex domain match. A malformed pattern is an evaluation error, which
/// the engine treats as a per-rule skip.
fn match_domain_pattern(domain: &str, pattern: &str) -> Result<bool, Error> {
    if pattern.is_empty() {
        return Ok(false);
    }

    let re = regex::Regex::new(pattern)
        .map_err(|e| Error::Condition(format!("invalid regex pattern '{pattern}': {e}")))?;

    Ok(re.is_match(domain))
}

/// Case-insensitive extension suffix match; extensions are normalized to
/// include a leading dot.
fn match_file_extension(path: &str, extensions: &[String]) -> bool {
    let path = path.to_ascii_lowercase();

    for ext in extensions {
        let ext = ext.to_ascii_lowercase();
        let ext = if ext.starts_with('.') {
            ext
        } else {
            format!(".{ext}")
        };
        if path.ends_with(&ext) {
            return true;
        }
    }

    false
}

/// Case-insensitive substring match against the `Content-Type` header, with
/// case-insensitive header-name lookup.
fn match_content_type(req: &Request, content_type: &str) -> bool {
    if content_type.is_empty() {
        return false;
    }

    match req.header("content-type") {
        Some(value) => value
            .to_ascii_lowercase()
            .contains(&content_type.to_ascii_lowercase()),
        None => false,
    }
}

/// Upload heuristic: the method matches when specified, and the content
/// length reaches the minimum when specified.
fn detect_upload(req: &Request, method: Option<&str>, min_size: Option<u64>) -> bool {
    if let Some(method) = method {
        if !req.method.eq_ignore_ascii_case(method) {
            return false;
        }
    }

    if let Some(min_size) = min_size {
        if req.content_length < min_size {
            return false;
        }
    }

    true
}

/// Load decision rules from a YAML file (a sequence of rules).
pub fn load_rules_file(path: &Path) -> Result<Vec<DecisionRule>, Error> {
    let text = std::fs::read_to_string(path)?;
    serde_yml::from_str(&text).map_err(|source| Error::RuleFile {
        path: path.to_path_buf(),
        source,
    })
}

/// The built-in safe default rule set.
pub fn default_rules() -> Vec<DecisionRule> {
    vec![
        DecisionRule {
            name: "block_known_c2".to_string(),
            priority: 100,
            enabled: true,
            condition: RuleCondition::DomainBlacklist {
                domains: vec![
                    "*.malware-c2.com".to_string(),
                    "*.evil-domain.net".to_string(),
                    "192.168.1.100".to_string(),
                ],
            },
            action: Action::Block,
            modifier: None,
            description: "Block known C2 servers".to_string(),
        },
        DecisionRule {
            name: "allow_legitimate_cdns".to_string(),
            priority: 90,
            enabled: true,
            condition: RuleCondition::DomainWhitelist {
                domains: vec![
                    "*.cloudflare.com".to_string(),
                    "*.akamai.com".to_string(),
                    "*.fastly.com".to_string(),
                ],
            },
            action: Action::Forward,
            modifier: None,
            description: "Allow legitimate CDNs".to_string(),
        },
        DecisionRule {
            name: "intercept_executables".to_string(),
            priority: 80,
            enabled: true,
            condition: RuleCondition::FileExtension {
                extensions: vec![
                    ".exe".to_string(),
                    ".dll".to_string(),
                    ".ps1".to_string(),
                    ".sh".to_string(),
                    ".bat".to_string(),
                    ".cmd".to_string(),
                ],
            },
            action: Action::Modify,
            modifier: Some(Modifier {
                save_original: true,
                replace_with: "honeypot".to_string(),
                ..Modifier::of_kind(ModifierKind::SandboxExecutable)
            }),
            description: "Intercept and sandbox executable downloads".to_string(),
        },
        DecisionRule {
            name: "monitor_data_exfiltration".to_string(),
            priority: 70,
            enabled: true,
            condition: RuleCondition::UploadDetection {
                method: Some("POST".to_string()),
                min_size: Some(1024 * 1024),
            },
            action: Action::Modify,
            modifier: Some(Modifier {
                log_full_content: true,
                strip_pii: true,
                ..Modifier::of_kind(ModifierKind::ContentLogging)
            }),
            description: "Monitor large POST requests for data exfiltration".to_string(),
        },
        DecisionRule {
            name: "default_simulate".to_string(),
            priority: 1,
            enabled: true,
            condition: RuleCondition::Default,
            action: Action::Simulate,
            modifier: None,
            description: "Default action - simulate all unmatched traffic".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::protocols;

    fn engine() -> DecisionEngine {
        DecisionEngine::new(&HalfModeConfig::default())
    }

    fn blacklist_rule(name: &str, priority: i32, domains: &[&str], action: Action) -> DecisionRule {
        DecisionRule {
            name: name.to_string(),
            priority,
            enabled: true,
            condition: RuleCondition::DomainBlacklist {
                domains: domains.iter().map(|d| d.to_string()).collect(),
            },
            action,
            modifier: None,
            description: String::new(),
        }
    }

    fn request_to(domain: &str) -> Request {
        let mut req = Request::new(protocols::HTTP, domain);
        req.method = "GET".to_string();
        req.path = "/".to_string();
        req
    }

    #[test]
    fn rules_evaluate_in_priority_order() {
        let engine = engine();
        engine
            .add_rule(blacklist_rule("block_evil", 100, &["evil.com"], Action::Block))
            .unwrap();
        engine
            .add_rule(blacklist_rule("allow_good", 90, &["good.com"], Action::Forward))
            .unwrap();

        assert_eq!(
            engine.decide(&request_to("evil.com")).unwrap().action,
            Action::Block
        );
        assert_eq!(
            engine.decide(&request_to("good.com")).unwrap().action,
            Action::Forward
        );

        let fallback = engine.decide(&request_to("unknown.com")).unwrap();
        assert_eq!(fallback.action, Action::Simulate);
        assert_eq!(fallback.rule_name, "default");
        assert!((fallback.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn equal_priorities_keep_insertion_order() {
        let engine = engine();
        engine
            .add_rule(blacklist_rule("first", 50, &["tie.com"], Action::Block))
            .unwrap();
        engine
            .add_rule(blacklist_rule("second", 50, &["tie.com"], Action::Forward))
            .unwrap();

        let decision = engine.decide(&request_to("tie.com")).unwrap();
        assert_eq!(decision.rule_name, "first");
    }

    #[test]
    fn rejected_rule_leaves_rule_set_unchanged() {
        let engine = engine();
        engine
            .add_rule(blacklist_rule("valid", 10, &["a.com"], Action::Block))
            .unwrap();

        let before = engine.rules().len();
        let result = engine.add_rule(blacklist_rule("", 99, &["b.com"], Action::Block));
        assert!(matches!(result, Err(Error::InvalidRule { .. })));
        assert_eq!(engine.rules().len(), before);
    }

    #[test]
    fn unknown_action_fails_rule_file_deserialization() {
        let yaml = r#"
- name: bad
  priority: 10
  enabled: true
  action: obliterate
  condition:
    type: default
"#;
        let result: Result<Vec<DecisionRule>, _> = serde_yml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn rule_file_yaml_parses() {
        let yaml = r#"
- name: block_telemetry
  priority: 60
  enabled: true
  action: block
  condition:
    type: domain_blacklist
    domains: ["*.telemetry.example"]
  description: Block telemetry beacons
- name: sandbox_exe
  priority: 55
  enabled: true
  action: modify
  condition:
    type: file_extension
    extensions: [exe, dll]
  modifier:
    type: sandbox_executable
    save_original: true
"#;
        let rules: Vec<DecisionRule> = serde_yml::from_str(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].action, Action::Block);
        assert!(matches!(
            rules[1].modifier.as_ref().unwrap().kind,
            ModifierKind::SandboxExecutable
        ));
    }

    #[test]
    fn wildcard_matches_suffix_and_subdomains_only() {
        let patterns = vec!["*.example.com".to_string()];

        assert!(match_domain_list("example.com", &patterns));
        assert!(match_domain_list("sub.example.com", &patterns));
        assert!(match_domain_list("SUB.EXAMPLE.COM", &patterns));
        assert!(!match_domain_list("notexample.com", &patterns));
        assert!(!match_domain_list("example.com.evil.net", &patterns));
    }

    #[test]
    fn exact_domain_match_is_case_insensitive() {
        let patterns = vec!["Example.COM".to_string()];
        assert!(match_domain_list("example.com", &patterns));
        assert!(!match_domain_list("other.com", &patterns));
    }

    #[test]
    fn malformed_regex_skips_rule_not_evaluation() {
        let engine = engine();
        engine
            .add_rule(DecisionRule {
                name: "broken_pattern".to_string(),
                priority: 100,
                enabled: true,
                condition: RuleCondition::DomainPattern {
                    pattern: "(unclosed".to_string(),
                },
                action: Action::Block,
                modifier: None,
                description: String::new(),
            })
            .unwrap();
        engine
            .add_rule(blacklist_rule("catch", 10, &["target.com"], Action::Forward))
            .unwrap();

        // The broken rule is skipped; the lower-priority rule still matches.
        let decision = engine.decide(&request_to("target.com")).unwrap();
        assert_eq!(decision.rule_name, "catch");
    }

    #[test]
    fn domain_pattern_matches_regex() {
        assert!(match_domain_pattern("cdn7.evil.net", r"^cdn\d+\.").unwrap());
        assert!(!match_domain_pattern("cdn.evil.net", r"^cdn\d+\.").unwrap());
        assert!(!match_domain_pattern("anything", "").unwrap());
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let engine = engine();
        let mut rule = blacklist_rule("off", 100, &["x.com"], Action::Block);
        rule.enabled = false;
        engine.add_rule(rule).unwrap();

        assert_eq!(
            engine.decide(&request_to("x.com")).unwrap().rule_name,
            "default"
        );
    }

    #[test]
    fn file_extension_matching_normalizes_dot_and_case() {
        let exts = vec!["exe".to_string(), ".DLL".to_string()];
        assert!(match_file_extension("/payload.EXE", &exts));
        assert!(match_file_extension("/lib/inject.dll", &exts));
        assert!(!match_file_extension("/page.html", &exts));
        assert!(!match_file_extension("/archive.exe.txt", &exts));
    }

    #[test]
    fn content_type_matches_substring_case_insensitively() {
        let mut req = request_to("example.com");
        req.headers.insert(
            "content-TYPE".to_string(),
            "Application/JSON; charset=utf-8".to_string(),
        );
        assert!(match_content_type(&req, "application/json"));
        assert!(!match_content_type(&req, "multipart"));

        let bare = request_to("example.com");
        assert!(!match_content_type(&bare, "application/json"));
    }

    #[test]
    fn upload_detection_requires_both_specified_criteria() {
        let mut req = request_to("exfil.example");
        req.method = "POST".to_string();
        req.content_length = 2 * 1024 * 1024;

        assert!(detect_upload(&req, Some("post"), Some(1024 * 1024)));
        assert!(!detect_upload(&req, Some("GET"), Some(1024)));
        assert!(!detect_upload(&req, Some("POST"), Some(4 * 1024 * 1024)));
        // Unspecified criteria do not constrain.
        assert!(detect_upload(&req, None, None));
    }

    #[test]
    fn matched_decisions_are_cached_by_protocol_domain_path() {
        let engine = engine();
        engine
            .add_rule(blacklist_rule("block_evil", 100, &["evil.com"], Action::Block))
            .unwrap();

        let first = engine.decide(&request_to("evil.com")).unwrap();
        let second = engine.decide(&request_to("evil.com")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        engine.clear_cache();
        let third = engine.decide(&request_to("evil.com")).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.action, Action::Block);
    }

    /// Regression guard for a deliberate, documented limitation: the cache
    /// key ignores content length, so a size-based rule's decision is reused
    /// for a differently-sized body with the same (protocol, domain, path).
    #[test]
    fn cached_decision_is_stale_for_size_based_rules() {
        let engine = engine();
        engine
            .add_rule(DecisionRule {
                name: "large_upload".to_string(),
                priority: 100,
                enabled: true,
                condition: RuleCondition::UploadDetection {
                    method: Some("POST".to_string()),
                    min_size: Some(1024 * 1024),
                },
                action: Action::Modify,
                modifier: Some(Modifier::of_kind(ModifierKind::ContentLogging)),
                description: String::new(),
            })
            .unwrap();

        let mut large = request_to("upload.example");
        large.method = "POST".to_string();
        large.path = "/submit".to_string();
        large.content_length = 2 * 1024 * 1024;

        let mut small = large.clone();
        small.id = "small".to_string();
        small.content_length = 16;

        let first = engine.decide(&large).unwrap();
        assert_eq!(first.action, Action::Modify);

        // Same key, different size: the cached decision is returned even
        // though the small body would no longer match the rule.
        let second = engine.decide(&small).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn fallback_decisions_are_not_cached() {
        let engine = engine();

        let miss = engine.decide(&request_to("later.example")).unwrap();
        assert_eq!(miss.rule_name, "default");

        // A rule added after the miss takes effect for the same key.
        engine
            .add_rule(blacklist_rule("late", 10, &["later.example"], Action::Block))
            .unwrap();
        let hit = engine.decide(&request_to("later.example")).unwrap();
        assert_eq!(hit.rule_name, "late");
        assert_eq!(hit.action, Action::Block);
    }

    #[test]
    fn default_rules_are_sorted_and_carry_modifiers() {
        let rules = default_rules();
        assert!(!rules.is_empty());

        for pair in rules.windows(2) {
            assert!(pair[0].priority >= pair[1].priority);
        }

        let sandbox = rules
            .iter()
            .find(|r| r.name == "intercept_executables")
            .unwrap();
        let modifier = sandbox.modifier.as_ref().unwrap();
        assert!(matches!(modifier.kind, ModifierKind::SandboxExecutable));
        assert!(modifier.save_original);
    }

    #[test]
    fn default_rules_catch_all_simulates() {
        let config = HalfModeConfig {
            default_action: Action::Block,
            ..HalfModeConfig::default()
        };
        let engine = DecisionEngine::with_default_rules(&config).unwrap();

        // The terminal default_simulate rule matches before the engine's
        // configured default action can apply.
        let decision = engine.decide(&request_to("anything.example")).unwrap();
        assert_eq!(decision.rule_name, "default_simulate");
        assert_eq!(decision.action, Action::Simulate);
    }
}
