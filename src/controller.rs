//! The network mode controller: the single entry point for handled traffic.
//!
//! The controller composes the decision engine, traffic modifier, router,
//! and transparent observer according to the active mode, owns the request
//! statistics, and enforces the fail-safe contract: any internal failure
//! degrades to full-mode simulation, never to unrestricted network access.
//!
//! # Mode switching and in-flight requests
//!
//! The active mode lives in an atomic cell. [`Controller::handle_request`]
//! samples it exactly once at dispatch start, so a concurrent
//! [`Controller::switch_mode`] may race with in-flight requests but each
//! request is internally consistent with the single mode it sampled.
//!
//! # Panic containment
//!
//! Mode dispatch runs under `catch_unwind`. A panicking dispatch yields a
//! substituted full-mode response with a `failsafe` decision and an
//! incremented error counter; callers never observe the panic.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{error, info};

use crate::config::{Config, Mode};
use crate::decision::{Action, Decision, DecisionEngine, DecisionRule};
use crate::error::{Error, Result};
use crate::logging::TrafficLogger;
use crate::modifier::TrafficModifier;
use crate::request::{Request, Response, TrafficRecord};
use crate::router::Router;
use crate::transparent::TransparentObserver;

/// Monotonic request counters plus request timestamps.
///
/// [`Controller::stats`] returns a value copy, never a live reference.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_requests: u64,
    pub forwarded_requests: u64,
    pub blocked_requests: u64,
    pub modified_requests: u64,
    pub simulated_requests: u64,
    pub errors: u64,
    pub last_request_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
}

impl Stats {
    fn new() -> Self {
        Self {
            total_requests: 0,
            forwarded_requests: 0,
            blocked_requests: 0,
            modified_requests: 0,
            simulated_requests: 0,
            errors: 0,
            last_request_time: None,
            start_time: Utc::now(),
        }
    }
}

#[derive(Clone, Copy)]
enum Stat {
    Total,
    Forwarded,
    Blocked,
    Modified,
    Simulated,
    Errors,
}

/// The network mode controller.
pub struct Controller {
    config: Config,
    mode: ArcSwap<Mode>,
    router: Router,
    logger: TrafficLogger,
    engine: RwLock<Option<Arc<DecisionEngine>>>,
    modifier: RwLock<Option<Arc<TrafficModifier>>>,
    observer: RwLock<Option<Arc<TransparentObserver>>>,
    stats: RwLock<Stats>,
    #[cfg(test)]
    panic_on_dispatch: std::sync::atomic::AtomicBool,
}

impl Controller {
    /// Construct a controller from a validated configuration.
    ///
    /// Mode-specific components are built eagerly for the initial mode;
    /// constructing in half or transparent mode without the matching
    /// sub-configuration (present and enabled) is a hard error.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let logger = TrafficLogger::new(&config.logging);
        let router = Router::new(config.full_mode.services.clone());

        let mut engine = None;
        let mut modifier = None;
        if config.mode == Mode::Half {
            // validate() guarantees the section exists and is enabled.
            let half = config.half_mode.as_ref().ok_or(Error::ModeNotEnabled(Mode::Half))?;
            engine = Some(Arc::new(DecisionEngine::with_default_rules(half)?));
            modifier = Some(Arc::new(TrafficModifier::new(half.traffic_modifier.clone())));
        }

        let mut observer = None;
        if config.mode == Mode::Transparent {
            let transparent = config
                .transparent_mode
                .as_ref()
                .ok_or(Error::ModeNotEnabled(Mode::Transparent))?;
            observer = Some(Arc::new(TransparentObserver::new(transparent.clone())?));
        }

        info!(
            mode = %config.mode,
            full_mode_isolation = config.mode == Mode::Full,
            "Network mode controller initialized"
        );

        Ok(Self {
            mode: ArcSwap::from_pointee(config.mode),
            config,
            router,
            logger,
            engine: RwLock::new(engine),
            modifier: RwLock::new(modifier),
            observer: RwLock::new(observer),
            stats: RwLock::new(Stats::new()),
            #[cfg(test)]
            panic_on_dispatch: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Handle one request to completion.
    ///
    /// Callers see either a response or an error; panics never propagate.
    pub async fn handle_request(&self, req: &Request) -> Result<Response> {
        let started = Instant::now();
        let started_at = Utc::now();

        self.increment(Stat::Total);
        self.logger.log_request(req);

        let mode = **self.mode.load();

        let outcome = AssertUnwindSafe(self.dispatch(mode, req))
            .catch_unwind()
            .await;

        let (mut resp, decision) = match outcome {
            Ok(Ok(handled)) => handled,
            Ok(Err(err)) => {
                self.increment(Stat::Errors);
                self.logger.log_error(req, &err);
                return Err(err);
            }
            Err(panic) => {
                error!(
                    req_id = %req.id,
                    panic = %panic_message(&panic),
                    "Panic during mode dispatch, failing safe to full mode"
                );
                self.increment(Stat::Errors);
                let resp = self.handle_full_mode(req).await?;
                let decision = Decision::sentinel(
                    Action::Simulate,
                    "Internal failure - failed safe to full mode",
                    "failsafe",
                    0.0,
                );
                (resp, decision)
            }
        };

        resp.decision = Some(decision.clone());
        self.logger.log_response(&resp);

        let record = TrafficRecord {
            timestamp: started_at,
            request: req,
            response: Some(&resp),
            decision: &decision,
            action: decision.action,
            modifications: Vec::new(),
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.logger.log_traffic(&record);

        {
            let mut stats = self
                .stats
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.last_request_time = Some(Utc::now());
        }

        Ok(resp)
    }

    async fn dispatch(&self, mode: Mode, req: &Request) -> Result<(Response, Decision)> {
        #[cfg(test)]
        if self
            .panic_on_dispatch
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            panic!("injected dispatch panic");
        }

        match mode {
            Mode::Full => {
                let resp = self.handle_full_mode(req).await?;
                let decision = Decision::sentinel(
                    Action::Simulate,
                    "Full Mode - all traffic simulated",
                    "full_mode",
                    1.0,
                );
                Ok((resp, decision))
            }
            Mode::Half => self.handle_half_mode(req).await,
            Mode::Transparent => self.handle_transparent_mode(req).await,
        }
    }

    async fn handle_full_mode(&self, req: &Request) -> Result<Response> {
        info!(
            req_id = %req.id,
            domain = %req.domain,
            protocol = %req.protocol,
            "Handling in full mode"
        );

        self.increment(Stat::Simulated);

        let decision = Decision::sentinel(Action::Simulate, "Full Mode", "full_mode", 1.0);
        self.router.route_request(Mode::Full, req, &decision).await
    }

    async fn handle_half_mode(&self, req: &Request) -> Result<(Response, Decision)> {
        info!(
            req_id = %req.id,
            domain = %req.domain,
            protocol = %req.protocol,
            "Handling in half mode"
        );

        let engine = self
            .engine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        // Engine failures never surface: they degrade to a zero-confidence
        // simulate decision.
        let decision = match engine {
            Some(engine) => match engine.decide(req) {
                Ok(decision) => (*decision).clone(),
                Err(err) => {
                    error!(
                        req_id = %req.id,
                        error = %err,
                        "Decision engine failed, falling back to simulation"
                    );
                    Decision::sentinel(
                        Action::Simulate,
                        format!("Decision failed: {err}"),
                        "error_fallback",
                        0.0,
                    )
                }
            },
            None => {
                error!(
                    req_id = %req.id,
                    "Decision engine not initialized, falling back to simulation"
                );
                Decision::sentinel(
                    Action::Simulate,
                    "Decision engine not initialized",
                    "error_fallback",
                    0.0,
                )
            }
        };

        self.logger.log_decision(req, &decision);

        let modifier = self
            .modifier
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut modified_req = None;
        if decision.action == Action::Modify {
            if let (Some(modifier), Some(instructions)) = (&modifier, &decision.modifier) {
                modified_req = Some(modifier.modify_request(req, Some(instructions)));
                self.logger.log_modification(req, "request_modified");
                self.increment(Stat::Modified);
            }
        }

        let routed_req = modified_req.as_ref().unwrap_or(req);
        let mut resp = self
            .router
            .route_request(Mode::Half, routed_req, &decision)
            .await?;

        match decision.action {
            Action::Forward => self.increment(Stat::Forwarded),
            Action::Block => self.increment(Stat::Blocked),
            Action::Simulate => self.increment(Stat::Simulated),
            // Counted above, on the request-side modification.
            Action::Modify => {}
        }

        if decision.action == Action::Modify {
            if let (Some(modifier), Some(instructions)) = (&modifier, &decision.modifier) {
                resp = modifier.modify_response(resp, req, Some(instructions)).await;
                self.logger.log_modification(req, "response_modified");
            }
        }

        Ok((resp, decision))
    }

    async fn handle_transparent_mode(&self, req: &Request) -> Result<(Response, Decision)> {
        info!(
            req_id = %req.id,
            domain = %req.domain,
            protocol = %req.protocol,
            "Handling in transparent mode (observe only)"
        );

        let observer = self
            .observer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let Some(observer) = observer else {
            error!(
                req_id = %req.id,
                "Transparent observer not initialized, failing safe to full mode"
            );
            let resp = self.handle_full_mode(req).await?;
            let decision = Decision::sentinel(
                Action::Simulate,
                "Transparent observer not ready - failed safe to full mode",
                "transparent_failsafe",
                0.0,
            );
            return Ok((resp, decision));
        };

        let resp = observer.handle_request(req);

        // Transparent traffic is never blocked or modified.
        let decision = Decision::sentinel(
            Action::Forward,
            "Transparent Mode - traffic observed and passed through unmodified",
            "transparent_passthrough",
            1.0,
        );

        self.increment(Stat::Forwarded);

        Ok((resp, decision))
    }

    /// The currently active mode.
    pub fn mode(&self) -> Mode {
        **self.mode.load()
    }

    /// Switch the active mode.
    ///
    /// Rejects targets whose sub-configuration is absent or disabled; on
    /// rejection the mode is unchanged. The decision engine + modifier
    /// (half) and the observer (transparent) are constructed on the first
    /// transition into their mode and reused afterwards.
    pub fn switch_mode(&self, new_mode: Mode) -> Result<()> {
        match new_mode {
            Mode::Full => {}
            Mode::Half => {
                if !self
                    .config
                    .half_mode
                    .as_ref()
                    .is_some_and(|half| half.enabled)
                {
                    return Err(Error::ModeNotEnabled(Mode::Half));
                }
            }
            Mode::Transparent => {
                if !self
                    .config
                    .transparent_mode
                    .as_ref()
                    .is_some_and(|transparent| transparent.enabled)
                {
                    return Err(Error::ModeNotEnabled(Mode::Transparent));
                }
            }
        }

        info!(from = %self.mode(), to = %new_mode, "Switching network mode");

        // Lazy components are built before the mode flips, so a failed
        // construction leaves the mode unchanged.
        if new_mode == Mode::Half {
            let mut engine = self
                .engine
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if engine.is_none() {
                let half = self
                    .config
                    .half_mode
                    .as_ref()
                    .ok_or(Error::ModeNotEnabled(Mode::Half))?;
                *engine = Some(Arc::new(DecisionEngine::with_default_rules(half)?));

                let mut modifier = self
                    .modifier
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *modifier = Some(Arc::new(TrafficModifier::new(
                    half.traffic_modifier.clone(),
                )));
            }
        }

        if new_mode == Mode::Transparent {
            let mut observer = self
                .observer
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if observer.is_none() {
                let transparent = self
                    .config
                    .transparent_mode
                    .as_ref()
                    .ok_or(Error::ModeNotEnabled(Mode::Transparent))?;
                *observer = Some(Arc::new(TransparentObserver::new(transparent.clone())?));
            }
        }

        self.mode.store(Arc::new(new_mode));
        Ok(())
    }

    /// Add a decision rule. Only valid in half mode.
    pub fn add_decision_rule(&self, rule: DecisionRule) -> Result<()> {
        if self.mode() != Mode::Half {
            return Err(Error::NotInMode {
                operation: "adding decision rules",
                required: Mode::Half,
            });
        }

        let engine = self
            .engine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(Error::ComponentNotInitialized("decision engine"))?;

        engine.add_rule(rule)
    }

    /// Snapshot of the decision rules, in evaluation order.
    pub fn decision_rules(&self) -> Vec<DecisionRule> {
        self.engine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|engine| engine.rules())
            .unwrap_or_default()
    }

    /// Empty the decision cache.
    pub fn clear_decision_cache(&self) {
        if let Some(engine) = self
            .engine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            engine.clear_cache();
        }
    }

    /// Transparent-mode connection statistics. Only valid in transparent
    /// mode with an initialized observer.
    pub fn transparent_stats(&self) -> Result<HashMap<String, serde_json::Value>> {
        let observer = self.require_observer("transparent statistics")?;
        Ok(observer.connection_stats())
    }

    /// Human-readable transparent-mode traffic summary.
    pub fn transparent_summary(&self) -> Result<String> {
        let observer = self.require_observer("transparent summary")?;
        Ok(observer.print_summary())
    }

    fn require_observer(&self, operation: &'static str) -> Result<Arc<TransparentObserver>> {
        if self.mode() != Mode::Transparent {
            return Err(Error::NotInMode {
                operation,
                required: Mode::Transparent,
            });
        }

        self.observer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(Error::ComponentNotInitialized("transparent observer"))
    }

    /// Statistics snapshot (value copy).
    pub fn stats(&self) -> Stats {
        self.stats
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn increment(&self, stat: Stat) {
        let mut stats = self
            .stats
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match stat {
            Stat::Total => stats.total_requests += 1,
            Stat::Forwarded => stats.forwarded_requests += 1,
            Stat::Blocked => stats.blocked_requests += 1,
            Stat::Modified => stats.modified_requests += 1,
            Stat::Simulated => stats.simulated_requests += 1,
            Stat::Errors => stats.errors += 1,
        }
    }

    /// Non-mutating self-check: configuration validity plus presence of the
    /// components the current mode requires.
    pub fn health(&self) -> Result<()> {
        self.config.validate()?;

        match self.mode() {
            Mode::Full => {}
            Mode::Half => {
                if !self
                    .config
                    .half_mode
                    .as_ref()
                    .is_some_and(|half| half.enabled)
                {
                    return Err(Error::ModeNotEnabled(Mode::Half));
                }
                if self
                    .engine
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .is_none()
                {
                    return Err(Error::ComponentNotInitialized("decision engine"));
                }
                if self
                    .modifier
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .is_none()
                {
                    return Err(Error::ComponentNotInitialized("traffic modifier"));
                }
            }
            Mode::Transparent => {
                if !self
                    .config
                    .transparent_mode
                    .as_ref()
                    .is_some_and(|transparent| transparent.enabled)
                {
                    return Err(Error::ModeNotEnabled(Mode::Transparent));
                }
                if self
                    .observer
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .is_none()
                {
                    return Err(Error::ComponentNotInitialized("transparent observer"));
                }
            }
        }

        Ok(())
    }

    /// Flush observer and log-file writers.
    pub fn close(&self) {
        info!("Shutting down network mode controller");

        if let Some(observer) = self
            .observer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            observer.close();
        }

        self.logger.close();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
