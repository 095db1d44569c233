//! Sandgate - network mode controller for dynamic malware analysis.
//!
//! Sandgate mediates the network traffic a sample generates under dynamic
//! analysis, deciding per request whether to isolate, forward, block,
//! modify, or passively observe it.
//!
//! # Operating modes
//!
//! - **Full** - complete isolation; every request is answered by the
//!   configured simulation services (INetSim, FakeNet-NG).
//! - **Half** - rule-driven selective forwarding through the decision
//!   engine, with traffic modification and executable sandboxing.
//! - **Transparent** - pure passive observation: connections are tracked
//!   and payloads extracted, but traffic is never blocked or modified.
//!
//! The fail-safe contract holds throughout: any internal failure degrades
//! to full-mode simulation, never to unrestricted internet access.
//!
//! # Entry point
//!
//! [`controller::Controller::handle_request`] is the single entry point.
//! Real packet capture and real network I/O are out of scope; requests
//! arrive already parsed and forwarding produces placeholder responses at
//! the extension point where an HTTP client belongs.

pub mod config;
pub mod controller;
pub mod decision;
pub mod error;
pub mod logging;
pub mod modifier;
pub mod netsim;
pub mod request;
pub mod router;
pub mod transparent;

pub use config::{Config, Mode};
pub use controller::{Controller, Stats};
pub use decision::{Action, Decision, DecisionRule, RuleCondition};
pub use error::{Error, Result};
pub use request::{Request, Response, ResponseSource};
