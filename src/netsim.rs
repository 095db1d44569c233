//! Liveness-check helper for simulation-service redirection.
//!
//! A thin layer over an HTTP reachability probe: when a URL the sample
//! wants is not alive on the real network, traffic for it should be
//! redirected to the simulation endpoint instead of failing. Also answers
//! which DNS servers the sandbox should be given.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

/// Network simulator settings.
#[derive(Debug, Clone)]
pub struct NetsimConfig {
    /// Simulated DNS service address.
    pub dns_addr: String,
    /// Simulated HTTP service address.
    pub http_addr: String,
    /// Enable redirection; when disabled every URL counts as alive.
    pub enabled: bool,
    /// Timeout for the liveness probe.
    pub liveness_timeout: Duration,
}

impl Default for NetsimConfig {
    fn default() -> Self {
        Self {
            dns_addr: "172.20.0.2:53".to_string(),
            http_addr: "172.20.0.2:80".to_string(),
            enabled: false,
            liveness_timeout: Duration::from_secs(3),
        }
    }
}

/// Decides whether a URL should be redirected to the simulation endpoint.
pub struct NetworkSimulator {
    config: NetsimConfig,
    client: reqwest::Client,
}

impl NetworkSimulator {
    pub fn new(config: NetsimConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.liveness_timeout)
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    /// Probe a URL with a HEAD request.
    ///
    /// Disabled simulation treats everything as alive.
    pub async fn is_url_alive(&self, url: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        match self.client.head(url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let alive = (200..400).contains(&status);
                info!(url, status, alive, "URL liveness check");
                alive
            }
            Err(err) => {
                warn!(url, error = %err, "URL not alive");
                false
            }
        }
    }

    /// Redirect to the simulation endpoint when the URL is not alive.
    pub async fn should_redirect(&self, url: &str) -> bool {
        if !self.config.enabled {
            return false;
        }

        if !self.is_url_alive(url).await {
            info!(url, "Redirecting to simulation service");
            return true;
        }
        false
    }

    /// DNS servers the sandbox should use.
    ///
    /// Public resolvers when simulation is disabled, otherwise the
    /// simulated DNS service host.
    pub fn dns_servers(&self) -> Vec<String> {
        if !self.config.enabled {
            return vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()];
        }

        match self.config.dns_addr.parse::<SocketAddr>() {
            Ok(addr) => vec![addr.ip().to_string()],
            Err(_) => vec![self.config.dns_addr.clone()],
        }
    }

    /// Simulated DNS service address.
    pub fn dns_addr(&self) -> &str {
        &self.config.dns_addr
    }

    /// Simulated HTTP service address.
    pub fn http_addr(&self) -> &str {
        &self.config.http_addr
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
