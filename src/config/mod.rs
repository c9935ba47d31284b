//! Configuration schema for both planes.
//!
//! There is no configuration file: each binary starts from the defaults
//! below and applies its command-line overrides. [`validation`] rejects
//! combinations the bridge is not prepared to run with.

pub mod validation;

pub use validation::{validate_bridge_config, ValidationError};

use std::time::Duration;

/// Upstream host every forwarded request is sent to.
pub const UPSTREAM_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Root configuration for the server plane.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub http: HttpConfig,
    pub control: ControlConfig,
    pub timeouts: TimeoutConfig,
    pub limits: LimitConfig,
}

/// Client-facing HTTP listener.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Bind address for the local front-end.
    pub bind_address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8889".to_string(),
        }
    }
}

/// Control-channel listener the agent connects to.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Bind address for the WebSocket listener.
    pub bind_address: String,

    /// Maximum frame size in either direction. Long prompts produce
    /// request frames far above typical WebSocket defaults.
    pub max_frame_bytes: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9998".to_string(),
            max_frame_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Per-request idle windows.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Window between transmitting a request and its first inbound event.
    /// Deployments have run anywhere between 120 and 600 seconds; the
    /// accepted range is enforced by validation.
    pub initial_idle_secs: u64,

    /// Window re-armed by every inbound progress event.
    pub progress_idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initial_idle_secs: 600,
            progress_idle_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn initial_idle(&self) -> Duration {
        Duration::from_secs(self.initial_idle_secs)
    }

    pub fn progress_idle(&self) -> Duration {
        Duration::from_secs(self.progress_idle_secs)
    }
}

/// Request size limits for the front-end.
#[derive(Debug, Clone)]
pub struct LimitConfig {
    /// Largest request body accepted from a local client.
    pub max_body_bytes: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Root configuration for the browser-plane agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control-channel URL of the server plane.
    pub control_url: String,

    /// Base URL all forwarded paths are appended to.
    pub upstream_base: String,

    /// Maximum control-channel frame size; must match the server plane.
    pub max_frame_bytes: usize,

    /// Delay between reconnect attempts. Reconnecting never gives up.
    pub reconnect_delay: Duration,

    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_url: "ws://127.0.0.1:9998".to_string(),
            upstream_base: UPSTREAM_BASE_URL.to_string(),
            max_frame_bytes: 100 * 1024 * 1024,
            reconnect_delay: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

/// Upstream retry policy. Retries exist only on this plane; the server
/// plane never re-sends a request.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempt budget per request.
    pub max_attempts: u32,

    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            delay: Duration::from_secs(1),
        }
    }
}
