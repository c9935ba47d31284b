//! Split-plane HTTP proxy bridge.
//!
//! Forwards local HTTP requests to an upstream HTTPS API whose
//! authentication only exists inside a logged-in browser session. The
//! server plane accepts plain HTTP on localhost; the browser plane (the
//! agent) performs the outgoing call from within the session context and
//! streams the response back. A single WebSocket control channel carries
//! JSON frames between the two.
//!
//! ```text
//!                      ┌──────────────────────┐        ┌──────────────────┐
//!  local client ─HTTP─▶│ server plane         │        │ browser plane    │
//!                      │  http front-end      │        │  (bridge-agent)  │
//!                      │  dispatcher          │◀──ws──▶│  fetcher         │
//!                      │  pending table       │ frames │  streamer        │──HTTPS──▶ upstream
//!                      │  control-channel mgr │        │  channel client  │
//!                      └──────────────────────┘        └──────────────────┘
//! ```
//!
//! # Subsystems
//! - [`protocol`]: the control-channel frame codec
//! - [`policy`]: header sanitation and request rewriting
//! - [`server`]: front-end, dispatcher, pending table, channel manager
//! - [`agent`]: channel client, upstream fetcher, response streamer
//! - [`config`], [`lifecycle`]: shared plumbing

pub mod agent;
pub mod config;
pub mod lifecycle;
pub mod policy;
pub mod protocol;
pub mod server;

pub use config::{AgentConfig, BridgeConfig};
pub use server::Bridge;
