//! Browser plane: control-channel client, upstream fetcher and response
//! streamer.
//!
//! Runs next to the logged-in session whose credentials the upstream
//! trusts. Holds exactly one connection to the server plane and executes
//! every request spec it receives, streaming results back as frames.

pub mod channel;
pub mod fetch;
pub mod stream;
pub mod utf8;

pub use channel::AgentRuntime;
