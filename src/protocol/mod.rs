//! Control-channel wire protocol.
//!
//! One JSON text frame per message. The server plane sends request specs;
//! the browser plane answers with event frames keyed by `request_id`.

pub mod frame;

pub use frame::{Event, EventFrame, QueryValue, RequestSpec};
