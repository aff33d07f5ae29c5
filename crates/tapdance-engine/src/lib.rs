//! Tapdance device interaction engine.
//!
//! One coupled pipeline: observe → wait-for-stable → resolve target → act →
//! re-observe → log. The MCP layer on top exposes every operation as a typed
//! tool over stdio and HTTP transports.

pub mod cache;
pub mod error;
pub mod gesture;
pub mod hierarchy;
pub mod mcp;
pub mod observation;
pub mod plan;
pub mod resolve;
pub mod session;
pub mod stability;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{EngineError, Result};
