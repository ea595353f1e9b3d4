//! A2A (Agent-to-Agent) protocol layer for Cleo.
//!
//! Implements the Google A2A 0.3 JSON wire format in both directions:
//! inbound, external agents submit work that becomes Cleo board tasks
//! (bridge + server); outbound, executor workers delegate subtasks to
//! external agents (client + registry), filtered through a 3-tier trust
//! model (security).

pub mod bridge;
pub mod error;
pub mod jsonrpc;
pub mod security;
pub mod types;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub mod registry;

#[cfg(feature = "server")]
pub mod server;

pub use error::A2AError;
pub use types::*;
