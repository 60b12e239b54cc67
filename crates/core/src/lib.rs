//! Core building blocks for the switchboard MCP server: sessions, connection
//! pooling, configuration, lifecycle events and metrics.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod types;

pub use error::{CoreError, CoreResult};
pub use types::*;
