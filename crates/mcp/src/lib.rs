//! MCP (Model Context Protocol) engine: JSON-RPC protocol types, transports,
//! the tool registry, the pooled outbound client and the server that ties
//! them together.

pub mod error;
pub mod outbound;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

pub use error::{McpError, McpResult, TransportError, TransportResult};
pub use outbound::OutboundClient;
pub use server::{McpServer, McpServerBuilder};
pub use tools::{Tool, ToolContext, ToolRegistry};
pub use transport::Transport;
