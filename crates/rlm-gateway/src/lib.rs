//! Retrieval-tool gateway (§4.G): session lifecycle, filesystem browsing,
//! search, span/chunk reads, provenance reporting, and a `complete` tool that
//! drives a recursive-inference turn, published over both an MCP stdio
//! transport and an HTTP transport.

pub mod fs;
pub mod http;
pub mod path_validator;
pub mod search;
pub mod session;
pub mod stdio;
pub mod tools;

pub use http::{GatewayHttpServer, HttpServerConfig};
pub use path_validator::PathValidator;
pub use session::{Session, SessionManager};
pub use stdio::{GatewayServerHandler, StdioServerConfig};
pub use tools::{GatewayState, GatewayToolRegistry};
