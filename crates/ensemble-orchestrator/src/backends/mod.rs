//! Reference agent backends.
//!
//! Thin transports for the two [`AgentKind`](crate::descriptor::AgentKind)
//! variants. They forward raw text only; interpreting model output is left to
//! the agent itself.

pub mod cli;
pub mod http;

pub use cli::CliBackend;
pub use http::HttpBackend;
