//! Scriptport – a loopback script evaluation service
//!
//! This crate implements a small TCP service that evaluates fragments of a
//! Lua-flavoured scripting language on behalf of remote clients:
//! - A line protocol carrying `<length>:<request_id>:<code>` requests
//! - Deterministic step budgets for both execution and result rendering
//! - A JSON-like serializer that survives cycles, deep nesting and sparse tables
//! - A single-threaded, poll-driven server loop under a restarting supervisor
//! - A blocking client for issuing requests and decoding replies

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// The embedded scripting language
pub mod interpreter;

/// Step-bounded execution and result rendering
pub mod runtime;

/// TCP server, wire protocol and client
pub mod service;

// Re-export key types for convenience
pub use runtime::{ExecutionResult, Limits, execute, render_response};
pub use service::{Client, Server, ServerConfig};

/// Current version of the scriptport crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TCP port of the service.
pub const DEFAULT_PORT: u16 = 9998;
