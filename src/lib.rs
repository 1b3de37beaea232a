//! agentcast: agent output streaming
//!
//! Runs catalogue agents as child processes and broadcasts their output to
//! any number of HTTP clients as server-sent events, with bounded history
//! replay, keep-alive and input forwarding. The client side follows a stream
//! with automatic exponential-backoff reconnection and pause/resume.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod testing;

pub use cli::{Cli, Command, parse_env_pair};
pub use client::{Client, ClientError, ConnectionState, StreamClient, StreamConfig, StreamError};
pub use config::{AgentDefinition, AgentsConfig, ServerConfig};
pub use protocol::{AgentInfo, AgentStatus, LogLevel, OutputKind, OutputMessage};
pub use server::{OutputHub, Server, ServerError};
pub use testing::{TestError, TestHarness};
