//! Intercepting proxy for the memcached binary protocol
//!
//! Architecture:
//! - `core/`: framing, packet model, hook registry and dispatch, pipelines
//! - `business/`: built-in hooks, hook file loading, statistics
//! - `handler`: per-connection processing
//! - `server_runner`: listener setup and accept loop

pub mod business;
pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod logger;
pub mod server_runner;

pub use error::{FrameError, ProxyError};
