//! Shared utilities for mcpwire.
//!
//! This crate provides common utilities used across the mcpwire workspace:
//! - ULID-based session identifiers
//! - Logging setup with tracing

pub mod id;
pub mod log;

pub use id::{is_session_id, new_session_id};
pub use log::{LogConfig, LogLevel};
