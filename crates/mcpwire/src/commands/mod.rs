//! Command handlers for the mcpwire CLI.

pub mod client;
pub mod logging;
pub mod serve;

pub use client::*;
pub use logging::*;
pub use serve::*;
