//! Logging initialization.
//!
//! Logs go to stderr so `call` and `listen` output stays pipeable.

use mcpwire_util::log::{self, LogConfig};
use mcpwire_util::LogLevel;

const VERBOSE_DIRECTIVES: &str = "mcpwire=debug,mcpwire_mcp=debug,tower_http=debug";

/// Filter directives for our crates at `level`.
pub fn directives(verbose: bool, level: LogLevel) -> String {
    if verbose {
        return VERBOSE_DIRECTIVES.to_string();
    }
    format!("mcpwire={level},mcpwire_mcp={level},tower_http={level}")
}

/// Initialize logging. `RUST_LOG` still overrides.
pub fn init_logging(verbose: bool, level: LogLevel) {
    let config = LogConfig {
        level,
        directives: Some(directives(verbose, level)),
        ..Default::default()
    };
    if let Err(e) = log::init(config) {
        eprintln!("Warning: Could not initialize logging: {e}");
    }
}
