//! Reconnect backoff and HTTP failure classification.
//!
//! Resumption waits grow exponentially from an initial delay up to a cap,
//! and stop once a deadline measured from the disconnect has passed. A
//! `retry:` value sent by the server replaces the computed delay.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Initial reconnect delay in milliseconds.
pub const RECONNECT_INITIAL_DELAY_MS: u64 = 1000;

/// Growth factor for each further attempt.
pub const RECONNECT_GROWTH_FACTOR: f64 = 1.5;

/// Maximum delay between attempts.
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// How long to keep trying after a disconnect before giving up.
pub const RECONNECT_MAX_ELAPSED_MS: u64 = 60_000;

/// Reconnect tuning, carried in the transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub growth_factor: f64,
    pub max_elapsed_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: RECONNECT_INITIAL_DELAY_MS,
            max_delay_ms: RECONNECT_MAX_DELAY_MS,
            growth_factor: RECONNECT_GROWTH_FACTOR,
            max_elapsed_ms: RECONNECT_MAX_ELAPSED_MS,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given 1-based attempt, ignoring server hints.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.growth_factor.max(1.0).powi(exponent);
        let delay = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }
}

/// How an HTTP status affects the call and the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 429, 502, 503, 504: the call fails, the session stays usable.
    Transient,
    /// 404: the server no longer knows the session.
    SessionNotFound,
    /// 401 and other 4xx: the session is broken.
    Fatal,
    /// Any other 5xx: the call fails, the session stays usable.
    ServerError,
}

/// Classify a non-success status.
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        429 | 502 | 503 | 504 => FailureClass::Transient,
        404 => FailureClass::SessionNotFound,
        500..=599 => FailureClass::ServerError,
        _ => FailureClass::Fatal,
    }
}

/// Sleep for the specified duration, respecting cancellation.
///
/// Returns `false` if cancelled first.
pub async fn sleep_with_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Backoff state for one disconnect.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
    started: Instant,
}

impl Backoff {
    /// Start a retry sequence now.
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            started: Instant::now(),
        }
    }

    /// Delay before the next attempt, or `None` once the deadline has passed.
    pub fn next_delay(&mut self, server_hint: Option<Duration>) -> Option<Duration> {
        let elapsed = self.started.elapsed();
        let max_elapsed = self.config.max_elapsed();
        if elapsed >= max_elapsed {
            debug!(
                attempt = self.attempt,
                elapsed_ms = elapsed.as_millis() as u64,
                "Reconnect deadline reached"
            );
            return None;
        }

        self.attempt += 1;
        let delay = server_hint
            .unwrap_or_else(|| self.config.delay_for(self.attempt))
            .min(max_elapsed - elapsed);
        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        Some(delay)
    }

    /// Start over after a reconnect that made progress.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.started = Instant::now();
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
