//! Logging and tracing initialization for litesentry.
//!
//! Structured logging using the `tracing` ecosystem, with either pretty
//! console output or JSON output for machine parsing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
#[derive(Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

/// Initialize the tracing subscriber with the given configuration.
///
/// Call once, early in main(), after config is loaded. `RUST_LOG` overrides
/// the default level.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "litesentry={}",
            default_level.as_str().to_lowercase()
        ))
    });

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

const MASK: &str = "***";

/// Replace every occurrence of each secret in `text` with `***`.
///
/// Remote stderr and error strings can echo back things like a sudo password
/// prompt reply; anything that ends up in a log line or a job's error text
/// goes through here when masking is enabled.
pub fn mask_secrets(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret, MASK))
}

/// A rate limiter for throttling log messages.
///
/// Useful for transfer progress that would otherwise spam the logs.
pub struct LogThrottle {
    interval_ms: u64,
    /// Stores the last log time in ms, or u64::MAX to indicate "never logged"
    last_log_ms: AtomicU64,
    start: Instant,
}

/// Sentinel value indicating the throttle has never logged
const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    /// Create a new throttle with the given minimum interval between logs.
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// Returns true if enough time has passed since the last log.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let should = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;

        if should {
            // Lost race means another thread logged
            self.last_log_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// Reset the throttle, allowing the next log immediately.
    pub fn reset(&self) {
        self.last_log_ms.store(NEVER_LOGGED, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn throttle_allows_first_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_reset_allows_log() {
        let throttle = LogThrottle::new(Duration::from_secs(100));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn mask_replaces_every_secret_occurrence() {
        let masked = mask_secrets(
            "[sudo] password: hunter2 / retry hunter2 key=abc",
            &["hunter2", "abc", ""],
        );
        assert_eq!(masked, "[sudo] password: *** / retry *** key=***");
    }

    #[test]
    fn mask_without_secrets_is_identity() {
        assert_eq!(mask_secrets("plain output", &[]), "plain output");
    }
}
