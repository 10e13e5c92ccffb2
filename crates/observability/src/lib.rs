//! Logging setup shared by every jobflow binary and test harness.

/// Initialize process-wide logging with the default configuration.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init_with(&LogConfig::default());
}

/// Initialize process-wide logging with an explicit configuration. Returns
/// `false` when a global subscriber was already installed.
pub fn init_with(config: &LogConfig) -> bool {
    subscriber::init_with(config)
}

/// Subscriber installation.
pub mod subscriber;

/// Logging configuration.
pub mod logging;

pub use logging::{LogConfig, LogFormat, ParseLogFormatError};
