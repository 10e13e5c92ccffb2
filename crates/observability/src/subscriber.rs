//! Tracing subscriber installation.

use tracing_subscriber::EnvFilter;

use crate::logging::{LogConfig, LogFormat};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `config.default_filter`. If a global
/// subscriber is already set this does nothing and returns `false`.
pub fn init_with(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(config.with_target);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    }
    .is_ok();

    if installed {
        tracing::debug!(
            format = %config.format,
            default_filter = %config.default_filter,
            "logging initialized"
        );
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_init_installs() {
        init_with(&LogConfig::default().with_default_filter("warn"));
        assert!(!init_with(&LogConfig::default().with_format(LogFormat::Pretty)));
    }
}
