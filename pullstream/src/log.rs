//! Logging Setup
//!
//! The engine emits `tracing` events at its lifecycle points:
//!
//! - scope open/close and channel close at `trace`
//! - finalizer runs, interruptions and stream completion at `debug`
//! - failing finalizers at `warn`
//!
//! Nothing is printed unless a subscriber is installed. [`init_tracing`]
//! installs a `tracing-subscriber` formatter driven by a [`LogConfig`];
//! applications with their own subscriber simply skip it.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, LogConfig};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs a global `fmt` subscriber for `config`.
///
/// `RUST_LOG` takes precedence over the configured filter. Calling this again
/// after a successful install does nothing.
pub fn init_tracing(config: &LogConfig) -> Result<(), ConfigError> {
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }

    let directive = config.directive();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };

    match installed {
        Ok(()) => {
            INSTALLED.store(true, Ordering::Release);
            tracing::debug!(filter = %config.directive(), "tracing initialized");
            Ok(())
        }
        Err(error) => Err(ConfigError::Subscriber(error.to_string())),
    }
}

/// Returns `true` once [`init_tracing`] has installed a subscriber.
pub fn is_initialized() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig {
            level: LogLevel::Warn,
            ..LogConfig::default()
        };
        // Another test binary may already own the global subscriber.
        if init_tracing(&config).is_ok() {
            assert!(is_initialized());
            assert!(init_tracing(&config).is_ok());
        }
    }
}
