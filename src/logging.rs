//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` formatter behind a reloadable level filter
//! so the engine can raise verbosity when an application runs in debug mode.

use crate::config::{LogLevel, LoggingConfig};
use crate::error::{CourierError, CourierResult};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, reload};
use tracing_subscriber::util::SubscriberInitExt;

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Handle to the installed subscriber's level filter.
///
/// A detached handle (returned when another subscriber was already
/// installed) accepts level changes and ignores them.
#[derive(Clone, Debug)]
pub struct LogHandle {
    filter: Option<FilterHandle>,
}

impl LogHandle {
    /// A handle not connected to any subscriber.
    pub fn detached() -> Self {
        Self { filter: None }
    }

    /// Returns true if level changes reach a subscriber.
    pub fn is_attached(&self) -> bool {
        self.filter.is_some()
    }

    /// Change the active log level.
    pub fn set_level(&self, level: LogLevel) -> CourierResult<()> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };

        filter
            .reload(EnvFilter::new(level.as_directive()))
            .map_err(|e| CourierError::config(format!("failed to change log level: {e}")))
    }
}

impl LogLevel {
    /// Filter directive for this level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// Installing when a global subscriber already exists is not an error; the
/// returned handle is detached in that case.
pub fn init(config: &LoggingConfig) -> LogHandle {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(config.level.as_directive()));

    let formatter = if config.json_format {
        fmt::layer()
            .json()
            .with_target(config.include_targets)
            .boxed()
    } else {
        fmt::layer().with_target(config.include_targets).boxed()
    };

    match tracing_subscriber::registry()
        .with(filter)
        .with(formatter)
        .try_init()
    {
        Ok(()) => LogHandle {
            filter: Some(handle),
        },
        Err(_) => {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
            LogHandle::detached()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_handle_ignores_changes() {
        let handle = LogHandle::detached();
        assert!(!handle.is_attached());
        assert!(handle.set_level(LogLevel::Debug).is_ok());
    }

    #[test]
    fn test_directives() {
        assert_eq!(LogLevel::Debug.as_directive(), "debug");
        assert_eq!(LogLevel::Error.as_directive(), "error");
    }
}
