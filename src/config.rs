//! Configuration types for Courier.
//!
//! Applications carry a free-form [`Settings`] store. The engine reads the
//! keys it understands from it into a typed [`EngineConfig`] when it starts,
//! and extensions install their own defaults into it.

use crate::error::{CourierError, CourierResult, ErrorClass};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Enables debug verbosity when the application starts.
pub const DEBUG: &str = "DEBUG";

/// Seconds an idle worker waits before re-checking the completion signal.
pub const SLEEP_TIME: &str = "SLEEP_TIME";

/// Whether a failing result postprocessor stops the whole engine.
pub const POSTPROCESS_FAILURES_FATAL: &str = "POSTPROCESS_FAILURES_FATAL";

/// Error classes that stop the engine even when raised while processing.
pub const FATAL_ERRORS: &str = "FATAL_ERRORS";

/// Default idle poll interval, in seconds.
pub const DEFAULT_SLEEP_TIME: f64 = 0.1;

/// String-keyed application settings.
///
/// Keys are stored exactly as given; by convention they are uppercase.
///
/// # Examples
///
/// ```rust
/// use courier::config::Settings;
/// use serde_json::json;
///
/// let mut settings = Settings::new();
/// settings.set("SLEEP_TIME", json!(0.5));
/// settings.set_default("SLEEP_TIME", json!(0.1));
/// assert_eq!(settings.sleep_time().unwrap().as_millis(), 500);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: BTreeMap<String, Value>,
}

impl Settings {
    /// Create an empty settings store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a raw setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Get a setting deserialized into `T`. `null` values read as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> CourierResult<Option<T>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                CourierError::config(format!("setting {key} has the wrong type: {e}"))
            }),
        }
    }

    /// Set a setting, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Set a setting only if it is absent.
    pub fn set_default(&mut self, key: impl Into<String>, value: Value) {
        self.values.entry(key.into()).or_insert(value);
    }

    /// Returns true if the key is present, even with a `null` value.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Remove a setting.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Extend and override settings with every entry of `mapping`.
    pub fn from_mapping<I, K>(&mut self, mapping: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (key, value) in mapping {
            self.set(key, value);
        }
    }

    /// Extend and override settings with the uppercase fields of `object`.
    ///
    /// Fields are read through `serde`, so `#[serde(rename = ...)]` can be
    /// used to expose uppercase keys from ordinary Rust field names.
    pub fn from_object<T: Serialize>(&mut self, object: &T) -> CourierResult<()> {
        let Value::Object(fields) = serde_json::to_value(object)? else {
            return Err(CourierError::config(
                "settings can only be read from objects with named fields",
            ));
        };

        for (key, value) in fields {
            if is_uppercase_key(&key) {
                self.set(key, value);
            }
        }
        Ok(())
    }

    /// The `DEBUG` setting.
    pub fn debug(&self) -> CourierResult<bool> {
        Ok(self.get_as(DEBUG)?.unwrap_or(false))
    }

    /// The `SLEEP_TIME` setting.
    pub fn sleep_time(&self) -> CourierResult<Duration> {
        let secs: f64 = self.get_as(SLEEP_TIME)?.unwrap_or(DEFAULT_SLEEP_TIME);
        secs.as_duration()
            .ok_or_else(|| CourierError::config(format!("{SLEEP_TIME} must be a non-negative number")))
    }
}

fn is_uppercase_key(key: &str) -> bool {
    key.chars().any(|c| c.is_ascii_alphabetic())
        && key.chars().all(|c| !c.is_lowercase())
}

/// Typed engine configuration resolved from [`Settings`] at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent processing tasks, and the work queue capacity
    pub num_workers: usize,

    /// How long an idle worker waits before re-checking for completion
    pub poll_interval: Duration,

    /// Treat ctrl-c as an interrupt
    pub handle_signals: bool,

    /// Whether a failing result postprocessor stops the engine
    pub postprocess_failures_fatal: bool,

    /// Processing failures of these classes stop the engine
    pub fatal_errors: Vec<ErrorClass>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_interval: Duration::from_secs_f64(DEFAULT_SLEEP_TIME),
            handle_signals: true,
            postprocess_failures_fatal: true,
            fatal_errors: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Resolve the engine configuration from application settings.
    pub fn from_settings(settings: &Settings, num_workers: usize) -> CourierResult<Self> {
        let fatal_errors: Vec<String> = settings.get_as(FATAL_ERRORS)?.unwrap_or_default();

        let config = Self {
            num_workers,
            poll_interval: settings.sleep_time()?,
            postprocess_failures_fatal: settings
                .get_as(POSTPROCESS_FAILURES_FATAL)?
                .unwrap_or(true),
            fatal_errors: fatal_errors.into_iter().map(ErrorClass::from).collect(),
            ..Default::default()
        };

        config
            .validate()
            .map_err(|errors| CourierError::config(errors.join("; ")))?;
        Ok(config)
    }

    /// Enable or disable ctrl-c handling.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Returns true if a processing failure of this class stops the engine.
    pub fn is_fatal(&self, class: &ErrorClass) -> bool {
        self.fatal_errors.iter().any(|fatal| class.is_a(fatal))
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.num_workers == 0 {
            errors.push("Number of workers must be greater than 0".to_string());
        }

        if self.num_workers > 10_000 {
            errors.push("Number of workers should not exceed 10000".to_string());
        }

        if self.fatal_errors.iter().any(|class| class.depth() == 0) {
            errors.push("Fatal error classes cannot be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            include_targets: false,
        }
    }
}

impl LoggingConfig {
    /// Configuration for local development.
    pub fn development() -> Self {
        Self {
            level: LogLevel::Debug,
            include_targets: true,
            ..Default::default()
        }
    }

    /// Configuration for production deployments.
    pub fn production() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

/// Conversion of fractional seconds, as stored in settings.
pub trait SecondsExt {
    /// `None` for negative, NaN or infinite values
    fn as_duration(self) -> Option<Duration>;
}

impl SecondsExt for f64 {
    fn as_duration(self) -> Option<Duration> {
        Duration::try_from_secs_f64(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct ObjectSettings {
        #[serde(rename = "SLEEP_TIME")]
        sleep_time: f64,
        #[serde(rename = "RETRY_DELAY")]
        retry_delay: u64,
        lowercase: bool,
    }

    #[test]
    fn test_set_default_keeps_existing() {
        let mut settings = Settings::new();
        settings.set("A", json!(1));
        settings.set_default("A", json!(2));
        settings.set_default("B", json!(3));

        assert_eq!(settings.get("A"), Some(&json!(1)));
        assert_eq!(settings.get("B"), Some(&json!(3)));
        assert_eq!(settings.keys().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn test_from_object_reads_uppercase_only() {
        let mut settings = Settings::new();
        settings
            .from_object(&ObjectSettings {
                sleep_time: 0.25,
                retry_delay: 3,
                lowercase: true,
            })
            .unwrap();

        assert_eq!(settings.sleep_time().unwrap(), Duration::from_millis(250));
        assert_eq!(settings.get_as::<u64>("RETRY_DELAY").unwrap(), Some(3));
        assert!(!settings.contains("lowercase"));
    }

    #[test]
    fn test_from_object_rejects_scalars() {
        let mut settings = Settings::new();
        assert!(settings.from_object(&42).is_err());
    }

    #[test]
    fn test_from_mapping_overrides() {
        let mut settings = Settings::new();
        settings.set("DEBUG", json!(false));
        settings.from_mapping([("DEBUG", json!(true)), ("lower", json!(1))]);

        assert!(settings.debug().unwrap());
        assert!(settings.contains("lower"));
    }

    #[test]
    fn test_null_reads_as_absent() {
        let mut settings = Settings::new();
        settings.set("RETRY_THRESHOLD", Value::Null);
        assert!(settings.contains("RETRY_THRESHOLD"));
        assert_eq!(settings.get_as::<u32>("RETRY_THRESHOLD").unwrap(), None);
    }

    #[test]
    fn test_wrong_type_is_config_error() {
        let mut settings = Settings::new();
        settings.set(DEBUG, json!("yes"));
        let err = settings.debug().unwrap_err();
        assert!(matches!(err, CourierError::Config { .. }));
    }

    #[test]
    fn test_engine_config_from_settings() {
        let mut settings = Settings::new();
        settings.set(SLEEP_TIME, json!(0.01));
        settings.set(POSTPROCESS_FAILURES_FATAL, json!(false));
        settings.set(FATAL_ERRORS, json!(["database"]));

        let config = EngineConfig::from_settings(&settings, 4).unwrap();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert!(!config.postprocess_failures_fatal);
        assert!(config.is_fatal(&"database.timeout".into()));
        assert!(!config.is_fatal(&"retryable".into()));
    }

    #[test]
    fn test_engine_config_validation() {
        let settings = Settings::new();
        assert!(EngineConfig::from_settings(&settings, 0).is_err());

        let mut settings = Settings::new();
        settings.set(SLEEP_TIME, json!(-1.0));
        assert!(EngineConfig::from_settings(&settings, 1).is_err());

        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());
        config.num_workers = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("workers")));

        config.num_workers = 4;
        let config = config.with_signal_handling(false);
        assert!(config.validate().is_ok());
        assert!(!config.handle_signals);
    }

    #[test]
    fn test_logging_presets() {
        assert_eq!(LoggingConfig::development().level, LogLevel::Debug);
        assert!(LoggingConfig::production().json_format);
        assert_eq!(tracing::Level::from(LogLevel::Warn), tracing::Level::WARN);
    }

    #[test]
    fn test_duration_ext() {
        assert_eq!(5u64.secs(), Duration::from_secs(5));
        assert_eq!(1500u64.millis(), Duration::from_millis(1500));
        assert_eq!(0.5f64.as_duration(), Some(Duration::from_millis(500)));
        assert_eq!((-0.5f64).as_duration(), None);
    }
}
