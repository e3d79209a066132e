//! Automatic retries for messages that fail to process.
//!
//! Installing [`Retry`] puts an error hook in front of every other error
//! hook. When a failure's class is retryable and the message has retries
//! left, the hook waits out the backoff, bumps the message's
//! [`RetryEnvelope`], hands the message to the retry callback and aborts the
//! error chain. Otherwise it returns and the next error hook runs.
//!
//! # Settings
//!
//! | Key                | Default         | Meaning                                        |
//! |--------------------|-----------------|------------------------------------------------|
//! | `RETRY_EXCEPTIONS` | `["retryable"]` | Error class, or list of classes, to retry      |
//! | `RETRY_THRESHOLD`  | `null`          | Maximum retries; `null` retries forever        |
//! | `RETRY_TIMEOUT`    | `null`          | Seconds since the first failure to keep trying |
//! | `RETRY_DELAY`      | `0`             | Base delay in seconds                          |
//! | `RETRY_BACKOFF`    | `1`             | Factor applied as `delay * backoff^count`      |
//! | `RETRY_OVERRIDES`  | absent          | Error class to partial settings                |
//!
//! ```rust
//! use courier::prelude::*;
//!
//! let mut app = Application::new("orders");
//! app.install(Retry::new().with_callback_fn(|_app, message| {
//!     let message = message.clone();
//!     Box::pin(async move {
//!         tracing::info!(%message, "resubmitting");
//!         Ok(())
//!     })
//! }))?;
//! # Ok::<(), CourierError>(())
//! ```

use crate::app::{Application, Extension};
use crate::config::{SecondsExt, Settings};
use crate::core::registry::ErrorHook;
use crate::error::{CourierError, CourierResult, ErrorClass};
use crate::message::{Message, RetryEnvelope};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Called with the message to re-submit it.
pub const RETRY_CALLBACK: &str = "RETRY_CALLBACK";
/// Error classes to retry.
pub const RETRY_EXCEPTIONS: &str = "RETRY_EXCEPTIONS";
/// Maximum number of retries.
pub const RETRY_THRESHOLD: &str = "RETRY_THRESHOLD";
/// Seconds after the first failure during which retries happen.
pub const RETRY_TIMEOUT: &str = "RETRY_TIMEOUT";
/// Base delay in seconds.
pub const RETRY_DELAY: &str = "RETRY_DELAY";
/// Multiplicative backoff factor.
pub const RETRY_BACKOFF: &str = "RETRY_BACKOFF";
/// Per error class partial settings.
pub const RETRY_OVERRIDES: &str = "RETRY_OVERRIDES";

/// Re-submits a message so it is processed again.
#[async_trait]
pub trait RetryCallback: Send + Sync {
    /// Re-submit `message`, whose envelope has already been updated.
    async fn retry(&self, app: &Application, message: &Message) -> CourierResult<()>;
}

/// Closure adapter for [`RetryCallback`].
pub struct FnRetryCallback<F> {
    f: F,
}

impl<F> FnRetryCallback<F>
where
    F: for<'a> Fn(&'a Application, &'a Message) -> BoxFuture<'a, CourierResult<()>> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> RetryCallback for FnRetryCallback<F>
where
    F: for<'a> Fn(&'a Application, &'a Message) -> BoxFuture<'a, CourierResult<()>> + Send + Sync,
{
    async fn retry(&self, app: &Application, message: &Message) -> CourierResult<()> {
        (self.f)(app, message).await
    }
}

/// Return the time to wait, in seconds, before the next retry.
pub fn calculate_delay(delay: f64, backoff: f64, number_of_retries: u32) -> f64 {
    delay * backoff.powf(f64::from(number_of_retries))
}

/// Returns true once `maximum_retries` retries have been made.
pub fn exceeded_threshold(number_of_retries: u32, maximum_retries: Option<u32>) -> bool {
    maximum_retries.is_some_and(|maximum| number_of_retries >= maximum)
}

/// Returns true once `duration` seconds have passed since `start_time`.
pub fn exceeded_timeout(start_time: i64, duration: Option<u64>, now: i64) -> bool {
    duration.is_some_and(|duration| {
        start_time.saturating_add(i64::try_from(duration).unwrap_or(i64::MAX)) <= now
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Resolved retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Error classes to retry
    pub exceptions: Vec<ErrorClass>,
    /// Maximum number of retries, unlimited when `None`
    pub threshold: Option<u32>,
    /// Seconds after the first failure, unlimited when `None`
    pub timeout: Option<u64>,
    /// Base delay in seconds
    pub delay: f64,
    /// Backoff factor
    pub backoff: f64,
}

impl RetryPolicy {
    /// Read the policy from settings.
    pub fn from_settings(settings: &Settings) -> CourierResult<Self> {
        let exceptions = match settings.get_as::<OneOrMany>(RETRY_EXCEPTIONS)? {
            Some(OneOrMany::One(class)) => vec![ErrorClass::new(class)],
            Some(OneOrMany::Many(classes)) => classes.into_iter().map(ErrorClass::new).collect(),
            None => Vec::new(),
        };

        let policy = Self {
            exceptions,
            threshold: settings.get_as(RETRY_THRESHOLD)?,
            timeout: settings.get_as(RETRY_TIMEOUT)?,
            delay: settings.get_as(RETRY_DELAY)?.unwrap_or(0.0),
            backoff: settings.get_as(RETRY_BACKOFF)?.unwrap_or(1.0),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Reject negative delays and backoffs.
    pub fn validate(&self) -> CourierResult<()> {
        if self.delay < 0.0 {
            return Err(CourierError::config("The delay cannot be negative."));
        }
        if self.backoff < 0.0 {
            return Err(CourierError::config("The backoff cannot be negative."));
        }
        Ok(())
    }

    /// Returns true if failures of this class are retried.
    pub fn retries(&self, class: &ErrorClass) -> bool {
        self.exceptions.iter().any(|retryable| class.is_a(retryable))
    }
}

/// Retry policies by error class.
#[derive(Debug, Clone)]
struct RetryPolicies {
    base: RetryPolicy,
    overrides: Vec<(ErrorClass, RetryPolicy)>,
}

impl RetryPolicies {
    fn from_settings(settings: &Settings) -> CourierResult<Self> {
        let base = RetryPolicy::from_settings(settings)?;

        let raw: Map<String, Value> = settings.get_as(RETRY_OVERRIDES)?.unwrap_or_default();
        let mut overrides = Vec::with_capacity(raw.len());
        for (class, partial) in raw {
            let Value::Object(partial) = partial else {
                return Err(CourierError::config(format!(
                    "{RETRY_OVERRIDES} entry for '{class}' must be an object"
                )));
            };

            let mut merged = settings.clone();
            merged.remove(RETRY_OVERRIDES);
            merged.from_mapping(partial);
            overrides.push((ErrorClass::new(class), RetryPolicy::from_settings(&merged)?));
        }

        Ok(Self { base, overrides })
    }

    /// The override for the deepest matching class, or the base policy.
    fn policy_for(&self, class: &ErrorClass) -> &RetryPolicy {
        self.overrides
            .iter()
            .filter(|(matched, _)| class.is_a(matched))
            .max_by_key(|(matched, _)| matched.depth())
            .map(|(_, policy)| policy)
            .unwrap_or(&self.base)
    }
}

/// Extension adding retries to an application.
#[derive(Default)]
pub struct Retry {
    callback: Option<Arc<dyn RetryCallback>>,
}

impl Retry {
    /// Create the extension. A callback must be attached before installing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the callback that re-submits messages.
    pub fn with_callback(mut self, callback: impl RetryCallback + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Attach a closure that re-submits messages.
    pub fn with_callback_fn<F>(self, f: F) -> Self
    where
        F: for<'a> Fn(&'a Application, &'a Message) -> BoxFuture<'a, CourierResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.with_callback(FnRetryCallback::new(f))
    }
}

impl Extension for Retry {
    fn name(&self) -> &str {
        "retry"
    }

    fn default_settings(&self) -> Vec<(&'static str, Value)> {
        vec![
            (RETRY_BACKOFF, json!(1)),
            (RETRY_DELAY, json!(0)),
            (RETRY_EXCEPTIONS, json!([ErrorClass::RETRYABLE])),
            (RETRY_THRESHOLD, Value::Null),
            (RETRY_TIMEOUT, Value::Null),
        ]
    }

    fn init_app(&mut self, app: &mut Application) -> CourierResult<()> {
        let callback = self
            .callback
            .clone()
            .ok_or_else(|| CourierError::MissingSettings {
                extension: self.name().to_string(),
                keys: vec![RETRY_CALLBACK.to_string()],
            })?;
        let policies = RetryPolicies::from_settings(app.settings())?;

        app.callbacks_mut().prepend_error(Box::new(RetryHook {
            callback,
            policies,
        }))
    }
}

struct RetryHook {
    callback: Arc<dyn RetryCallback>,
    policies: RetryPolicies,
}

#[async_trait]
impl ErrorHook for RetryHook {
    async fn on_error(
        &self,
        app: &Application,
        message: &Message,
        error: &CourierError,
    ) -> CourierResult<()> {
        let class = error.class();
        let policy = self.policies.policy_for(&class);
        if !policy.retries(&class) {
            return Ok(());
        }

        let Some(mut envelope) = RetryEnvelope::read(message)? else {
            tracing::warn!(app = %app.name(), class = %class, "cannot retry a message that is not an object");
            return Ok(());
        };

        if exceeded_threshold(envelope.count, policy.threshold) {
            tracing::debug!(app = %app.name(), attempts = envelope.count, "retry threshold reached");
            return Ok(());
        }

        if exceeded_timeout(envelope.start_time, policy.timeout, chrono::Utc::now().timestamp()) {
            tracing::debug!(app = %app.name(), start_time = envelope.start_time, "retry timeout reached");
            return Ok(());
        }

        if policy.delay > 0.0 {
            let delay = calculate_delay(policy.delay, policy.backoff, envelope.count);
            envelope.delay = Some(delay);
            let pause = delay
                .as_duration()
                .ok_or_else(|| CourierError::config(format!("invalid retry delay: {delay}")))?;
            tokio::time::sleep(pause).await;
        }

        envelope.count += 1;
        let mut retried = message.clone();
        envelope.write(&mut retried)?;
        self.callback.retry(app, &retried).await?;

        tracing::info!(app = %app.name(), attempt = envelope.count, class = %class, "message.retried");
        Err(CourierError::abort_with("message.retried", retried))
    }

    fn name(&self) -> &str {
        "retry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::Stage;
    use crate::message::RETRY_KEY;
    use std::sync::Mutex;

    fn recording() -> (Retry, Arc<Mutex<Vec<Message>>>) {
        let retried = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&retried);
        let retry = Retry::new().with_callback_fn(move |_app, message| {
            sink.lock().unwrap().push(message.clone());
            Box::pin(async { Ok(()) })
        });
        (retry, retried)
    }

    fn installed(settings: Settings) -> (Application, Arc<Mutex<Vec<Message>>>) {
        let mut app = Application::with_settings("testing", settings);
        let (retry, retried) = recording();
        app.install(retry).unwrap();
        (app, retried)
    }

    async fn dispatch(app: &Application, message: &Message, error: &CourierError) -> CourierResult<()> {
        app.callbacks().error_hooks()[0].on_error(app, message, error).await
    }

    #[test]
    fn test_calculate_delay() {
        assert_eq!(calculate_delay(10.0, 1.5, 0), 10.0);
        assert_eq!(calculate_delay(10.0, 1.5, 1), 15.0);
        assert_eq!(calculate_delay(10.0, 1.5, 4), 50.625);
    }

    #[test]
    fn test_exceeded_threshold() {
        assert!(!exceeded_threshold(100, None));
        assert!(exceeded_threshold(0, Some(0)));
        assert!(!exceeded_threshold(1, Some(2)));
        assert!(exceeded_threshold(2, Some(2)));
    }

    #[test]
    fn test_exceeded_timeout() {
        assert!(!exceeded_timeout(0, None, 1_000));
        assert!(exceeded_timeout(100, Some(10), 110));
        assert!(!exceeded_timeout(100, Some(10), 109));
    }

    #[test]
    fn test_defaults_applied() {
        let (app, _) = installed(Settings::new());
        assert_eq!(app.settings().get(RETRY_BACKOFF), Some(&json!(1)));
        assert_eq!(app.settings().get(RETRY_EXCEPTIONS), Some(&json!(["retryable"])));
        assert!(app.settings().contains(RETRY_THRESHOLD));
    }

    #[test]
    fn test_missing_callback() {
        let mut app = Application::new("testing");
        let err = app.install(Retry::new()).unwrap_err();
        match err {
            CourierError::MissingSettings { keys, .. } => assert_eq!(keys, vec!["RETRY_CALLBACK"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_negative_settings_rejected() {
        for key in [RETRY_DELAY, RETRY_BACKOFF] {
            let mut settings = Settings::new();
            settings.set(key, json!(-1));
            let mut app = Application::with_settings("testing", settings);
            let (retry, _) = recording();
            assert!(matches!(app.install(retry), Err(CourierError::Config { .. })));
        }
    }

    #[test]
    fn test_negative_override_rejected() {
        let mut settings = Settings::new();
        settings.set(RETRY_OVERRIDES, json!({"retryable.slow": {"RETRY_DELAY": -5}}));
        let mut app = Application::with_settings("testing", settings);
        let (retry, _) = recording();
        assert!(matches!(app.install(retry), Err(CourierError::Config { .. })));
    }

    #[test]
    fn test_hook_runs_first() {
        let mut app = Application::new("testing");
        app.error_fn("report", |_app, _message, _error| Box::pin(async { Ok(()) }))
            .unwrap();
        let (retry, _) = recording();
        app.install(retry).unwrap();

        assert_eq!(app.callbacks().names(Stage::Error), vec!["retry", "report"]);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let (app, retried) = installed(Settings::new());
        let message = json!({"order": 7});

        let err = dispatch(&app, &message, &CourierError::retryable("timeout"))
            .await
            .unwrap_err();
        let abort = err.as_abort().unwrap();
        assert_eq!(abort.reason, "message.retried");

        let retried = retried.lock().unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0]["order"], json!(7));
        assert_eq!(retried[0][RETRY_KEY]["count"], json!(1));
        assert_eq!(abort.payload.as_ref(), Some(&retried[0]));
    }

    #[tokio::test]
    async fn test_subclass_is_retried() {
        let (app, retried) = installed(Settings::new());
        let error = CourierError::failed("retryable.timeout", "slow upstream");
        assert!(dispatch(&app, &json!({}), &error).await.is_err());
        assert_eq!(retried.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_other_failures_pass_through() {
        let (app, retried) = installed(Settings::new());
        let error = CourierError::failed("validation", "bad payload");
        dispatch(&app, &json!({}), &error).await.unwrap();
        assert!(retried.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_zero_declines() {
        let mut settings = Settings::new();
        settings.set(RETRY_THRESHOLD, json!(0));
        let (app, retried) = installed(settings);

        dispatch(&app, &json!({}), &CourierError::retryable("x")).await.unwrap();
        assert!(retried.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_declines() {
        let mut settings = Settings::new();
        settings.set(RETRY_TIMEOUT, json!(60));
        let (app, retried) = installed(settings);

        let message = json!({"_retry": {"count": 1, "start_time": 0}});
        dispatch(&app, &message, &CourierError::retryable("x")).await.unwrap();
        assert!(retried.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scalar_messages_not_retried() {
        let (app, retried) = installed(Settings::new());
        dispatch(&app, &json!("plain"), &CourierError::retryable("x")).await.unwrap();
        assert!(retried.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_recorded_in_envelope() {
        let mut settings = Settings::new();
        settings.set(RETRY_DELAY, json!(10));
        settings.set(RETRY_BACKOFF, json!(1.5));
        let (app, retried) = installed(settings);

        let message = json!({"_retry": {"count": 1, "start_time": 0}});
        let err = dispatch(&app, &message, &CourierError::retryable("x")).await;
        assert!(err.is_err());

        let retried = retried.lock().unwrap();
        assert_eq!(retried[0][RETRY_KEY]["delay"], json!(15.0));
        assert_eq!(retried[0][RETRY_KEY]["count"], json!(2));
    }

    #[tokio::test]
    async fn test_most_specific_override_wins() {
        let mut settings = Settings::new();
        settings.set(
            RETRY_OVERRIDES,
            json!({
                "retryable": {"RETRY_THRESHOLD": 5},
                "retryable.timeout": {"RETRY_THRESHOLD": 0},
            }),
        );
        let (app, retried) = installed(settings);
        let message = json!({"_retry": {"count": 1, "start_time": 0}});

        let timeout = CourierError::failed("retryable.timeout.read", "slow");
        dispatch(&app, &message, &timeout).await.unwrap();
        assert!(retried.lock().unwrap().is_empty());

        let other = CourierError::failed("retryable.conflict", "busy");
        assert!(dispatch(&app, &message, &other).await.is_err());
        assert_eq!(retried.lock().unwrap().len(), 1);
    }
}
