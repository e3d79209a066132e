//! The application: a consumer wired to a processor, surrounded by hooks.
//!
//! # Examples
//!
//! ```rust,no_run
//! use courier::prelude::*;
//! use serde_json::json;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Processor for Echo {
//!     async fn process(&self, _app: &Application, message: &Message) -> CourierResult<Results> {
//!         Ok(Some(vec![message.clone()]))
//!     }
//! }
//!
//! fn main() -> CourierResult<()> {
//!     let mut app = Application::new("echo");
//!     app.set_consumer(IterConsumer::new(vec![json!(1), json!(2)]));
//!     app.set_processor(Echo);
//!     app.run_forever(2)
//! }
//! ```

use crate::config::Settings;
use crate::core::engine::{Engine, ShutdownHandle};
use crate::core::registry::{
    AcknowledgementHook, CallbackRegistry, ErrorHook, FnAcknowledgementHook, FnErrorHook,
    FnLifecycleHook, FnMessagePreprocessor, FnResultPostprocessor, LifecycleHook,
    MessagePreprocessor, ResultPostprocessor,
};
use crate::error::{CourierError, CourierResult};
use crate::logging::LogHandle;
use crate::message::{Message, Outcome, Results};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "metrics")]
use crate::metrics::CourierMetrics;

/// Source of messages.
///
/// Returning [`CourierError::Abort`] signals the end of the stream; any other
/// error is a consumer failure and stops the application.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Read the next message, waiting as long as needed.
    async fn read(&mut self) -> CourierResult<Message>;
}

/// The primary callback every message is passed to.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process a (possibly preprocessed) message into zero or more results.
    async fn process(&self, app: &Application, message: &Message) -> CourierResult<Results>;
}

/// Consumer yielding the items of an iterator, then ending the stream.
pub struct IterConsumer<I> {
    items: I,
}

impl<I> IterConsumer<I>
where
    I: Iterator<Item = Message> + Send + Sync,
{
    /// Consume everything `items` yields.
    pub fn new(items: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

#[async_trait]
impl<I> Consumer for IterConsumer<I>
where
    I: Iterator<Item = Message> + Send + Sync,
{
    async fn read(&mut self) -> CourierResult<Message> {
        self.items
            .next()
            .ok_or_else(|| CourierError::abort("consumer.exhausted"))
    }
}

/// Closure adapter for [`Processor`].
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F>
where
    F: for<'a> Fn(&'a Application, &'a Message) -> BoxFuture<'a, CourierResult<Results>> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: for<'a> Fn(&'a Application, &'a Message) -> BoxFuture<'a, CourierResult<Results>> + Send + Sync,
{
    async fn process(&self, app: &Application, message: &Message) -> CourierResult<Results> {
        (self.f)(app, message).await
    }
}

/// A plugin installed into an application at most once.
///
/// Installing applies [`default_settings`](Extension::default_settings)
/// without overriding anything already set, checks that every
/// [`required_settings`](Extension::required_settings) key is present, and
/// then calls [`init_app`](Extension::init_app).
pub trait Extension: Any + Send + Sync {
    /// Key the extension is registered under.
    fn name(&self) -> &str;

    /// Settings applied when absent.
    fn default_settings(&self) -> Vec<(&'static str, Value)> {
        Vec::new()
    }

    /// Settings that must be present once defaults are applied.
    fn required_settings(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Wire the extension into the application.
    fn init_app(&mut self, app: &mut Application) -> CourierResult<()>;
}

/// A message-processing application.
///
/// Construct it, register hooks, set a consumer and a processor, then call
/// [`run`](Application::run) or [`run_forever`](Application::run_forever).
/// While running, every hook receives the application by reference.
pub struct Application {
    name: String,
    settings: Settings,
    consumer: Option<Box<dyn Consumer>>,
    processor: Option<Arc<dyn Processor>>,
    callbacks: CallbackRegistry,
    extensions: HashMap<String, Arc<dyn Any + Send + Sync>>,
    log_handle: Option<LogHandle>,
    shutdown: ShutdownHandle,
    handle_signals: bool,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<CourierMetrics>>,
}

impl Application {
    /// Create an application with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, Settings::new())
    }

    /// Create an application from existing settings.
    pub fn with_settings(name: impl Into<String>, mut settings: Settings) -> Self {
        settings.set_default(crate::config::SLEEP_TIME, json!(crate::config::DEFAULT_SLEEP_TIME));
        settings.set_default(crate::config::DEBUG, json!(false));

        Self {
            name: name.into(),
            settings,
            consumer: None,
            processor: None,
            callbacks: CallbackRegistry::new(),
            extensions: HashMap::new(),
            log_handle: None,
            shutdown: ShutdownHandle::new(),
            handle_signals: true,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// The application name, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The application settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mutable access to the settings, before the application runs.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Set the message source.
    pub fn set_consumer(&mut self, consumer: impl Consumer + 'static) {
        self.consumer = Some(Box::new(consumer));
    }

    /// Set the primary callback.
    pub fn set_processor(&mut self, processor: impl Processor + 'static) {
        self.processor = Some(Arc::new(processor));
    }

    /// Set the primary callback from a closure.
    pub fn set_processor_fn<F>(&mut self, f: F)
    where
        F: for<'a> Fn(&'a Application, &'a Message) -> BoxFuture<'a, CourierResult<Results>>
            + Send
            + Sync
            + 'static,
    {
        self.set_processor(FnProcessor::new(f));
    }

    /// Attach the handle used to raise verbosity in debug mode.
    pub fn set_log_handle(&mut self, handle: LogHandle) {
        self.log_handle = Some(handle);
    }

    /// Whether ctrl-c interrupts the application. Enabled by default.
    pub fn handle_signals(&mut self, enabled: bool) {
        self.handle_signals = enabled;
    }

    /// Handle that interrupts the application from anywhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Attach pipeline counters.
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub fn set_metrics(&mut self, metrics: Arc<CourierMetrics>) {
        self.metrics = Some(metrics);
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn metrics(&self) -> Option<&CourierMetrics> {
        self.metrics.as_deref()
    }

    /// The registered hooks.
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// Mutable access to the registered hooks.
    pub fn callbacks_mut(&mut self) -> &mut CallbackRegistry {
        &mut self.callbacks
    }

    /// Register a hook run before any message is read.
    pub fn startup(&mut self, hook: impl LifecycleHook + 'static) -> CourierResult<()> {
        self.callbacks.register_startup(Box::new(hook))
    }

    /// Register a closure run before any message is read.
    pub fn startup_fn<F>(&mut self, name: impl Into<String>, f: F) -> CourierResult<()>
    where
        F: for<'a> Fn(&'a Application) -> BoxFuture<'a, CourierResult<()>> + Send + Sync + 'static,
    {
        self.startup(FnLifecycleHook::new(name, f))
    }

    /// Register a hook run once every worker has exited.
    pub fn teardown(&mut self, hook: impl LifecycleHook + 'static) -> CourierResult<()> {
        self.callbacks.register_teardown(Box::new(hook))
    }

    /// Register a closure run once every worker has exited.
    pub fn teardown_fn<F>(&mut self, name: impl Into<String>, f: F) -> CourierResult<()>
    where
        F: for<'a> Fn(&'a Application) -> BoxFuture<'a, CourierResult<()>> + Send + Sync + 'static,
    {
        self.teardown(FnLifecycleHook::new(name, f))
    }

    /// Register a hook run when processing a message fails.
    pub fn error(&mut self, hook: impl ErrorHook + 'static) -> CourierResult<()> {
        self.callbacks.register_error(Box::new(hook))
    }

    /// Register a closure run when processing a message fails.
    pub fn error_fn<F>(&mut self, name: impl Into<String>, f: F) -> CourierResult<()>
    where
        F: for<'a> Fn(&'a Application, &'a Message, &'a CourierError) -> BoxFuture<'a, CourierResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.error(FnErrorHook::new(name, f))
    }

    /// Register a hook run with the original of every dequeued message.
    pub fn message_acknowledgement(
        &mut self,
        hook: impl AcknowledgementHook + 'static,
    ) -> CourierResult<()> {
        self.callbacks.register_acknowledgement(Box::new(hook))
    }

    /// Register a closure run with the original of every dequeued message.
    pub fn message_acknowledgement_fn<F>(&mut self, name: impl Into<String>, f: F) -> CourierResult<()>
    where
        F: for<'a> Fn(&'a Application, &'a Message) -> BoxFuture<'a, CourierResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.message_acknowledgement(FnAcknowledgementHook::new(name, f))
    }

    /// Register a message preprocessor.
    pub fn message_preprocessor(
        &mut self,
        hook: impl MessagePreprocessor + 'static,
    ) -> CourierResult<()> {
        self.callbacks.register_preprocessor(Box::new(hook))
    }

    /// Register a closure as a message preprocessor.
    pub fn message_preprocessor_fn<F>(&mut self, name: impl Into<String>, f: F) -> CourierResult<()>
    where
        F: for<'a> Fn(&'a Application, Message) -> BoxFuture<'a, CourierResult<Message>>
            + Send
            + Sync
            + 'static,
    {
        self.message_preprocessor(FnMessagePreprocessor::new(name, f))
    }

    /// Register a result postprocessor.
    pub fn result_postprocessor(
        &mut self,
        hook: impl ResultPostprocessor + 'static,
    ) -> CourierResult<()> {
        self.callbacks.register_postprocessor(Box::new(hook))
    }

    /// Register a closure as a result postprocessor.
    pub fn result_postprocessor_fn<F>(&mut self, name: impl Into<String>, f: F) -> CourierResult<()>
    where
        F: for<'a> Fn(&'a Application, Outcome) -> BoxFuture<'a, CourierResult<Outcome>>
            + Send
            + Sync
            + 'static,
    {
        self.result_postprocessor(FnResultPostprocessor::new(name, f))
    }

    /// Install an extension. Installing the same extension twice is a no-op.
    ///
    /// Returns `false` if an extension with the same name was already
    /// installed.
    pub fn install<E: Extension>(&mut self, mut extension: E) -> CourierResult<bool> {
        let name = extension.name().to_string();
        if self.extensions.contains_key(&name) {
            tracing::debug!(app = %self.name, extension = %name, "extension already installed");
            return Ok(false);
        }

        for (key, value) in extension.default_settings() {
            self.settings.set_default(key, value);
        }

        let missing: Vec<String> = extension
            .required_settings()
            .into_iter()
            .filter(|key| !self.settings.contains(key))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(CourierError::MissingSettings {
                extension: name,
                keys: missing,
            });
        }

        extension.init_app(self)?;
        tracing::info!(app = %self.name, extension = %name, "extension.installed");
        self.extensions.insert(name, Arc::new(extension));
        Ok(true)
    }

    /// An installed extension, by name.
    pub fn extension<E: Extension>(&self, name: &str) -> Option<&E> {
        self.extensions.get(name)?.downcast_ref::<E>()
    }

    /// Run until the consumer is exhausted, a fatal error occurs, or the
    /// application is interrupted.
    pub async fn run(self, num_workers: usize) -> CourierResult<()> {
        Engine::new(self, num_workers).run().await
    }

    /// Run on a dedicated single-threaded runtime, released on return.
    pub fn run_forever(self, num_workers: usize) -> CourierResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CourierError::config(format!("failed to build runtime: {e}")))?;

        let outcome = runtime.block_on(self.run(num_workers));
        drop(runtime);
        outcome
    }

    pub(crate) fn take_consumer(&mut self) -> Option<Box<dyn Consumer>> {
        self.consumer.take()
    }

    pub(crate) fn processor(&self) -> Option<&Arc<dyn Processor>> {
        self.processor.as_ref()
    }

    pub(crate) fn log_handle(&self) -> Option<&LogHandle> {
        self.log_handle.as_ref()
    }

    pub(crate) fn signals_enabled(&self) -> bool {
        self.handle_signals
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("consumer", &self.consumer.is_some())
            .field("processor", &self.processor.is_some())
            .field("callbacks", &self.callbacks)
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .finish()
    }
}
