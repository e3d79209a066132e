//! Callback registry for Courier applications.
//!
//! Every lifecycle stage owns an ordered list of typed hooks. Registration
//! order is execution order: preprocessors and postprocessors are chained, so
//! each hook's output feeds the next one.
//!
//! # Overview
//!
//! | Stage                     | Hook trait              | Called with                     |
//! |---------------------------|-------------------------|---------------------------------|
//! | `startup` / `teardown`    | [`LifecycleHook`]       | `(app)`                         |
//! | `error`                   | [`ErrorHook`]           | `(app, message, error)`         |
//! | `message_acknowledgement` | [`AcknowledgementHook`] | `(app, original_message)`       |
//! | `message_preprocessor`    | [`MessagePreprocessor`] | `(app, message) -> message`     |
//! | `result_postprocessor`    | [`ResultPostprocessor`] | `(app, result) -> result`       |
//!
//! Closures can be registered through the `Fn*` adapters, which take
//! closures returning a boxed future:
//!
//! ```rust
//! use courier::prelude::*;
//!
//! let mut app = Application::new("uppercase");
//! app.message_preprocessor_fn("uppercase", |_app, message| {
//!     Box::pin(async move {
//!         Ok(message.as_str().map(|s| s.to_uppercase().into()).unwrap_or(message))
//!     })
//! })?;
//! # Ok::<(), CourierError>(())
//! ```

use crate::app::Application;
use crate::error::{CourierError, CourierResult};
use crate::message::{Message, Outcome};
use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use std::fmt;

/// Lifecycle stages hooks can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before any message is read
    Startup,
    /// After every worker has exited
    Teardown,
    /// When preprocessing or the primary callback fails
    Error,
    /// After every dequeued message, whatever happened to it
    MessageAcknowledgement,
    /// Before the primary callback, chained
    MessagePreprocessor,
    /// For every result of the primary callback, chained
    ResultPostprocessor,
}

impl Stage {
    /// Name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Startup => "startup",
            Stage::Teardown => "teardown",
            Stage::Error => "error",
            Stage::MessageAcknowledgement => "message_acknowledgement",
            Stage::MessagePreprocessor => "message_preprocessor",
            Stage::ResultPostprocessor => "result_postprocessor",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook run once when the application starts or stops.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Run the hook.
    async fn call(&self, app: &Application) -> CourierResult<()>;

    /// Identity used in logs. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Hook run when preprocessing or the primary callback fails.
///
/// Returning an [`Abort`](crate::error::Abort) stops the remaining error
/// hooks from running. Any other error is fatal to the worker.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    /// Handle the failure of `message`.
    async fn on_error(
        &self,
        app: &Application,
        message: &Message,
        error: &CourierError,
    ) -> CourierResult<()>;

    /// Identity used in logs. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Hook run after every dequeued message with the pristine original.
#[async_trait]
pub trait AcknowledgementHook: Send + Sync {
    /// Acknowledge `original`.
    async fn acknowledge(&self, app: &Application, original: &Message) -> CourierResult<()>;

    /// Identity used in logs. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Transforms a message before it reaches the primary callback.
#[async_trait]
pub trait MessagePreprocessor: Send + Sync {
    /// Return the message the next preprocessor (or the callback) receives.
    async fn preprocess(&self, app: &Application, message: Message) -> CourierResult<Message>;

    /// Identity used in logs. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Transforms each result returned by the primary callback.
#[async_trait]
pub trait ResultPostprocessor: Send + Sync {
    /// Return the result the next postprocessor receives.
    async fn postprocess(&self, app: &Application, result: Outcome) -> CourierResult<Outcome>;

    /// Identity used in logs. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Closure adapter for [`LifecycleHook`].
pub struct FnLifecycleHook<F> {
    name: String,
    f: F,
}

impl<F> FnLifecycleHook<F>
where
    F: for<'a> Fn(&'a Application) -> BoxFuture<'a, CourierResult<()>> + Send + Sync,
{
    /// Wrap a closure under the given name.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> LifecycleHook for FnLifecycleHook<F>
where
    F: for<'a> Fn(&'a Application) -> BoxFuture<'a, CourierResult<()>> + Send + Sync,
{
    async fn call(&self, app: &Application) -> CourierResult<()> {
        (self.f)(app).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Closure adapter for [`ErrorHook`].
pub struct FnErrorHook<F> {
    name: String,
    f: F,
}

impl<F> FnErrorHook<F>
where
    F: for<'a> Fn(&'a Application, &'a Message, &'a CourierError) -> BoxFuture<'a, CourierResult<()>>
        + Send
        + Sync,
{
    /// Wrap a closure under the given name.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> ErrorHook for FnErrorHook<F>
where
    F: for<'a> Fn(&'a Application, &'a Message, &'a CourierError) -> BoxFuture<'a, CourierResult<()>>
        + Send
        + Sync,
{
    async fn on_error(
        &self,
        app: &Application,
        message: &Message,
        error: &CourierError,
    ) -> CourierResult<()> {
        (self.f)(app, message, error).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Closure adapter for [`AcknowledgementHook`].
pub struct FnAcknowledgementHook<F> {
    name: String,
    f: F,
}

impl<F> FnAcknowledgementHook<F>
where
    F: for<'a> Fn(&'a Application, &'a Message) -> BoxFuture<'a, CourierResult<()>> + Send + Sync,
{
    /// Wrap a closure under the given name.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> AcknowledgementHook for FnAcknowledgementHook<F>
where
    F: for<'a> Fn(&'a Application, &'a Message) -> BoxFuture<'a, CourierResult<()>> + Send + Sync,
{
    async fn acknowledge(&self, app: &Application, original: &Message) -> CourierResult<()> {
        (self.f)(app, original).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Closure adapter for [`MessagePreprocessor`].
pub struct FnMessagePreprocessor<F> {
    name: String,
    f: F,
}

impl<F> FnMessagePreprocessor<F>
where
    F: for<'a> Fn(&'a Application, Message) -> BoxFuture<'a, CourierResult<Message>> + Send + Sync,
{
    /// Wrap a closure under the given name.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> MessagePreprocessor for FnMessagePreprocessor<F>
where
    F: for<'a> Fn(&'a Application, Message) -> BoxFuture<'a, CourierResult<Message>> + Send + Sync,
{
    async fn preprocess(&self, app: &Application, message: Message) -> CourierResult<Message> {
        (self.f)(app, message).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Closure adapter for [`ResultPostprocessor`].
pub struct FnResultPostprocessor<F> {
    name: String,
    f: F,
}

impl<F> FnResultPostprocessor<F>
where
    F: for<'a> Fn(&'a Application, Outcome) -> BoxFuture<'a, CourierResult<Outcome>> + Send + Sync,
{
    /// Wrap a closure under the given name.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> ResultPostprocessor for FnResultPostprocessor<F>
where
    F: for<'a> Fn(&'a Application, Outcome) -> BoxFuture<'a, CourierResult<Outcome>> + Send + Sync,
{
    async fn postprocess(&self, app: &Application, result: Outcome) -> CourierResult<Outcome> {
        (self.f)(app, result).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Ordered hook lists, one per lifecycle stage.
///
/// The registry is frozen when the engine starts; registering after that
/// point is rejected.
#[derive(Default)]
pub struct CallbackRegistry {
    startup: Vec<Box<dyn LifecycleHook>>,
    teardown: Vec<Box<dyn LifecycleHook>>,
    error: Vec<Box<dyn ErrorHook>>,
    message_acknowledgement: Vec<Box<dyn AcknowledgementHook>>,
    message_preprocessor: Vec<Box<dyn MessagePreprocessor>>,
    result_postprocessor: Vec<Box<dyn ResultPostprocessor>>,
    frozen: bool,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn admit(&self, stage: Stage, name: &str) -> CourierResult<()> {
        if self.frozen {
            return Err(CourierError::invalid_callback(
                stage.as_str(),
                format!("cannot register '{name}' while the application is running"),
            ));
        }

        if name.trim().is_empty() {
            return Err(CourierError::invalid_callback(
                stage.as_str(),
                "callbacks must have a non-empty name",
            ));
        }

        tracing::info!(stage = %stage, callback = name, "callback.registered");
        Ok(())
    }

    /// Register a startup hook.
    pub fn register_startup(&mut self, hook: Box<dyn LifecycleHook>) -> CourierResult<()> {
        self.admit(Stage::Startup, hook.name())?;
        self.startup.push(hook);
        Ok(())
    }

    /// Register a teardown hook.
    pub fn register_teardown(&mut self, hook: Box<dyn LifecycleHook>) -> CourierResult<()> {
        self.admit(Stage::Teardown, hook.name())?;
        self.teardown.push(hook);
        Ok(())
    }

    /// Register an error hook at the end of the chain.
    pub fn register_error(&mut self, hook: Box<dyn ErrorHook>) -> CourierResult<()> {
        self.admit(Stage::Error, hook.name())?;
        self.error.push(hook);
        Ok(())
    }

    /// Register an error hook ahead of every hook already registered.
    pub fn prepend_error(&mut self, hook: Box<dyn ErrorHook>) -> CourierResult<()> {
        self.admit(Stage::Error, hook.name())?;
        self.error.insert(0, hook);
        Ok(())
    }

    /// Register an acknowledgement hook.
    pub fn register_acknowledgement(
        &mut self,
        hook: Box<dyn AcknowledgementHook>,
    ) -> CourierResult<()> {
        self.admit(Stage::MessageAcknowledgement, hook.name())?;
        self.message_acknowledgement.push(hook);
        Ok(())
    }

    /// Register a message preprocessor.
    pub fn register_preprocessor(
        &mut self,
        hook: Box<dyn MessagePreprocessor>,
    ) -> CourierResult<()> {
        self.admit(Stage::MessagePreprocessor, hook.name())?;
        self.message_preprocessor.push(hook);
        Ok(())
    }

    /// Register a result postprocessor.
    pub fn register_postprocessor(
        &mut self,
        hook: Box<dyn ResultPostprocessor>,
    ) -> CourierResult<()> {
        self.admit(Stage::ResultPostprocessor, hook.name())?;
        self.result_postprocessor.push(hook);
        Ok(())
    }

    /// Reject any further registration.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Returns true once the engine has started.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of hooks registered for a stage.
    pub fn len(&self, stage: Stage) -> usize {
        match stage {
            Stage::Startup => self.startup.len(),
            Stage::Teardown => self.teardown.len(),
            Stage::Error => self.error.len(),
            Stage::MessageAcknowledgement => self.message_acknowledgement.len(),
            Stage::MessagePreprocessor => self.message_preprocessor.len(),
            Stage::ResultPostprocessor => self.result_postprocessor.len(),
        }
    }

    /// Hook names for a stage, in execution order.
    pub fn names(&self, stage: Stage) -> Vec<&str> {
        match stage {
            Stage::Startup => self.startup.iter().map(|h| h.name()).collect(),
            Stage::Teardown => self.teardown.iter().map(|h| h.name()).collect(),
            Stage::Error => self.error.iter().map(|h| h.name()).collect(),
            Stage::MessageAcknowledgement => {
                self.message_acknowledgement.iter().map(|h| h.name()).collect()
            }
            Stage::MessagePreprocessor => {
                self.message_preprocessor.iter().map(|h| h.name()).collect()
            }
            Stage::ResultPostprocessor => {
                self.result_postprocessor.iter().map(|h| h.name()).collect()
            }
        }
    }

    /// Error hooks in execution order.
    pub fn error_hooks(&self) -> &[Box<dyn ErrorHook>] {
        &self.error
    }

    /// Acknowledgement hooks in execution order.
    pub fn acknowledgement_hooks(&self) -> &[Box<dyn AcknowledgementHook>] {
        &self.message_acknowledgement
    }

    /// Run every preprocessor in order, feeding each one's output to the next.
    ///
    /// Partial output is discarded when a preprocessor fails.
    pub async fn preprocess(&self, app: &Application, mut message: Message) -> CourierResult<Message> {
        for hook in &self.message_preprocessor {
            message = hook.preprocess(app, message).await?;
        }
        Ok(message)
    }

    /// Run every postprocessor in order over a single result.
    pub async fn postprocess(&self, app: &Application, mut result: Outcome) -> CourierResult<Outcome> {
        for hook in &self.result_postprocessor {
            result = hook.postprocess(app, result).await?;
        }
        Ok(result)
    }

    /// Run every hook of a lifecycle stage concurrently and wait for all of them.
    ///
    /// Returns the failures paired with the name of the hook that raised them.
    pub async fn run_lifecycle(&self, stage: Stage, app: &Application) -> Vec<(String, CourierError)> {
        let hooks = match stage {
            Stage::Startup => &self.startup,
            Stage::Teardown => &self.teardown,
            _ => return Vec::new(),
        };

        let outcomes = join_all(hooks.iter().map(|hook| async move {
            hook.call(app)
                .await
                .map_err(|error| (hook.name().to_string(), error))
        }))
        .await;

        outcomes.into_iter().filter_map(Result::err).collect()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("startup", &self.names(Stage::Startup))
            .field("teardown", &self.names(Stage::Teardown))
            .field("error", &self.names(Stage::Error))
            .field(
                "message_acknowledgement",
                &self.names(Stage::MessageAcknowledgement),
            )
            .field(
                "message_preprocessor",
                &self.names(Stage::MessagePreprocessor),
            )
            .field(
                "result_postprocessor",
                &self.names(Stage::ResultPostprocessor),
            )
            .field("frozen", &self.frozen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AddOne;

    #[async_trait]
    impl MessagePreprocessor for AddOne {
        async fn preprocess(&self, _app: &Application, message: Message) -> CourierResult<Message> {
            Ok(json!(message.as_i64().unwrap_or_default() + 1))
        }
    }

    struct Double;

    #[async_trait]
    impl MessagePreprocessor for Double {
        async fn preprocess(&self, _app: &Application, message: Message) -> CourierResult<Message> {
            Ok(json!(message.as_i64().unwrap_or_default() * 2))
        }

        fn name(&self) -> &str {
            "double"
        }
    }

    struct Unnamed;

    #[async_trait]
    impl LifecycleHook for Unnamed {
        async fn call(&self, _app: &Application) -> CourierResult<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            ""
        }
    }

    #[tokio::test]
    async fn test_preprocessors_chain_in_order() {
        let app = Application::new("testing");
        let mut registry = CallbackRegistry::new();
        registry.register_preprocessor(Box::new(AddOne)).unwrap();
        registry.register_preprocessor(Box::new(Double)).unwrap();

        for (original, expected) in [(1, 4), (2, 6)] {
            let message = registry.preprocess(&app, json!(original)).await.unwrap();
            assert_eq!(message, json!(expected));
        }
    }

    #[tokio::test]
    async fn test_postprocessors_chain_in_order() {
        let app = Application::new("testing");
        let mut registry = CallbackRegistry::new();
        registry
            .register_postprocessor(Box::new(FnResultPostprocessor::new("wrap", |_app, result| {
                Box::pin(async move { Ok(json!([result])) })
            })))
            .unwrap();
        registry
            .register_postprocessor(Box::new(FnResultPostprocessor::new("label", |_app, result| {
                Box::pin(async move { Ok(json!({"value": result})) })
            })))
            .unwrap();

        let result = registry.postprocess(&app, json!(7)).await.unwrap();
        assert_eq!(result, json!({"value": [7]}));
    }

    #[tokio::test]
    async fn test_abort_stops_chain() {
        let app = Application::new("testing");
        let mut registry = CallbackRegistry::new();
        registry
            .register_preprocessor(Box::new(FnMessagePreprocessor::new("stop", |_app, message| {
                Box::pin(async move { Err(CourierError::abort_with("skip", message)) })
            })))
            .unwrap();
        registry.register_preprocessor(Box::new(Double)).unwrap();

        let err = registry.preprocess(&app, json!(3)).await.unwrap_err();
        assert_eq!(err.as_abort().and_then(|a| a.payload.clone()), Some(json!(3)));
    }

    #[test]
    fn test_registration_order_and_names() {
        let mut registry = CallbackRegistry::new();
        registry.register_preprocessor(Box::new(Double)).unwrap();
        registry.register_preprocessor(Box::new(AddOne)).unwrap();

        let names = registry.names(Stage::MessagePreprocessor);
        assert_eq!(names[0], "double");
        assert!(names[1].ends_with("AddOne"));
        assert_eq!(registry.len(Stage::MessagePreprocessor), 2);
        assert_eq!(registry.len(Stage::Error), 0);
    }

    #[test]
    fn test_prepend_error_runs_first() {
        let mut registry = CallbackRegistry::new();
        registry
            .register_error(Box::new(FnErrorHook::new("second", |_app, _message, _error| {
                Box::pin(async { Ok(()) })
            })))
            .unwrap();
        registry
            .prepend_error(Box::new(FnErrorHook::new("first", |_app, _message, _error| {
                Box::pin(async { Ok(()) })
            })))
            .unwrap();

        assert_eq!(registry.names(Stage::Error), vec!["first", "second"]);
    }

    #[test]
    fn test_unnamed_callback_rejected() {
        let mut registry = CallbackRegistry::new();
        let err = registry.register_startup(Box::new(Unnamed)).unwrap_err();
        assert!(matches!(
            err,
            CourierError::InvalidCallback {
                stage: "startup",
                ..
            }
        ));
        assert_eq!(registry.len(Stage::Startup), 0);
    }

    #[test]
    fn test_frozen_registry_rejects() {
        let mut registry = CallbackRegistry::new();
        registry.freeze();
        assert!(registry.is_frozen());

        let err = registry.register_preprocessor(Box::new(AddOne)).unwrap_err();
        assert!(matches!(err, CourierError::InvalidCallback { .. }));
    }

    #[tokio::test]
    async fn test_lifecycle_collects_failures() {
        let app = Application::new("testing");
        let mut registry = CallbackRegistry::new();
        registry
            .register_teardown(Box::new(FnLifecycleHook::new("ok", |_app| {
                Box::pin(async { Ok(()) })
            })))
            .unwrap();
        registry
            .register_teardown(Box::new(FnLifecycleHook::new("broken", |_app| {
                Box::pin(async { Err(CourierError::failed("teardown", "disk gone")) })
            })))
            .unwrap();

        let failures = registry.run_lifecycle(Stage::Teardown, &app).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");
        assert!(registry.run_lifecycle(Stage::Startup, &app).await.is_empty());
    }
}
