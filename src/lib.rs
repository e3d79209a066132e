//! # Courier
//!
//! An async message-processing runtime: wire a consumer to a processor,
//! surround it with hooks, and let a pool of workers deliver.
//!
//! ## Features
//!
//! - **Ordered Hooks**: Preprocessors and postprocessors chain in registration order
//! - **Guaranteed Acknowledgement**: Every dequeued message is acknowledged with its original value
//! - **Abort Signal**: Stop a unit of work without treating it as a failure
//! - **Backpressure**: The reader never runs more than one message per worker ahead
//! - **Graceful Shutdown**: Queued and in-flight messages finish before teardown
//! - **Retries**: A pluggable extension re-submits failed messages with backoff
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> CourierResult<()> {
//!     let mut app = Application::new("greeter");
//!     app.set_log_handle(courier::logging::init(&LoggingConfig::development()));
//!     app.set_consumer(IterConsumer::new(vec![json!("ada"), json!("grace")]));
//!
//!     app.message_preprocessor_fn("trim", |_app, message| {
//!         Box::pin(async move {
//!             Ok(message.as_str().map(|s| s.trim().into()).unwrap_or(message))
//!         })
//!     })?;
//!
//!     app.set_processor_fn(|_app, message| {
//!         let greeting = format!("hello {message}");
//!         Box::pin(async move { Ok(Some(vec![json!(greeting)])) })
//!     });
//!
//!     app.message_acknowledgement_fn("ack", |app, original| {
//!         Box::pin(async move {
//!             tracing::info!(app = %app.name(), %original, "done");
//!             Ok(())
//!         })
//!     })?;
//!
//!     app.run(2).await
//! }
//! ```

pub mod app;
pub mod config;
pub mod contrib;
pub mod core;
pub mod error;
pub mod logging;
pub mod message;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

pub mod prelude {
    pub use crate::app::{Application, Consumer, Extension, FnProcessor, IterConsumer, Processor};
    pub use crate::config::{EngineConfig, LogLevel, LoggingConfig, Settings};
    pub use crate::contrib::retry::{Retry, RetryCallback};
    pub use crate::core::registry::{
        AcknowledgementHook, ErrorHook, LifecycleHook, MessagePreprocessor, ResultPostprocessor,
        Stage,
    };
    pub use crate::core::{EngineState, ShutdownHandle};
    pub use crate::error::{Abort, CourierError, CourierResult, ErrorClass};
    pub use crate::message::{Message, Outcome, Results};
    pub use async_trait::async_trait;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::CourierMetrics;
}

pub use crate::app::{Application, Consumer, Extension, IterConsumer, Processor};
pub use crate::config::Settings;
pub use crate::core::{Engine, EngineState, ShutdownHandle};
pub use crate::error::{Abort, CourierError, CourierResult, ErrorClass};
pub use crate::message::{Message, Outcome, Results};
pub use async_trait::async_trait;
