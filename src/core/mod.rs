//! The message-processing runtime.
//!
//! A single [`Reader`] pulls messages from the application's consumer into a
//! bounded [`WorkQueue`]; a pool of [`Worker`]s takes them from there and
//! runs the hook pipeline; the [`Engine`] ties both to the application's
//! startup and teardown hooks.

pub mod engine;
pub mod queue;
pub mod reader;
pub mod registry;
pub mod worker;

pub use engine::{Engine, EngineState, ShutdownHandle};
pub use queue::{CompletionSignal, WorkQueue};
pub use reader::Reader;
pub use registry::{CallbackRegistry, Stage};
pub use worker::{PipelineEvent, Worker, WorkerCounters, WorkerManager, WorkerStats};
