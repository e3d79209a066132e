//! The Courier engine - orchestrates the reader, the workers, and the
//! lifecycle hooks.
//!
//! The engine is responsible for coordinating all the moving parts of a
//! running application:
//! - Startup and teardown hooks
//! - The consumer-reader task
//! - Worker pool management
//! - Fatal error capture and graceful draining

use crate::app::Application;
use crate::config::{EngineConfig, LogLevel};
use crate::core::queue::{CompletionSignal, WorkQueue};
use crate::core::reader::Reader;
use crate::core::registry::Stage;
use crate::core::worker::{Worker, WorkerContext, WorkerCounters, WorkerManager};
use crate::error::{CourierError, CourierResult};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, not yet started
    Created,
    /// Running startup hooks
    Starting,
    /// Reader and workers are running
    Running,
    /// No new messages are read; queued and in-flight work finishes
    Draining,
    /// Teardown hooks have run
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            EngineState::Created => "created",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Draining => "draining",
            EngineState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// Interrupts a running application, the same way ctrl-c does.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    signal: CompletionSignal,
}

impl ShutdownHandle {
    /// Create a handle that has not been triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Triggering more than once is harmless.
    pub fn trigger(&self) {
        tracing::info!("shutdown requested");
        self.signal.set();
    }

    /// Returns true once shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.signal.is_set()
    }

    pub(crate) async fn wait(&self) {
        self.signal.wait().await;
    }
}

/// Runs an [`Application`] from start to stop.
pub struct Engine {
    app: Application,
    num_workers: usize,
    state: watch::Sender<EngineState>,
    stats: Arc<WorkerCounters>,
}

impl Engine {
    /// Create an engine running `num_workers` processing tasks.
    pub fn new(app: Application, num_workers: usize) -> Self {
        let (state, _) = watch::channel(EngineState::Created);
        Self {
            app,
            num_workers,
            state,
            stats: Arc::new(WorkerCounters::new()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Follow state transitions while the engine runs.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Counters updated by the workers, readable during and after the run.
    pub fn stats_handle(&self) -> Arc<WorkerCounters> {
        Arc::clone(&self.stats)
    }

    /// Run the application to completion.
    ///
    /// Returns the first fatal error: a consumer failure, a fatal worker
    /// error, a startup hook failure, or an interrupt.
    pub async fn run(self) -> CourierResult<()> {
        let Self {
            mut app,
            num_workers,
            state,
            stats,
        } = self;
        let states = StateTracker {
            app: app.name().to_string(),
            state,
        };

        let consumer = app
            .take_consumer()
            .ok_or_else(|| CourierError::config("The consumer cannot be None"))?;
        let processor = app
            .processor()
            .cloned()
            .ok_or_else(|| CourierError::config("The processor cannot be None"))?;
        let config = Arc::new(
            EngineConfig::from_settings(app.settings(), num_workers)?
                .with_signal_handling(app.signals_enabled()),
        );
        let debug = app.settings().debug()?;

        states.enter(EngineState::Starting);
        app.callbacks_mut().freeze();
        let shutdown = app.shutdown_handle();
        let app = Arc::new(app);

        tracing::info!(app = %app.name(), workers = num_workers, "application.started");

        if debug {
            if let Some(handle) = app.log_handle() {
                handle.set_level(LogLevel::Debug)?;
            }
        }

        let mut failures = app
            .callbacks()
            .run_lifecycle(Stage::Startup, &app)
            .await
            .into_iter();
        if let Some((callback, error)) = failures.next() {
            tracing::error!(app = %app.name(), callback = %callback, error = %error, "startup hook failed");
            for (callback, other) in failures {
                tracing::error!(app = %app.name(), callback = %callback, error = %other, "startup hook failed");
            }

            states.enter(EngineState::Draining);
            teardown(&app).await;
            states.enter(EngineState::Stopped);

            tracing::error!(app = %app.name(), error = %error, "application.failed");
            return Err(error);
        }

        let queue = WorkQueue::new(num_workers);
        let completion = CompletionSignal::new();
        let stop = CompletionSignal::new();
        let halt = CompletionSignal::new();

        let mut reader = tokio::spawn(
            Reader::new(
                app.name(),
                consumer,
                queue.clone(),
                completion.clone(),
                stop.clone(),
            )
            .run(),
        );

        let ctx = WorkerContext {
            app: Arc::clone(&app),
            processor,
            queue,
            completion: completion.clone(),
            halt: halt.clone(),
            config: Arc::clone(&config),
            stats: Arc::clone(&stats),
        };
        let mut workers = WorkerManager::new();
        for worker_id in 0..num_workers {
            workers.spawn(Worker::new(worker_id, ctx.clone()));
        }
        drop(ctx);

        states.enter(EngineState::Running);

        let mut fatal = FatalError::new(app.name());
        let mut reader_active = true;
        let mut halted = false;
        let mut forced = false;
        let mut handle_signals = config.handle_signals;

        loop {
            tokio::select! {
                joined = &mut reader, if reader_active => {
                    reader_active = false;
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => fatal.capture(error),
                        Err(join_error) if join_error.is_cancelled() => {}
                        Err(join_error) => fatal.capture(CourierError::Consumer {
                            message: format!("reader task failed: {join_error}"),
                            source: None,
                        }),
                    }
                    completion.set();
                    states.enter(EngineState::Draining);
                }
                exit = workers.next_exit() => {
                    let Some(exit) = exit else {
                        break;
                    };
                    if let Err(error) = exit.outcome {
                        tracing::error!(app = %app.name(), worker_id = exit.worker_id, error = %error, "worker stopped");
                        fatal.capture(error);
                        drain(&stop, &states);
                    }
                }
                _ = halt.wait(), if !halted => {
                    halted = true;
                    tracing::warn!(
                        app = %app.name(),
                        active_workers = workers.active_worker_count(),
                        "fatal error, draining queued messages"
                    );
                    drain(&stop, &states);
                }
                _ = shutdown.wait(), if states.current() != EngineState::Draining => {
                    tracing::warn!(app = %app.name(), "application interrupted");
                    fatal.capture(CourierError::Interrupted);
                    drain(&stop, &states);
                }
                signal = tokio::signal::ctrl_c(), if handle_signals && !forced => {
                    match signal {
                        Ok(()) if states.current() == EngineState::Draining => {
                            tracing::warn!(
                                app = %app.name(),
                                active_workers = workers.active_worker_count(),
                                "received ctrl-c while draining, stopping workers"
                            );
                            forced = true;
                            fatal.capture(CourierError::Interrupted);
                            reader.abort();
                            workers.abort_all();
                        }
                        Ok(()) => {
                            tracing::warn!(app = %app.name(), "received ctrl-c");
                            fatal.capture(CourierError::Interrupted);
                            drain(&stop, &states);
                        }
                        Err(error) => {
                            tracing::warn!(app = %app.name(), error = %error, "cannot listen for ctrl-c");
                            handle_signals = false;
                        }
                    }
                }
            }
        }

        if reader_active {
            tracing::warn!(app = %app.name(), "every worker exited before the reader, stopping it");
            reader.abort();
            if let Ok(Err(error)) = reader.await {
                fatal.capture(error);
            }
        }
        states.enter(EngineState::Draining);

        teardown(&app).await;
        states.enter(EngineState::Stopped);

        let totals = stats.snapshot();
        let fatal = fatal.into_inner();
        if let Some(error) = &fatal {
            tracing::error!(app = %app.name(), error = %error, details = ?error, "application.failed");
        }
        tracing::info!(
            app = %app.name(),
            received = totals.messages_received,
            failed = totals.messages_failed,
            aborted = totals.messages_aborted,
            acknowledged = totals.messages_acknowledged,
            "application.stopped"
        );

        fatal.map_or(Ok(()), Err)
    }
}

/// Stop reading new messages and let the workers drain the queue.
fn drain(stop: &CompletionSignal, states: &StateTracker) {
    stop.set();
    states.enter(EngineState::Draining);
}

async fn teardown(app: &Application) {
    for (callback, error) in app.callbacks().run_lifecycle(Stage::Teardown, app).await {
        tracing::error!(app = %app.name(), callback = %callback, error = %error, "teardown hook failed");
    }
}

struct StateTracker {
    app: String,
    state: watch::Sender<EngineState>,
}

impl StateTracker {
    fn current(&self) -> EngineState {
        *self.state.borrow()
    }

    fn enter(&self, next: EngineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(app = %self.app, from = %previous, to = %next, "engine state changed");
        }
    }
}

/// Keeps the first fatal error; later ones are only logged.
struct FatalError {
    app: String,
    error: Option<CourierError>,
}

impl FatalError {
    fn new(app: &str) -> Self {
        Self {
            app: app.to_string(),
            error: None,
        }
    }

    fn capture(&mut self, error: CourierError) {
        if self.error.is_none() {
            self.error = Some(error);
        } else {
            tracing::warn!(app = %self.app, error = %error, "additional fatal error");
        }
    }

    fn into_inner(self) -> Option<CourierError> {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::IterConsumer;
    use serde_json::json;

    fn echo_app() -> Application {
        let mut app = Application::new("testing");
        app.handle_signals(false);
        app.set_consumer(IterConsumer::new(vec![json!(1), json!(2), json!(3)]));
        app.set_processor_fn(|_app, message| {
            let message = message.clone();
            Box::pin(async move { Ok(Some(vec![message])) })
        });
        app
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let engine = Engine::new(echo_app(), 2);
        assert_eq!(engine.state(), EngineState::Created);

        let mut states = engine.state_receiver();
        let stats = engine.stats_handle();
        engine.run().await.unwrap();

        assert_eq!(*states.borrow_and_update(), EngineState::Stopped);
        let totals = stats.snapshot();
        assert_eq!(totals.messages_received, 3);
        assert_eq!(totals.messages_acknowledged, 3);
        assert_eq!(totals.results_postprocessed, 3);
    }

    #[tokio::test]
    async fn test_missing_consumer() {
        let mut app = Application::new("testing");
        app.set_processor_fn(|_app, _message| Box::pin(async { Ok(None) }));

        let err = Engine::new(app, 1).run().await.unwrap_err();
        assert!(matches!(err, CourierError::Config { .. }));
        assert!(err.to_string().contains("consumer"));
    }

    #[tokio::test]
    async fn test_invalid_worker_count() {
        let err = Engine::new(echo_app(), 0).run().await.unwrap_err();
        assert!(matches!(err, CourierError::Config { .. }));
    }

    #[tokio::test]
    async fn test_startup_failure_runs_teardown() {
        let mut app = echo_app();
        let stopped = ShutdownHandle::new();
        let marker = stopped.clone();
        app.startup_fn("broken", |_app| {
            Box::pin(async { Err(CourierError::failed("startup", "no database")) })
        })
        .unwrap();
        app.teardown_fn("mark", move |_app| {
            marker.trigger();
            Box::pin(async { Ok(()) })
        })
        .unwrap();

        let engine = Engine::new(app, 1);
        let stats = engine.stats_handle();
        let err = engine.run().await.unwrap_err();

        assert_eq!(err.class().as_str(), "startup");
        assert!(stopped.is_triggered());
        assert_eq!(stats.snapshot().messages_received, 0);
    }

    #[tokio::test]
    async fn test_shutdown_handle_interrupts() {
        let app = echo_app();
        let handle = app.shutdown_handle();
        handle.trigger();

        let err = Engine::new(app, 1).run().await.unwrap_err();
        assert!(matches!(err, CourierError::Interrupted));
    }
}
