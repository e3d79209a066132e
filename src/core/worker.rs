//! Processing tasks for Courier.
//!
//! Every worker runs the same loop against the shared [`WorkQueue`]: take a
//! message, run it through preprocessors, the processor and postprocessors,
//! route failures through the error hooks, and always acknowledge the
//! original message before taking the next one.

use crate::app::{Application, Processor};
use crate::config::EngineConfig;
use crate::core::queue::{CompletionSignal, Next, WorkQueue};
use crate::core::registry::Stage;
use crate::error::{CourierError, CourierResult};
use crate::message::{Message, Results};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::AbortHandle;
use tracing::Instrument;
use uuid::Uuid;

/// Something that happened to a message in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A worker dequeued a message
    Received,
    /// Preprocessing or the processor failed
    Failed,
    /// Preprocessing or the processor aborted
    Aborted,
    /// Acknowledgement hooks ran for a message
    Acknowledged,
    /// A result made it through every postprocessor
    Postprocessed,
}

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages taken from the work queue
    pub messages_received: u64,
    /// Messages whose processing failed
    pub messages_failed: u64,
    /// Messages whose processing was aborted
    pub messages_aborted: u64,
    /// Messages acknowledged
    pub messages_acknowledged: u64,
    /// Results that completed postprocessing
    pub results_postprocessed: u64,
}

/// Counters shared by every worker of an engine.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    received: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    acknowledged: AtomicU64,
    postprocessed: AtomicU64,
}

impl WorkerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: PipelineEvent) {
        let counter = match event {
            PipelineEvent::Received => &self.received,
            PipelineEvent::Failed => &self.failed,
            PipelineEvent::Aborted => &self.aborted,
            PipelineEvent::Acknowledged => &self.acknowledged,
            PipelineEvent::Postprocessed => &self.postprocessed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values of every counter.
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            messages_received: self.received.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            messages_aborted: self.aborted.load(Ordering::Relaxed),
            messages_acknowledged: self.acknowledged.load(Ordering::Relaxed),
            results_postprocessed: self.postprocessed.load(Ordering::Relaxed),
        }
    }
}

/// Everything a worker shares with its siblings.
#[derive(Clone)]
pub struct WorkerContext {
    /// The running application
    pub app: Arc<Application>,
    /// The primary callback
    pub processor: Arc<dyn Processor>,
    /// Source of messages
    pub queue: WorkQueue,
    /// Set once no more messages will be queued
    pub completion: CompletionSignal,
    /// Set by the first worker that hits a fatal error
    pub halt: CompletionSignal,
    /// Resolved engine configuration
    pub config: Arc<EngineConfig>,
    /// Shared counters
    pub stats: Arc<WorkerCounters>,
}

/// A single processing task.
pub struct Worker {
    id: usize,
    ctx: WorkerContext,
}

impl Worker {
    /// Create a new worker with the given ID
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        Self { id, ctx }
    }

    /// Worker identifier.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Run until the queue is drained and the stream is finished.
    ///
    /// A fatal error raises the halt signal but does not stop the loop:
    /// queued messages are still processed and acknowledged, and the first
    /// fatal error is returned once the queue is drained.
    pub async fn run(self) -> CourierResult<()> {
        let span = tracing::info_span!("worker", app = %self.ctx.app.name(), worker_id = self.id);
        self.work().instrument(span).await
    }

    async fn work(&self) -> CourierResult<()> {
        tracing::debug!("worker started");
        let mut fatal = None;

        loop {
            match self
                .ctx
                .queue
                .next(&self.ctx.completion, self.ctx.config.poll_interval)
                .await
            {
                Next::Message(message) => {
                    if let Err(error) = self.handle(message).await {
                        if fatal.is_none() {
                            tracing::error!(error = %error, "fatal error, draining");
                            self.ctx.halt.set();
                            fatal = Some(error);
                        } else {
                            tracing::warn!(error = %error, "additional fatal error");
                        }
                    }
                }
                Next::Idle => tracing::trace!("work queue empty"),
                Next::Done => break,
            }
        }

        tracing::debug!("worker finished");
        fatal.map_or(Ok(()), Err)
    }

    /// Process one message and acknowledge it whatever the outcome.
    async fn handle(&self, message: Message) -> CourierResult<()> {
        let message_id = Uuid::new_v4();
        let span = tracing::debug_span!("message", %message_id);

        async {
            self.record(PipelineEvent::Received);
            let original = message.clone();

            let outcome = match AssertUnwindSafe(self.pipeline(message))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(CourierError::WorkerPanicked {
                    worker_id: self.id,
                    message: panic_message(panic.as_ref()),
                }),
            };

            let acknowledged = self.acknowledge(&original).await;
            outcome.and(acknowledged)
        }
        .instrument(span)
        .await
    }

    async fn pipeline(&self, message: Message) -> CourierResult<()> {
        let app = self.ctx.app.as_ref();
        let callbacks = app.callbacks();

        let preprocessed = callbacks.preprocess(app, message.clone()).await;
        let message = match preprocessed {
            Ok(preprocessed) => preprocessed,
            Err(error) => return self.interrupted(&message, error).await,
        };
        if callbacks.len(Stage::MessagePreprocessor) > 0 {
            tracing::debug!(app = %app.name(), message = %message, "message.preprocessed");
        }

        let processed = self.ctx.processor.process(app, &message).await;
        match processed {
            Ok(results) => self.postprocess(&message, results).await,
            Err(error) => self.interrupted(&message, error).await,
        }
    }

    /// Contain an abort, or hand a failure to the error hooks.
    async fn interrupted(&self, message: &Message, error: CourierError) -> CourierResult<()> {
        match error {
            CourierError::Abort(abort) => {
                tracing::info!(
                    app = %self.ctx.app.name(),
                    reason = %abort.reason,
                    "callback.aborted"
                );
                self.record(PipelineEvent::Aborted);
                Ok(())
            }
            error => self.fail(message, error).await,
        }
    }

    /// Log a processing failure and hand it to the error hooks.
    async fn fail(&self, message: &Message, error: CourierError) -> CourierResult<()> {
        let app = self.ctx.app.as_ref();
        let class = error.class();

        tracing::error!(
            app = %app.name(),
            class = %class,
            error = %error,
            details = ?error,
            "message.failed"
        );
        self.record(PipelineEvent::Failed);

        for hook in app.callbacks().error_hooks() {
            match hook.on_error(app, message, &error).await {
                Ok(()) => {}
                Err(CourierError::Abort(abort)) => {
                    tracing::info!(
                        app = %app.name(),
                        callback = hook.name(),
                        reason = %abort.reason,
                        "callback.aborted"
                    );
                    return Ok(());
                }
                Err(hook_error) => {
                    tracing::error!(
                        app = %app.name(),
                        callback = hook.name(),
                        error = %hook_error,
                        "error callback failed"
                    );
                    return Err(hook_error);
                }
            }
        }

        if self.ctx.config.is_fatal(&class) {
            return Err(error);
        }
        Ok(())
    }

    /// Run the postprocessor chain over each result independently.
    async fn postprocess(&self, message: &Message, results: Results) -> CourierResult<()> {
        let Some(results) = results else {
            return Ok(());
        };

        let app = self.ctx.app.as_ref();
        let callbacks = app.callbacks();
        let has_postprocessors = callbacks.len(Stage::ResultPostprocessor) > 0;

        for result in results {
            match callbacks.postprocess(app, result).await {
                Ok(result) => {
                    if has_postprocessors {
                        tracing::info!(app = %app.name(), result = %result, "result.postprocessed");
                    }
                    self.record(PipelineEvent::Postprocessed);
                }
                Err(CourierError::Abort(abort)) => {
                    tracing::info!(
                        app = %app.name(),
                        reason = %abort.reason,
                        "callback.aborted"
                    );
                }
                Err(error) if self.ctx.config.postprocess_failures_fatal => {
                    tracing::error!(app = %app.name(), error = %error, "result postprocessing failed");
                    return Err(error);
                }
                Err(error) => self.fail(message, error).await?,
            }
        }

        Ok(())
    }

    /// Run every acknowledgement hook with the original message.
    ///
    /// All hooks run even if one fails; the first failure is returned.
    async fn acknowledge(&self, original: &Message) -> CourierResult<()> {
        let app = self.ctx.app.as_ref();
        let hooks = app.callbacks().acknowledgement_hooks();
        let mut failure = None;

        for hook in hooks {
            match hook.acknowledge(app, original).await {
                Ok(()) => {}
                Err(CourierError::Abort(abort)) => {
                    tracing::debug!(
                        app = %app.name(),
                        callback = hook.name(),
                        reason = %abort.reason,
                        "callback.aborted"
                    );
                }
                Err(error) => {
                    tracing::error!(
                        app = %app.name(),
                        callback = hook.name(),
                        error = %error,
                        "acknowledgement failed"
                    );
                    failure.get_or_insert(error);
                }
            }
        }

        if !hooks.is_empty() {
            tracing::info!(app = %app.name(), message = %original, "message.acknowledged");
        }
        self.record(PipelineEvent::Acknowledged);

        failure.map_or(Ok(()), Err)
    }

    fn record(&self, event: PipelineEvent) {
        self.ctx.stats.record(event);

        #[cfg(feature = "metrics")]
        if let Some(metrics) = self.ctx.app.metrics() {
            metrics.record(event);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// How a worker task ended.
#[derive(Debug)]
pub struct WorkerExit {
    /// Worker identifier
    pub worker_id: usize,
    /// `Err` if the worker hit a fatal error or was stopped
    pub outcome: CourierResult<()>,
}

/// Manages the worker pool
#[derive(Default)]
pub struct WorkerManager {
    workers: FuturesUnordered<BoxFuture<'static, WorkerExit>>,
    handles: Vec<AbortHandle>,
}

impl WorkerManager {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker onto the runtime.
    pub fn spawn(&mut self, worker: Worker) {
        let worker_id = worker.id();
        let handle = tokio::spawn(worker.run());
        self.handles.push(handle.abort_handle());

        self.workers.push(
            async move {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(join_error) if join_error.is_cancelled() => Err(CourierError::Interrupted),
                    Err(join_error) => Err(CourierError::WorkerPanicked {
                        worker_id,
                        message: join_error.to_string(),
                    }),
                };
                WorkerExit { worker_id, outcome }
            }
            .boxed(),
        );

        tracing::debug!(worker_id, "spawned worker");
    }

    /// Number of workers that have not exited yet.
    pub fn active_worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for the next worker to exit. `None` once every worker has exited.
    pub async fn next_exit(&mut self) -> Option<WorkerExit> {
        self.workers.next().await
    }

    /// Stop every worker without waiting for in-flight messages.
    pub fn abort_all(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
