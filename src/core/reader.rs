//! The consumer-reader task: the only producer of the work queue.

use crate::app::Consumer;
use crate::core::queue::{CompletionSignal, WorkQueue};
use crate::error::{CourierError, CourierResult};

/// Pulls messages from the consumer into the work queue.
pub struct Reader {
    app: String,
    consumer: Box<dyn Consumer>,
    queue: WorkQueue,
    completion: CompletionSignal,
    stop: CompletionSignal,
}

impl Reader {
    /// Create a reader feeding `queue`.
    ///
    /// Setting `stop` ends the reader before its next read. A message
    /// already read is still queued.
    pub fn new(
        app: impl Into<String>,
        consumer: Box<dyn Consumer>,
        queue: WorkQueue,
        completion: CompletionSignal,
        stop: CompletionSignal,
    ) -> Self {
        Self {
            app: app.into(),
            consumer,
            queue,
            completion,
            stop,
        }
    }

    /// Read until the consumer ends the stream, fails, or is stopped.
    ///
    /// The completion signal is set on every exit path. An abort from the
    /// consumer is the normal end of the stream; any other error is returned.
    pub async fn run(mut self) -> CourierResult<()> {
        tracing::debug!(app = %self.app, "reader started");

        let outcome = loop {
            let read = tokio::select! {
                biased;
                _ = self.stop.wait() => {
                    tracing::debug!(app = %self.app, "reader stopped");
                    break Ok(());
                }
                read = self.consumer.read() => read,
            };

            match read {
                Ok(message) => {
                    if let Err(error) = self.queue.put(message).await {
                        break Err(error);
                    }
                }
                Err(CourierError::Abort(abort)) => {
                    tracing::info!(app = %self.app, reason = %abort.reason, "consumer.aborted");
                    break Ok(());
                }
                Err(error) => {
                    tracing::error!(app = %self.app, error = %error, "consumer failed");
                    break Err(error);
                }
            }
        };

        self.completion.set();
        outcome
    }
}
