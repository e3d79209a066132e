//! Bounded hand-off between the reader and the workers.
//!
//! The queue holds at most one message per worker, so the reader can never
//! run far ahead of the processing tasks. Workers learn that no more messages
//! are coming from the [`CompletionSignal`], which they only consult once the
//! queue is observed empty.

use crate::error::{CourierError, CourierResult};
use crate::message::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::sleep;

/// Monotonic "no further messages will be produced" flag.
///
/// Written by the reader (or the orchestrator when it cancels the reader),
/// read by every worker.
#[derive(Clone, Debug)]
pub struct CompletionSignal {
    state: Arc<watch::Sender<bool>>,
}

impl CompletionSignal {
    /// Create an unset signal.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Mark the stream as finished. Setting twice is harmless.
    pub fn set(&self) {
        self.state.send_replace(true);
    }

    /// Returns true once the signal has been set.
    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the signal is set.
    pub async fn wait(&self) {
        let mut state = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = state.wait_for(|done| *done).await;
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// What a worker gets when it asks the queue for work.
#[derive(Debug)]
pub enum Next {
    /// A message to process
    Message(Message),
    /// Nothing yet; ask again
    Idle,
    /// The queue is drained and the stream is finished
    Done,
}

/// Fixed-capacity FIFO shared by one reader and many workers.
#[derive(Clone, Debug)]
pub struct WorkQueue {
    sender: mpsc::Sender<Message>,
    receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl WorkQueue {
    /// Create a queue holding at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Returns true if no message is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a message, waiting while the queue is full.
    pub async fn put(&self, message: Message) -> CourierResult<()> {
        self.sender.send(message).await.map_err(|_| CourierError::Consumer {
            message: "work queue closed".to_string(),
            source: None,
        })
    }

    /// Take the next message.
    ///
    /// The completion signal is only consulted when the queue is empty, so
    /// messages queued before the stream finished are always handed out.
    /// While waiting, the worker wakes up for a new message, for the
    /// completion signal, or after `poll_interval`, whichever comes first.
    pub async fn next(&self, completion: &CompletionSignal, poll_interval: Duration) -> Next {
        let mut receiver = self.receiver.lock().await;

        match receiver.try_recv() {
            Ok(message) => return Next::Message(message),
            Err(TryRecvError::Disconnected) => return Next::Done,
            Err(TryRecvError::Empty) => {}
        }

        if completion.is_set() {
            return Next::Done;
        }

        tokio::select! {
            received = receiver.recv() => match received {
                Some(message) => Next::Message(message),
                None => Next::Done,
            },
            _ = completion.wait() => Next::Idle,
            _ = sleep(poll_interval) => Next::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_waits_while_full() {
        let queue = WorkQueue::new(1);
        queue.put(json!(1)).await.unwrap();
        assert_eq!(queue.len(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(20), queue.put(json!(2))).await;
        assert!(blocked.is_err());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_has_a_floor() {
        assert_eq!(WorkQueue::new(0).capacity(), 1);
        assert_eq!(WorkQueue::new(4).capacity(), 4);
        assert!(WorkQueue::new(4).is_empty());
    }

    #[tokio::test]
    async fn test_queued_messages_outlive_completion() {
        let queue = WorkQueue::new(2);
        let completion = CompletionSignal::new();
        queue.put(json!("a")).await.unwrap();
        queue.put(json!("b")).await.unwrap();
        completion.set();

        let interval = Duration::from_millis(5);
        assert!(matches!(queue.next(&completion, interval).await, Next::Message(m) if m == json!("a")));
        assert!(matches!(queue.next(&completion, interval).await, Next::Message(m) if m == json!("b")));
        assert!(matches!(queue.next(&completion, interval).await, Next::Done));
    }

    #[tokio::test]
    async fn test_idle_until_completion() {
        let queue = WorkQueue::new(1);
        let completion = CompletionSignal::new();

        let next = queue.next(&completion, Duration::from_millis(5)).await;
        assert!(matches!(next, Next::Idle));

        let waker = completion.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waker.set();
        });

        let next = queue.next(&completion, Duration::from_secs(60)).await;
        assert!(matches!(next, Next::Idle));
        assert!(matches!(queue.next(&completion, Duration::from_secs(60)).await, Next::Done));
    }

    #[tokio::test]
    async fn test_completion_is_monotonic() {
        let completion = CompletionSignal::new();
        assert!(!completion.is_set());
        completion.set();
        completion.set();
        assert!(completion.is_set());
        completion.wait().await;
    }
}
