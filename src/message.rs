//! Message and result values flowing through the pipeline.

use crate::error::{CourierError, CourierResult};
use serde::{Deserialize, Serialize};

/// An opaque message produced by a consumer.
///
/// Each message makes exactly one pass through preprocess, callback,
/// postprocess and acknowledge, owned by a single worker.
pub type Message = serde_json::Value;

/// A single value returned by the primary callback.
pub type Outcome = serde_json::Value;

/// What the primary callback returns: zero or more results, or nothing.
pub type Results = Option<Vec<Outcome>>;

/// Reserved message key holding the [`RetryEnvelope`].
pub const RETRY_KEY: &str = "_retry";

/// Retry bookkeeping carried inside a message under [`RETRY_KEY`].
///
/// `count` only grows and `start_time` is written once, on the first
/// retryable failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEnvelope {
    /// Retry attempts made so far
    pub count: u32,
    /// Epoch seconds of the first failure
    pub start_time: i64,
    /// Backoff applied before the most recent retry, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
}

impl RetryEnvelope {
    /// A fresh envelope for a message failing for the first time.
    pub fn first_failure() -> Self {
        Self {
            count: 0,
            start_time: chrono::Utc::now().timestamp(),
            delay: None,
        }
    }

    /// Read the envelope from a message, creating one if absent.
    ///
    /// Returns `None` when the message is not a JSON object and so cannot
    /// carry an envelope.
    pub fn read(message: &Message) -> CourierResult<Option<Self>> {
        let Some(fields) = message.as_object() else {
            return Ok(None);
        };

        match fields.get(RETRY_KEY) {
            Some(raw) => Ok(Some(serde_json::from_value(raw.clone())?)),
            None => Ok(Some(Self::first_failure())),
        }
    }

    /// Store the envelope into the message, replacing any previous one.
    pub fn write(&self, message: &mut Message) -> CourierResult<()> {
        let fields = message.as_object_mut().ok_or_else(|| {
            CourierError::config("retry information can only be attached to object messages")
        })?;
        fields.insert(RETRY_KEY.to_string(), serde_json::to_value(self)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_created_lazily() {
        let message = json!({"body": "hello"});
        let envelope = RetryEnvelope::read(&message).unwrap().unwrap();
        assert_eq!(envelope.count, 0);
        assert!(envelope.start_time > 0);
        assert!(envelope.delay.is_none());
    }

    #[test]
    fn test_envelope_survives_rewrite() {
        let mut message = json!({"body": "hello", "_retry": {"count": 2, "start_time": 100}});
        let mut envelope = RetryEnvelope::read(&message).unwrap().unwrap();
        assert_eq!(envelope.count, 2);
        assert_eq!(envelope.start_time, 100);

        envelope.count += 1;
        envelope.delay = Some(1.5);
        envelope.write(&mut message).unwrap();

        assert_eq!(message["_retry"]["count"], 3);
        assert_eq!(message["_retry"]["start_time"], 100);
        assert_eq!(message["_retry"]["delay"], 1.5);
        assert_eq!(message["body"], "hello");
    }

    #[test]
    fn test_scalar_messages_have_no_envelope() {
        assert!(RetryEnvelope::read(&json!(42)).unwrap().is_none());
        assert!(RetryEnvelope::first_failure().write(&mut json!("text")).is_err());
    }
}
