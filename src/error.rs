//! Error types for Courier operations.
//!
//! Two kinds of values travel through the `Err` side of a [`CourierResult`]:
//! real failures, and [`Abort`], a control-flow signal meaning "stop this unit
//! of work". Every catch site in the engine checks [`CourierError::is_abort`]
//! before treating an error as a failure.

use crate::message::Message;
use std::fmt;
use thiserror::Error;

/// Result type used throughout Courier.
pub type CourierResult<T> = Result<T, CourierError>;

/// Boxed source error carried by failures raised from user code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stop processing the current unit of work without treating it as a failure.
///
/// Where it is raised decides what it stops: the current message's
/// preprocessing/callback chain, the current result's postprocessing chain,
/// the current error-callback chain, or (from a consumer) the whole stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Abort {
    /// Human-readable reason, logged with the `callback.aborted` event
    pub reason: String,
    /// The message (or result) that triggered the abort, if any
    pub payload: Option<Message>,
}

impl Abort {
    /// Create an abort with a reason and no payload.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            payload: None,
        }
    }

    /// Create an abort carrying the message that triggered it.
    pub fn with_payload(reason: impl Into<String>, payload: Message) -> Self {
        Self {
            reason: reason.into(),
            payload: Some(payload),
        }
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Hierarchical classification of an error, written as a dotted path.
///
/// `retryable.timeout` *is-a* `retryable`, so settings keyed by a class apply
/// to every class nested below it. This is what retry settings and fatal
/// error policies match against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorClass(String);

impl ErrorClass {
    /// Class of failures the retry extension retries by default.
    pub const RETRYABLE: &'static str = "retryable";

    /// Create a class from its dotted path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The dotted path of this class.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of path segments; deeper classes are more specific.
    pub fn depth(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.split('.').count()
        }
    }

    /// Returns true if `self` is `ancestor` or nested below it.
    pub fn is_a(&self, ancestor: &ErrorClass) -> bool {
        if ancestor.0.is_empty() {
            return true;
        }
        match self.0.strip_prefix(ancestor.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ErrorClass {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for ErrorClass {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// Main error type for Courier operations.
#[derive(Error, Debug)]
pub enum CourierError {
    /// Not an error: stop the current unit of work
    #[error("aborted: {0}")]
    Abort(Abort),

    /// Configuration error, raised before any task is spawned
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// A callback was rejected at registration time
    #[error("Invalid {stage} callback: {message}")]
    InvalidCallback {
        /// Lifecycle stage the callback was registered for
        stage: &'static str,
        /// Why it was rejected
        message: String,
    },

    /// An extension was installed without its required settings
    #[error("{extension} requires the following missing settings: {}", .keys.join(", "))]
    MissingSettings {
        /// Extension name
        extension: String,
        /// Every missing key
        keys: Vec<String>,
    },

    /// Processing failed inside user code
    #[error("{class}: {message}")]
    Failed {
        /// Classification used by retry and fatal policies
        class: ErrorClass,
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// The consumer failed to read a message
    #[error("Consumer error: {message}")]
    Consumer {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// The application was interrupted from outside
    #[error("Application interrupted")]
    Interrupted,

    /// A worker task panicked or was cancelled
    #[error("Worker {worker_id} panicked: {message}")]
    WorkerPanicked {
        /// Worker identifier
        worker_id: usize,
        /// Panic or cancellation description
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CourierError {
    /// Create an abort signal.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort(Abort::new(reason))
    }

    /// Create an abort signal carrying the triggering message.
    pub fn abort_with(reason: impl Into<String>, payload: Message) -> Self {
        Self::Abort(Abort::with_payload(reason, payload))
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a registration error for the given stage
    pub fn invalid_callback(stage: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidCallback {
            stage,
            message: message.into(),
        }
    }

    /// Create a processing failure of the given class
    pub fn failed(class: impl Into<ErrorClass>, message: impl Into<String>) -> Self {
        Self::Failed {
            class: class.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a processing failure of the given class wrapping another error
    pub fn failed_with<E>(class: impl Into<ErrorClass>, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed {
            class: class.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a failure the retry extension retries by default
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::failed(ErrorClass::RETRYABLE, message)
    }

    /// Create a consumer error
    pub fn consumer<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Consumer {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if this is the abort signal rather than a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_))
    }

    /// The abort signal, if this is one.
    pub fn as_abort(&self) -> Option<&Abort> {
        match self {
            Self::Abort(abort) => Some(abort),
            _ => None,
        }
    }

    /// Classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Abort(_) => ErrorClass::new("abort"),
            Self::Config { .. } | Self::InvalidCallback { .. } | Self::MissingSettings { .. } => {
                ErrorClass::new("config")
            }
            Self::Failed { class, .. } => class.clone(),
            Self::Consumer { .. } => ErrorClass::new("consumer"),
            Self::Interrupted => ErrorClass::new("interrupted"),
            Self::WorkerPanicked { .. } => ErrorClass::new("panic"),
            Self::Serialization(_) => ErrorClass::new("serialization"),
        }
    }
}

impl From<Abort> for CourierError {
    fn from(abort: Abort) -> Self {
        Self::Abort(abort)
    }
}
