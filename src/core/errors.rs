//! Error types for the archrev-rs library.
//!
//! Every failure in the pipeline is expressed as an [`ArchrevError`] carrying
//! a stable error code and a transient/terminal classification. The job
//! runner and the resilience layer never inspect error messages; they branch
//! on [`ArchrevError::is_transient`] and surface [`ArchrevError::error_code`]
//! to the project record and the bus events.

use std::io;

use thiserror::Error;

/// Main result type for archrev operations.
pub type Result<T> = std::result::Result<T, ArchrevError>;

/// Comprehensive error type for all archrev operations.
#[derive(Error, Debug)]
pub enum ArchrevError {
    /// I/O related errors (file operations, scratch directories, etc.)
    #[error("I/O error: {message}")]
    Io {
        /// Human-readable error message
        message: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        /// Error description
        message: String,
        /// Configuration field that caused the error
        field: Option<String>,
    },

    /// Input validation errors (malformed archive, missing fields, bad status)
    #[error("Validation error [{code}]: {message}")]
    Validation {
        /// Stable error code, e.g. `Project.InvalidZipFile`
        code: String,
        /// Error description
        message: String,
    },

    /// A requested entity does not exist
    #[error("Not found [{code}]: {message}")]
    NotFound {
        /// Stable error code, e.g. `Project.NotFound`
        code: String,
        /// Error description
        message: String,
    },

    /// Illegal project lifecycle transition
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Status the project is currently in
        from: String,
        /// Status the caller attempted to move to
        to: String,
    },

    /// Preflight estimate exceeded the approval threshold without approval
    #[error("Approval required: {message}")]
    ApprovalRequired {
        /// Error description with the offending estimate
        message: String,
    },

    /// Parsing and language processing errors
    #[error("Parse error in {language}: {message}")]
    Parse {
        /// Language being parsed
        language: String,
        /// Error description
        message: String,
        /// File path where the error occurred
        file_path: Option<String>,
    },

    /// Transient failures of external collaborators; safe to retry
    #[error("Transient error [{code}]: {message}")]
    Transient {
        /// Stable error code, e.g. `Embedding.RateLimited`
        code: String,
        /// Error description
        message: String,
        /// Underlying error, when one exists
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transient retries were exhausted at the top level of a job
    #[error("Transient retries exhausted: {message}")]
    TransientExhausted {
        /// Description of the last failure
        message: String,
    },

    /// Vector store indexing verification failed
    #[error("Vector store verification failed: {message}")]
    VectorVerification {
        /// Error description
        message: String,
    },

    /// The watchdog declared a batch stuck
    #[error("Watchdog marked job stuck: {message}")]
    Stuck {
        /// Error description with heartbeat/duration detail
        message: String,
    },

    /// The job's cancellation token fired
    #[error("Operation cancelled: {message}")]
    Cancelled {
        /// What was in flight when the cancel landed
        message: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error description
        message: String,
        /// Underlying serialization error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invariant violations; these abort the job
    #[error("Internal error: {message}")]
    Internal {
        /// Error description
        message: String,
        /// Additional context
        context: Option<String>,
    },
}

impl ArchrevError {
    /// Create a new I/O error with context
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new configuration error with field context
    pub fn config_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new validation error with a stable code
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a new not-found error with a stable code
    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid-transition error
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a new approval-required error
    pub fn approval_required(message: impl Into<String>) -> Self {
        Self::ApprovalRequired {
            message: message.into(),
        }
    }

    /// Create a new parse error
    pub fn parse(language: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            language: language.into(),
            message: message.into(),
            file_path: None,
        }
    }

    /// Create a new parse error with file context
    pub fn parse_in_file(
        language: impl Into<String>,
        message: impl Into<String>,
        file_path: impl Into<String>,
    ) -> Self {
        Self::Parse {
            language: language.into(),
            message: message.into(),
            file_path: Some(file_path.into()),
        }
    }

    /// Create a new transient error with a stable code
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a new vector-verification error
    pub fn vector_verification(message: impl Into<String>) -> Self {
        Self::VectorVerification {
            message: message.into(),
        }
    }

    /// Create a new stuck-job error
    pub fn stuck(message: impl Into<String>) -> Self {
        Self::Stuck {
            message: message.into(),
        }
    }

    /// Create a new cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            context: None,
        }
    }

    /// Add context to an existing error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        if let Self::Internal { context: ctx, .. } = &mut self {
            *ctx = Some(context.into());
        }
        self
    }

    /// Stable error code for project records and bus events.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Io { .. } => "Io",
            Self::Config { .. } => "Config",
            Self::Validation { code, .. }
            | Self::NotFound { code, .. }
            | Self::Transient { code, .. } => code,
            Self::InvalidTransition { .. } => "Project.AlreadyAnalyzing",
            Self::ApprovalRequired { .. } => "Project.ApprovalRequired",
            Self::Parse { .. } => "Chunking.ParseFailed",
            Self::TransientExhausted { .. } => "Job.TransientExhausted",
            Self::VectorVerification { .. } => "VectorStore.Verification",
            Self::Stuck { .. } => "Watchdog.Stuck",
            Self::Cancelled { .. } => "Job.Cancelled",
            Self::Serialization { .. } => "Serialization",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Whether this failure is worth retrying.
    ///
    /// Transient errors surface to the message bus for redelivery; everything
    /// else moves the project to `Failed` immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Classify an HTTP status code from an external collaborator.
    ///
    /// 408/425/429 and 500-504 are transient per the resilience contract.
    pub fn status_is_transient(status: u16) -> bool {
        matches!(status, 408 | 425 | 429 | 500..=504)
    }

    /// Build an error from a failed HTTP response status.
    pub fn from_http_status(service: &str, status: u16, body: impl Into<String>) -> Self {
        let message = format!("{service} returned HTTP {status}: {}", body.into());
        if Self::status_is_transient(status) {
            let code = if status == 429 {
                format!("{service}.RateLimited")
            } else {
                format!("{service}.Unavailable")
            };
            Self::transient(code, message)
        } else {
            Self::validation(format!("{service}.Rejected"), message)
        }
    }
}

// Implement From traits for common error types
impl From<io::Error> for ArchrevError {
    fn from(err: io::Error) -> Self {
        Self::io("I/O operation failed", err)
    }
}

impl From<serde_json::Error> for ArchrevError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: format!("JSON serialization failed: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_yaml::Error> for ArchrevError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: format!("YAML serialization failed: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

impl From<reqwest::Error> for ArchrevError {
    fn from(err: reqwest::Error) -> Self {
        // Socket-level failures and timeouts are transient; the caller maps
        // HTTP statuses itself via `from_http_status`.
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient {
                code: "Http.Transport".to_string(),
                message: format!("HTTP transport failure: {err}"),
                source: Some(Box::new(err)),
            }
        } else {
            Self::Internal {
                message: format!("HTTP client failure: {err}"),
                context: None,
            }
        }
    }
}

/// Result extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add static context to an error result
    fn context(self, msg: &'static str) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<ArchrevError>,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }

    fn context(self, msg: &'static str) -> Result<T> {
        self.map_err(|e| e.into().with_context(msg))
    }
}
