//! Error types for the envsync engine.
//!
//! This module provides a comprehensive error hierarchy for all operations
//! in the synchronization lifecycle: configuration, remote channels,
//! planning, function bundles, and run artifacts. Remote failures carry a
//! classification ([`ErrorClass`]) that drives endpoint fallback and retry
//! decisions.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the envsync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Remote channel errors.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Function bundle errors.
    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    /// Run artifact errors.
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of a failure, used for endpoint fallback and retry
/// decisions.
///
/// The classification is assigned by adapter functions at the channel
/// boundary (HTTP status mapping, subprocess stderr matching) so that the
/// engine itself never inspects raw error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// The endpoint could not be reached; the next endpoint may work.
    Unreachable,
    /// Credentials were rejected; no endpoint of this environment can help.
    Unauthorized,
    /// The remote side is throttling; retry with backoff.
    RateLimited,
    /// The resource legitimately does not exist.
    NotFound,
    /// A function is missing shared files it imports.
    DependencyUnsatisfied,
    /// A function bundle needs a capability the target cannot provide.
    Incompatible,
    /// Operation-specific fatal failure; neither retry nor fallback helps.
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unreachable => "unreachable",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate-limited",
            Self::NotFound => "not-found",
            Self::DependencyUnsatisfied => "dependency-unsatisfied",
            Self::Incompatible => "incompatible",
            Self::Fatal => "fatal",
        };
        write!(f, "{label}")
    }
}

/// One failed attempt against one endpoint, recorded by the fallback loop.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EndpointAttempt {
    /// Endpoint description (label plus host:port).
    pub endpoint: String,
    /// Failure classification for this attempt.
    pub class: ErrorClass,
    /// Human-readable failure message.
    pub message: String,
}

impl std::fmt::Display for EndpointAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.endpoint, self.class, self.message)
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate {resource_type} name: {name}")]
    DuplicateName {
        /// Type of resource (environment, shared dir, etc.).
        resource_type: String,
        /// The duplicated name.
        name: String,
    },

    /// An environment name was requested that the config does not define.
    #[error("Unknown environment: {name}")]
    UnknownEnvironment {
        /// The requested environment name.
        name: String,
    },
}

/// Remote channel errors.
///
/// Every variant maps onto exactly one [`ErrorClass`] via
/// [`SyncError::class`]; channels construct these through the classifier
/// helpers rather than directly where possible.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The endpoint could not be reached.
    #[error("Endpoint {endpoint} unreachable: {message}")]
    Unreachable {
        /// Endpoint description (label plus host:port).
        endpoint: String,
        /// Description of the connection failure.
        message: String,
    },

    /// Authentication or authorization was rejected.
    #[error("Authorization rejected: {message}")]
    Unauthorized {
        /// Description of the rejection.
        message: String,
    },

    /// The remote side is throttling requests.
    #[error("Rate limited{}", retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited {
        /// Server-suggested wait in seconds, when provided.
        retry_after_secs: Option<u64>,
    },

    /// The addressed resource does not exist.
    #[error("Not found: {resource}")]
    NotFound {
        /// Name of the absent resource.
        resource: String,
    },

    /// The operation failed for an operation-specific reason.
    #[error("Remote operation '{operation}' failed: {message}")]
    OperationFailed {
        /// Name of the failed operation.
        operation: String,
        /// Error message from the remote side.
        message: String,
    },

    /// The operation exceeded its per-call timeout.
    #[error("Remote operation '{operation}' timed out after {seconds}s")]
    Timeout {
        /// Name of the timed-out operation.
        operation: String,
        /// Configured timeout in seconds.
        seconds: u64,
    },

    /// The remote response could not be interpreted.
    #[error("Invalid response from remote: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// A function bundle requires a capability the target cannot provide.
    #[error("Function '{resource}' is incompatible with the target platform: {message}")]
    Incompatible {
        /// The incompatible function.
        resource: String,
        /// Description of the incompatibility.
        message: String,
    },

    /// The retry policy was exhausted without success.
    #[error("Retries exhausted for '{operation}' after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Name of the operation that kept failing.
        operation: String,
        /// Number of attempts consumed.
        attempts: u32,
        /// The final attempt's error.
        #[source]
        source: Box<SyncError>,
    },

    /// Every candidate endpoint failed.
    #[error("All endpoints failed for '{operation}': {}", format_attempts(attempts))]
    AllEndpointsFailed {
        /// Name of the operation.
        operation: String,
        /// One record per attempted endpoint, in attempt order.
        attempts: Vec<EndpointAttempt>,
    },
}

fn format_attempts(attempts: &[EndpointAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A destructive plan was requested without the explicit replace gate.
    #[error("Refusing destructive plan: {message}")]
    DestructiveNotAllowed {
        /// Description of the refused action.
        message: String,
    },

    /// Shared-dependency resolution failed at the run level.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Function bundle errors.
#[derive(Debug, Error)]
pub enum BundleError {
    /// A bundle is structurally unusable.
    #[error("Invalid bundle for function '{slug}': {message}")]
    InvalidBundle {
        /// Function slug.
        slug: String,
        /// Description of the problem.
        message: String,
    },

    /// Bundle file content could not be decoded.
    #[error("Failed to decode bundle content for '{slug}': {message}")]
    Decode {
        /// Function slug.
        slug: String,
        /// Description of the decode failure.
        message: String,
    },
}

/// Run artifact errors.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Artifact file not found.
    #[error("Artifact not found: {path}")]
    NotFound {
        /// Path to the missing artifact.
        path: PathBuf,
    },

    /// Artifact content is corrupted.
    #[error("Artifact is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Artifact could not be written.
    #[error("Failed to write artifact: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// Sync lock acquisition failed.
    #[error("Failed to acquire sync lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Sync lock is held by another process.
    #[error("Target is locked by another sync run (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("Artifact serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Result type alias for envsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the failure classification of this error.
    ///
    /// Non-remote errors classify as [`ErrorClass::Fatal`]; an exhausted
    /// retry preserves the classification of its final attempt so the
    /// fallback loop can still decide whether the next endpoint is worth
    /// trying.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Remote(remote) => match remote {
                RemoteError::Unreachable { .. } | RemoteError::Timeout { .. } => {
                    ErrorClass::Unreachable
                }
                RemoteError::Unauthorized { .. } => ErrorClass::Unauthorized,
                RemoteError::RateLimited { .. } => ErrorClass::RateLimited,
                RemoteError::NotFound { .. } => ErrorClass::NotFound,
                RemoteError::Incompatible { .. } => ErrorClass::Incompatible,
                RemoteError::RetriesExhausted { source, .. } => source.class(),
                RemoteError::OperationFailed { .. }
                | RemoteError::InvalidResponse { .. }
                | RemoteError::AllEndpointsFailed { .. } => ErrorClass::Fatal,
            },
            _ => ErrorClass::Fatal,
        }
    }

    /// Returns true if this error is retryable on the same endpoint.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::RateLimited
    }

    /// Returns the server-suggested retry delay in seconds, if any.
    #[must_use]
    pub fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Remote(RemoteError::RateLimited { retry_after_secs }) => *retry_after_secs,
            Self::Remote(RemoteError::RetriesExhausted { source, .. }) => {
                source.retry_delay_secs()
            }
            _ => None,
        }
    }
}

impl RemoteError {
    /// Creates an unreachable error for the given endpoint.
    #[must_use]
    pub fn unreachable(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates an operation-specific failure.
    #[must_use]
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Maps an HTTP status plus response body onto the error taxonomy.
    ///
    /// This is the classifier adapter for the HTTP channels; subprocess
    /// channels have their own stderr adapter. Statuses outside the mapped
    /// set become operation failures carrying the body verbatim.
    #[must_use]
    pub fn from_http_status(
        operation: &str,
        status: u16,
        retry_after_secs: Option<u64>,
        body: &str,
    ) -> Self {
        match status {
            401 | 403 => Self::Unauthorized {
                message: format!("{operation}: HTTP {status}: {body}"),
            },
            404 => Self::NotFound {
                resource: operation.to_string(),
            },
            429 => Self::RateLimited { retry_after_secs },
            500..=599 => Self::OperationFailed {
                operation: operation.to_string(),
                message: format!("HTTP {status}: {body}"),
            },
            _ if is_rate_limit_signature(body) => Self::RateLimited { retry_after_secs },
            _ => Self::OperationFailed {
                operation: operation.to_string(),
                message: format!("HTTP {status}: {body}"),
            },
        }
    }
}

/// Returns true when a failure message carries a throttling signature.
///
/// Timeouts and generic failures are non-retryable unless they match one of
/// these patterns.
#[must_use]
pub fn is_rate_limit_signature(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429")
        || lower.contains("too many requests")
        || lower.contains("too many connections")
        || lower.contains("rate limit")
        || lower.contains("throttl")
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ArtifactError {
    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}
