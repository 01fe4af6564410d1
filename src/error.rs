//! Error types for the ReplicaDB operator
//!
//! Errors fall into four groups that the controller treats differently:
//! transport/store errors (retried quickly), programming errors in the
//! object graph (logged loudly, never fixed by retrying), domain failures
//! reported by backup/restore objects, and delayed requeues, which are not
//! failures at all but a request to look again after a bounded wait.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("conflict updating {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// A backup, restore job or volume operation reported failure.
    #[error("{kind} {name} failed: {message}")]
    DomainFailure {
        kind: String,
        name: String,
        message: String,
    },

    /// The staged object graph is malformed. Always a bug in the engine.
    #[error("invalid object graph: {0}")]
    InvalidGraph(String),

    #[error("requeue after {after:?}: {reason}")]
    DelayedRequeue { after: Duration, reason: String },

    #[error("member agent error: {0}")]
    MemberAgentError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether a fresh reconcile pass may succeed without outside intervention
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 || e.code == 429 || e.code >= 500,
            Error::KubeError(_) => true,
            Error::HttpError(_) => true,
            Error::NotFound { .. } | Error::Conflict { .. } | Error::AlreadyExists { .. } => true,
            Error::MemberAgentError(_) => true,
            Error::DelayedRequeue { .. } => true,
            Error::FinalizerError(_) => true,
            Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::DomainFailure { .. }
            | Error::InvalidGraph(_) => false,
        }
    }

    /// Short category used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::FinalizerError(_) => "finalizer",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Conflict { .. } => "conflict",
            Error::DomainFailure { .. } => "domain",
            Error::InvalidGraph(_) => "graph",
            Error::DelayedRequeue { .. } => "requeue",
            Error::MemberAgentError(_) => "member_agent",
            Error::HttpError(_) => "http",
        }
    }

    pub fn is_programming_error(&self) -> bool {
        matches!(self, Error::InvalidGraph(_))
    }

    /// The wait carried by a delayed requeue, if this is one
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::DelayedRequeue { after, .. } => Some(*after),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => {
                e.code == 409 && e.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 && e.reason == "Conflict",
            _ => false,
        }
    }

    /// Pick the error to report when a pass produced two.
    ///
    /// A real error always outranks a delayed requeue.
    pub fn prefer(self, other: Error) -> Error {
        match (&self, &other) {
            (Error::DelayedRequeue { .. }, _) => other,
            _ => self,
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        match e {
            kube::runtime::finalizer::Error::ApplyFailed(inner)
            | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}
