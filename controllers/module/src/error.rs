//! Controller-specific error types.
//!
//! This module defines error types specific to the Module Controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use registry_client::RegistryError;
use thiserror::Error;

/// Errors that can occur in the Module Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Image registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Requested object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write rejected because the object changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Kernel version could not be resolved to a mapping
    #[error("Kernel mapping error: {0}")]
    KernelMapping(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cluster state the controller cannot act on
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// JSON encoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Metrics server failed
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Several independent steps failed
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<ControllerError>),

    /// Error wrapped with the step that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ControllerError>,
    },
}

fn join_errors(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControllerError {
    /// Wraps the error with a description of what was being attempted.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        ControllerError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True when the error, or the error it wraps, is a 404.
    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::NotFound(_) => true,
            ControllerError::Kube(KubeError::Api(response)) => response.code == 404,
            ControllerError::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True when the error, or the error it wraps, is a 409.
    pub fn is_conflict(&self) -> bool {
        match self {
            ControllerError::Conflict(_) => true,
            ControllerError::Kube(KubeError::Api(response)) => response.code == 409,
            ControllerError::Context { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// Adds `context` to any `Result` carrying a `ControllerError`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, ControllerError>;

    fn with_context<F, S>(self, f: F) -> Result<T, ControllerError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<ControllerError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, ControllerError> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T, ControllerError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
