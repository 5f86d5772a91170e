//! Registry client errors

use oci_client::errors::OciDistributionError;
use thiserror::Error;

/// Errors that can occur when talking to an image registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Distribution API error, including failed token exchanges
    #[error("Distribution error: {0}")]
    Distribution(#[from] OciDistributionError),

    /// Registry returned something the client cannot use
    #[error("Registry API error: {0}")]
    Api(String),

    /// Docker config JSON could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Pull secret content is unusable
    #[error("Invalid credentials: {0}")]
    Credentials(String),

    /// The image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),
}
