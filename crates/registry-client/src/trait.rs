//! RegistryClient trait for mocking
//!
//! The concrete [`RegistryClient`](crate::RegistryClient) implements this
//! trait; tests use [`MockRegistryClient`](crate::MockRegistryClient).

use crate::auth::RegistryCredentials;
use crate::error::RegistryError;

/// Registry operations used by the build and sign stages.
#[async_trait::async_trait]
pub trait RegistryClientTrait: Send + Sync {
    /// Returns true when the image reference resolves to a manifest.
    async fn image_exists(&self, image: &str, credentials: &RegistryCredentials) -> Result<bool, RegistryError>;
}
