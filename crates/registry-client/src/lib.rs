//! OCI Registry Client
//!
//! The module controller only needs to know whether an image reference
//! resolves to a manifest, which decides whether a build or a sign Job has to
//! run. Lookups go through `oci-client` with the credentials of the Module's
//! pull secret.
//!
//! # Example
//!
//! ```no_run
//! use registry_client::{RegistryClient, RegistryClientTrait, RegistryCredentials};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RegistryClient::new(false, false);
//! let exists = client
//!     .image_exists("quay.io/org/dummy:5.14.0", &RegistryCredentials::Anonymous)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Pull secrets**: credentials are picked out of `.dockerconfigjson` or `.dockercfg` content
//! - **Mocking**: `MockRegistryClient` behind the `test-util` feature

pub mod auth;
pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod registry_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use auth::RegistryCredentials;
pub use client::RegistryClient;
pub use error::RegistryError;
pub use registry_trait::RegistryClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockRegistryClient;
