//! Registry API client
//!
//! Resolves a manifest digest through the OCI distribution API. The token
//! exchange and the `WWW-Authenticate` handshake are left to `oci-client`.

use crate::auth::{RegistryCredentials, parse_reference};
use crate::error::RegistryError;
use crate::registry_trait::RegistryClientTrait;
use oci_client::Client;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::errors::{OciDistributionError, OciErrorCode};
use oci_client::secrets::RegistryAuth;
use tracing::debug;

/// Registry API client
#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient").finish_non_exhaustive()
    }
}

impl RegistryClient {
    /// Create a new registry client
    ///
    /// # Arguments
    /// * `insecure` - Talk plain HTTP to registries
    /// * `skip_tls_verify` - Accept invalid certificates over HTTPS
    pub fn new(insecure: bool, skip_tls_verify: bool) -> Self {
        let config = ClientConfig {
            protocol: if insecure { ClientProtocol::Http } else { ClientProtocol::Https },
            accept_invalid_certificates: skip_tls_verify,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
        }
    }
}

/// Whether the registry answered that the manifest or repository is absent.
pub fn is_missing_manifest(error: &OciDistributionError) -> bool {
    match error {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => envelope
            .errors
            .iter()
            .any(|e| matches!(e.code, OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown)),
        _ => false,
    }
}

#[async_trait::async_trait]
impl RegistryClientTrait for RegistryClient {
    async fn image_exists(&self, image: &str, credentials: &RegistryCredentials) -> Result<bool, RegistryError> {
        let reference = parse_reference(image)?;
        let auth = RegistryAuth::from(credentials);

        match self.client.fetch_manifest_digest(&reference, &auth).await {
            Ok(digest) => {
                debug!("Image {} resolves to {}", image, digest);
                Ok(true)
            }
            Err(e) if is_missing_manifest(&e) => {
                debug!("Image {} not found: {}", image, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
