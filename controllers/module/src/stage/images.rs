//! Registry lookups made with the Module's pull secret.

use crate::api::ModuleLoaderData;
use crate::cluster::ClusterApi;
use crate::error::{ControllerError, ResultExt};
use registry_client::{RegistryClientTrait, RegistryCredentials};
use std::sync::Arc;
use tracing::debug;

const DOCKER_CONFIG_JSON: &str = ".dockerconfigjson";
const DOCKER_CFG: &str = ".dockercfg";

/// Checks whether images exist, authenticating with `imageRepoSecret`.
#[derive(Clone)]
pub struct ImageChecker {
    cluster: Arc<dyn ClusterApi>,
    registry: Arc<dyn RegistryClientTrait>,
}

impl std::fmt::Debug for ImageChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageChecker").finish_non_exhaustive()
    }
}

impl ImageChecker {
    pub fn new(cluster: Arc<dyn ClusterApi>, registry: Arc<dyn RegistryClientTrait>) -> Self {
        Self { cluster, registry }
    }

    async fn credentials(&self, mld: &ModuleLoaderData, image: &str) -> Result<RegistryCredentials, ControllerError> {
        let Some(secret_name) = &mld.image_repo_secret else {
            return Ok(RegistryCredentials::Anonymous);
        };
        let secret = self
            .cluster
            .get_secret(&mld.namespace, secret_name)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("pull secret {}/{}", mld.namespace, secret_name)))?;
        let config = secret
            .data
            .as_ref()
            .and_then(|data| data.get(DOCKER_CONFIG_JSON).or_else(|| data.get(DOCKER_CFG)))
            .ok_or_else(|| {
                ControllerError::InvalidState(format!(
                    "pull secret {}/{} has neither {} nor {}",
                    mld.namespace, secret_name, DOCKER_CONFIG_JSON, DOCKER_CFG
                ))
            })?;
        debug!("Using pull secret {}/{} for {}", mld.namespace, secret_name, image);
        Ok(RegistryCredentials::for_image(&config.0, image)?)
    }

    pub async fn image_exists(&self, mld: &ModuleLoaderData, image: &str) -> Result<bool, ControllerError> {
        let credentials = self
            .credentials(mld, image)
            .await
            .with_context(|| format!("failed to get registry credentials for {}", image))?;
        self.registry
            .image_exists(image, &credentials)
            .await
            .with_context(|| format!("failed to check whether image {} exists", image))
    }
}
