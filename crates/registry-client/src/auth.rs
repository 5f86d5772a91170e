//! Registry credentials
//!
//! Pull secrets store credentials in the Docker config format, either the
//! `.dockerconfigjson` layout (`{"auths": {...}}`) or the legacy `.dockercfg`
//! one where the registry map is the top-level object.

use crate::error::RegistryError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use oci_client::Reference;
use oci_client::secrets::RegistryAuth;
use serde::Deserialize;
use std::collections::BTreeMap;

const DOCKER_HUB: &str = "docker.io";

/// Credentials presented to a registry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegistryCredentials {
    /// No credentials.
    #[default]
    Anonymous,
    /// Username and password, exchanged for a token when the registry asks.
    Basic {
        /// Registry user.
        username: String,
        /// Password or token.
        password: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DockerConfig {
    Current { auths: BTreeMap<String, DockerAuthEntry> },
    Legacy(BTreeMap<String, DockerAuthEntry>),
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Parses an image reference.
pub fn parse_reference(image: &str) -> Result<Reference, RegistryError> {
    image
        .parse::<Reference>()
        .map_err(|e| RegistryError::InvalidReference(format!("{}: {}", image, e)))
}

// "https://index.docker.io/v1/" and "quay.io" both name a registry host.
fn registry_host(key: &str) -> &str {
    let host = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB,
        other => other,
    }
}

impl DockerAuthEntry {
    fn credentials(&self, registry: &str) -> Result<RegistryCredentials, RegistryError> {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            if !username.is_empty() {
                return Ok(RegistryCredentials::Basic {
                    username: username.clone(),
                    password: password.clone(),
                });
            }
        }
        let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) else {
            return Err(RegistryError::Credentials(format!("entry for {} has no credentials", registry)));
        };
        let decoded = STANDARD
            .decode(auth)
            .map_err(|e| RegistryError::Credentials(format!("auth for {} is not base64: {}", registry, e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| RegistryError::Credentials(format!("auth for {} is not UTF-8: {}", registry, e)))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| RegistryError::Credentials(format!("auth for {} is not user:password", registry)))?;
        Ok(RegistryCredentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl RegistryCredentials {
    /// Picks the credentials for the registry hosting `image` out of a Docker
    /// config. A config without an entry for that registry yields anonymous
    /// access.
    pub fn for_image(docker_config: &[u8], image: &str) -> Result<Self, RegistryError> {
        let reference = parse_reference(image)?;
        let registry = registry_host(reference.registry());

        let auths = match serde_json::from_slice::<DockerConfig>(docker_config)? {
            DockerConfig::Current { auths } | DockerConfig::Legacy(auths) => auths,
        };

        match auths.iter().find(|(key, _)| registry_host(key) == registry) {
            Some((_, entry)) => entry.credentials(registry),
            None => Ok(Self::Anonymous),
        }
    }
}

impl From<&RegistryCredentials> for RegistryAuth {
    fn from(credentials: &RegistryCredentials) -> Self {
        match credentials {
            RegistryCredentials::Anonymous => RegistryAuth::Anonymous,
            RegistryCredentials::Basic { username, password } => RegistryAuth::Basic(username.clone(), password.clone()),
        }
    }
}
