//! In-cluster build and signing recipes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    /// ConfigMap holding the Dockerfile under the `dockerfile` key
    pub dockerfile_config_map: String,

    #[serde(default)]
    pub build_args: Vec<BuildArg>,

    /// Secrets mounted into the build
    #[serde(default)]
    pub secrets: Vec<String>,

    #[serde(default)]
    pub base_image_registry_tls: RegistryTls,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildArg {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryTls {
    /// Plain HTTP
    #[serde(default)]
    pub insecure: bool,

    /// HTTPS without certificate verification
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sign {
    /// Image to sign; defaults to the build output when a build is declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned_image: Option<String>,

    /// Secret holding the private key under the `key` key
    pub key_secret: String,

    /// Secret holding the public certificate under the `cert` key
    pub cert_secret: String,

    /// Paths of the `.ko` files to sign inside the image
    #[serde(default)]
    pub files_to_sign: Vec<String>,
}
