//! Module CRD
//!
//! Declares a kernel module to load on every node matching a selector, with
//! per-kernel overrides for the image, the in-cluster build and the signing.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::build_sign::{Build, Sign};
use crate::kernel_mapping::KernelMapping;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "Module",
    namespaced,
    status = "ModuleStatus",
    shortname = "mod"
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// How the kernel module is loaded on the nodes
    pub module_loader: ModuleLoaderSpec,

    /// Optional device plugin deployed next to the module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_plugin: Option<DevicePluginSpec>,

    /// Node labels a node must carry to be targeted
    #[serde(default)]
    pub selector: BTreeMap<String, String>,

    /// Name of the pull secret for the module images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repo_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderSpec {
    pub container: ModuleLoaderContainerSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderContainerSpec {
    pub modprobe: ModprobeSpec,

    /// Module version; changing it rolls out new DaemonSets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Default image when no kernel mapping overrides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Default build recipe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    /// Default signing recipe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,

    /// Ordered kernel mappings; the first match wins
    #[serde(default)]
    pub kernel_mappings: Vec<KernelMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModprobeSpec {
    /// Kernel module name passed to modprobe
    pub module_name: String,

    /// Directory holding the `lib/modules` tree inside the image
    #[serde(default = "default_dir_name")]
    pub dir_name: String,

    /// Module parameters appended when loading
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Arguments replacing the default modprobe flags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ModprobeArgs>,

    /// Full modprobe command lines, used verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_args: Option<ModprobeArgs>,
}

impl Default for ModprobeSpec {
    fn default() -> Self {
        Self {
            module_name: String::new(),
            dir_name: default_dir_name(),
            parameters: Vec::new(),
            args: None,
            raw_args: None,
        }
    }
}

fn default_dir_name() -> String {
    "/opt".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModprobeArgs {
    #[serde(default)]
    pub load: Vec<String>,

    #[serde(default)]
    pub unload: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginSpec {
    pub container: DevicePluginContainerSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginContainerSpec {
    pub image: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: Vec<DevicePluginEnvVar>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginEnvVar {
    pub name: String,

    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    /// Counters for the module-loader DaemonSets
    #[serde(default)]
    pub module_loader: DaemonSetStatus,

    /// Counters for the device-plugin DaemonSet
    #[serde(default)]
    pub device_plugin: DaemonSetStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetStatus {
    /// Schedulable nodes matching the Module selector
    pub nodes_matching_selector_number: i32,

    /// Pods that should be running
    pub desired_number: i32,

    /// Pods that are available
    pub available_number: i32,
}

impl Module {
    /// Module version, empty when unset.
    pub fn module_version(&self) -> &str {
        self.spec.module_loader.container.version.as_deref().unwrap_or_default()
    }

    /// Whether any part of the spec asks for in-cluster builds and signing.
    pub fn build_and_sign_capable(&self) -> (bool, bool) {
        let container = &self.spec.module_loader.container;
        let mut build = container.build.is_some();
        let mut sign = container.sign.is_some();
        for mapping in &container.kernel_mappings {
            build |= mapping.build.is_some();
            sign |= mapping.sign.is_some();
        }
        (build, sign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_sign::Build;

    #[test]
    fn test_deserialize_minimal_module() {
        let module: Module = serde_json::from_value(serde_json::json!({
            "apiVersion": "kmm.sigs.x-k8s.io/v1beta1",
            "kind": "Module",
            "metadata": {"name": "dummy", "namespace": "kmm"},
            "spec": {
                "moduleLoader": {
                    "container": {
                        "modprobe": {"moduleName": "dummy"},
                        "containerImage": "quay.io/org/dummy:${KERNEL_FULL_VERSION}"
                    }
                },
                "selector": {"node-role.kubernetes.io/worker": ""}
            }
        }))
        .unwrap();

        assert_eq!(module.spec.module_loader.container.modprobe.dir_name, "/opt");
        assert_eq!(module.module_version(), "");
        assert!(module.spec.device_plugin.is_none());
        assert_eq!(module.spec.selector.len(), 1);
    }

    #[test]
    fn test_build_and_sign_capable_from_mappings() {
        let mut module = Module::new("dummy", ModuleSpec::default());
        assert_eq!(module.build_and_sign_capable(), (false, false));

        module.spec.module_loader.container.kernel_mappings.push(KernelMapping {
            literal: Some("5.14.0".to_string()),
            build: Some(Build::default()),
            ..Default::default()
        });
        assert_eq!(module.build_and_sign_capable(), (true, false));
    }
}
