//! Module-loader and device-plugin DaemonSets.
//!
//! Rendering only touches the object handed in, so the reconciler can apply
//! it to a freshly built DaemonSet or to the live one inside create-or-patch.
//! Only the fields the controller owns are written; anything the API server
//! defaulted on the live object is left as it is. Everything rendered comes
//! from ordered maps, which keeps repeated renders of the same input
//! byte-identical.

use crate::api::{ModuleLoaderData, module_owner_reference};
use crate::cluster::ClusterApi;
use crate::error::{ControllerError, ResultExt};
use async_trait::async_trait;
use crds::{ModprobeSpec, Module, labels};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, ExecAction, HostPathVolumeSource, Lifecycle, LifecycleHandler,
    LocalObjectReference, PodSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

const DEVICE_PLUGINS_DIR: &str = "/var/lib/kubelet/device-plugins";

/// Renders, lists and collects the DaemonSets of a Module.
#[async_trait]
pub trait DaemonSetManager: Send + Sync {
    /// Renders the module-loader DaemonSet for one kernel version onto `ds`.
    fn set_driver_container_as_desired(&self, ds: &mut DaemonSet, mld: &ModuleLoaderData) -> Result<(), ControllerError>;

    /// Renders the device-plugin DaemonSet of `module` onto `ds`.
    fn set_device_plugin_as_desired(&self, ds: &mut DaemonSet, module: &Module) -> Result<(), ControllerError>;

    /// Every DaemonSet labelled as belonging to the Module.
    async fn get_module_daemon_sets(&self, name: &str, namespace: &str) -> Result<Vec<DaemonSet>, ControllerError>;

    /// Deletes module-loader DaemonSets that no longer match a valid kernel
    /// and device-plugin DaemonSets of another module version.
    async fn garbage_collect(
        &self,
        module: &Module,
        existing: &[DaemonSet],
        valid_kernels: &BTreeSet<String>,
    ) -> Result<Vec<String>, ControllerError>;
}

fn label<'a>(ds: &'a DaemonSet, key: &str) -> Option<&'a str> {
    ds.metadata.labels.as_ref()?.get(key).map(String::as_str)
}

pub fn is_module_loader(ds: &DaemonSet) -> bool {
    label(ds, labels::ROLE) == Some(labels::ROLE_MODULE_LOADER)
}

pub fn is_device_plugin(ds: &DaemonSet) -> bool {
    label(ds, labels::ROLE) == Some(labels::ROLE_DEVICE_PLUGIN)
}

pub fn kernel_version_of(ds: &DaemonSet) -> Option<&str> {
    label(ds, labels::KERNEL_VERSION)
}

pub fn module_version_of(ds: &DaemonSet) -> &str {
    label(ds, labels::MODULE_VERSION).unwrap_or_default()
}

/// Argument vector that loads the module.
pub fn modprobe_load_command(spec: &ModprobeSpec) -> Vec<String> {
    let mut command = vec!["modprobe".to_string()];
    if let Some(raw) = spec.raw_args.as_ref().filter(|r| !r.load.is_empty()) {
        command.extend(raw.load.iter().cloned());
        return command;
    }
    match spec.args.as_ref().filter(|a| !a.load.is_empty()) {
        Some(args) => command.extend(args.load.iter().cloned()),
        None => command.push("-v".to_string()),
    }
    command.extend(["-d".to_string(), spec.dir_name.clone(), spec.module_name.clone()]);
    command.extend(spec.parameters.iter().cloned());
    command
}

/// Argument vector that unloads the module.
pub fn modprobe_unload_command(spec: &ModprobeSpec) -> Vec<String> {
    let mut command = vec!["modprobe".to_string()];
    if let Some(raw) = spec.raw_args.as_ref().filter(|r| !r.unload.is_empty()) {
        command.extend(raw.unload.iter().cloned());
        return command;
    }
    match spec.args.as_ref().filter(|a| !a.unload.is_empty()) {
        Some(args) => command.extend(args.unload.iter().cloned()),
        None => command.push("-rv".to_string()),
    }
    command.extend(["-d".to_string(), spec.dir_name.clone(), spec.module_name.clone()]);
    command
}

fn exec_handler(command: Vec<String>) -> LifecycleHandler {
    LifecycleHandler {
        exec: Some(ExecAction { command: Some(command) }),
        ..Default::default()
    }
}

fn image_pull_secrets(secret: Option<&String>) -> Option<Vec<LocalObjectReference>> {
    secret.map(|name| vec![LocalObjectReference { name: name.clone() }])
}

fn merge_metadata(ds: &mut DaemonSet, labels: &BTreeMap<String, String>, module_owner: ObjectMeta) {
    ds.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    ds.metadata.owner_references = module_owner.owner_references;
}

/// Writes the owned parts of the pod template onto `ds`.
///
/// The selector, the template labels and the single container are owned;
/// `owned_pod_fields` sets the pod-level fields the caller owns.
fn apply_pod_template(
    ds: &mut DaemonSet,
    pod_labels: &BTreeMap<String, String>,
    container: Container,
    owned_pod_fields: impl FnOnce(&mut PodSpec),
) {
    let spec = ds.spec.get_or_insert_with(DaemonSetSpec::default);
    spec.selector = LabelSelector {
        match_labels: Some(pod_labels.clone()),
        match_expressions: None,
    };
    spec.template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels = Some(pod_labels.clone());

    let pod = spec.template.spec.get_or_insert_with(PodSpec::default);
    let mut merged = pod
        .containers
        .iter()
        .find(|c| c.name == container.name)
        .cloned()
        .unwrap_or_default();
    merged.name = container.name;
    merged.image = container.image;
    if container.image_pull_policy.is_some() {
        merged.image_pull_policy = container.image_pull_policy;
    }
    merged.command = container.command;
    merged.args = container.args;
    merged.env = container.env;
    merged.lifecycle = container.lifecycle;
    merged.security_context = container.security_context;
    merged.volume_mounts = container.volume_mounts;
    pod.containers = vec![merged];

    owned_pod_fields(pod);
}

/// Concrete [`DaemonSetManager`].
pub struct DaemonSetCreator {
    cluster: Arc<dyn ClusterApi>,
    kernel_label: String,
    default_pull_policy: Option<String>,
}

impl std::fmt::Debug for DaemonSetCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonSetCreator")
            .field("kernel_label", &self.kernel_label)
            .finish_non_exhaustive()
    }
}

impl DaemonSetCreator {
    pub fn new(cluster: Arc<dyn ClusterApi>, kernel_label: impl Into<String>, default_pull_policy: Option<String>) -> Self {
        Self {
            cluster,
            kernel_label: kernel_label.into(),
            default_pull_policy,
        }
    }
}

#[async_trait]
impl DaemonSetManager for DaemonSetCreator {
    fn set_driver_container_as_desired(&self, ds: &mut DaemonSet, mld: &ModuleLoaderData) -> Result<(), ControllerError> {
        if mld.kernel_version.is_empty() {
            return Err(ControllerError::InvalidState(format!(
                "cannot render module loader of {}/{} without a kernel version",
                mld.namespace, mld.name
            )));
        }

        let pod_labels = BTreeMap::from([
            (labels::MODULE_NAME.to_string(), mld.name.clone()),
            (labels::KERNEL_VERSION.to_string(), mld.kernel_version.clone()),
            (labels::MODULE_VERSION.to_string(), mld.module_version.clone()),
            (labels::ROLE.to_string(), labels::ROLE_MODULE_LOADER.to_string()),
        ]);

        let mut node_selector = mld.selector.clone();
        node_selector.insert(self.kernel_label.clone(), mld.kernel_version.clone());

        let container = Container {
            name: "module-loader".to_string(),
            image: Some(mld.container_image.clone()),
            image_pull_policy: mld.image_pull_policy.clone().or_else(|| self.default_pull_policy.clone()),
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            lifecycle: Some(Lifecycle {
                post_start: Some(exec_handler(modprobe_load_command(&mld.modprobe))),
                pre_stop: Some(exec_handler(modprobe_unload_command(&mld.modprobe))),
                ..Default::default()
            }),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                run_as_user: Some(0),
                capabilities: Some(Capabilities {
                    add: Some(vec!["SYS_MODULE".to_string()]),
                    drop: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        merge_metadata(
            ds,
            &pod_labels,
            ObjectMeta {
                owner_references: Some(vec![mld.owner.clone()]),
                ..Default::default()
            },
        );
        apply_pod_template(ds, &pod_labels, container, |pod| {
            pod.node_selector = Some(node_selector);
            pod.service_account_name = mld.service_account_name.clone();
            pod.image_pull_secrets = image_pull_secrets(mld.image_repo_secret.as_ref());
        });
        Ok(())
    }

    fn set_device_plugin_as_desired(&self, ds: &mut DaemonSet, module: &Module) -> Result<(), ControllerError> {
        let name = module.metadata.name.clone().unwrap_or_default();
        let device_plugin = module.spec.device_plugin.as_ref().ok_or_else(|| {
            ControllerError::InvalidState(format!("Module {} has no device plugin", name))
        })?;

        let pod_labels = BTreeMap::from([
            (labels::MODULE_NAME.to_string(), name),
            (labels::MODULE_VERSION.to_string(), module.module_version().to_string()),
            (labels::ROLE.to_string(), labels::ROLE_DEVICE_PLUGIN.to_string()),
        ]);

        let dp = &device_plugin.container;
        let container = Container {
            name: "device-plugin".to_string(),
            image: Some(dp.image.clone()),
            args: (!dp.args.is_empty()).then(|| dp.args.clone()),
            env: (!dp.env.is_empty()).then(|| {
                dp.env
                    .iter()
                    .map(|e| EnvVar {
                        name: e.name.clone(),
                        value: Some(e.value.clone()),
                        value_from: None,
                    })
                    .collect()
            }),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: "kubelet-device-plugins".to_string(),
                mount_path: DEVICE_PLUGINS_DIR.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        merge_metadata(
            ds,
            &pod_labels,
            ObjectMeta {
                owner_references: Some(vec![module_owner_reference(module)]),
                ..Default::default()
            },
        );
        apply_pod_template(ds, &pod_labels, container, |pod| {
            pod.node_selector = (!module.spec.selector.is_empty()).then(|| module.spec.selector.clone());
            pod.service_account_name = device_plugin.service_account_name.clone();
            pod.image_pull_secrets = image_pull_secrets(module.spec.image_repo_secret.as_ref());
            pod.volumes = Some(vec![Volume {
                name: "kubelet-device-plugins".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: DEVICE_PLUGINS_DIR.to_string(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            }]);
        });
        Ok(())
    }

    async fn get_module_daemon_sets(&self, name: &str, namespace: &str) -> Result<Vec<DaemonSet>, ControllerError> {
        let selector = BTreeMap::from([(labels::MODULE_NAME.to_string(), name.to_string())]);
        self.cluster
            .list_daemon_sets(namespace, &selector)
            .await
            .with_context(|| format!("failed to list DaemonSets of Module {}/{}", namespace, name))
    }

    async fn garbage_collect(
        &self,
        module: &Module,
        existing: &[DaemonSet],
        valid_kernels: &BTreeSet<String>,
    ) -> Result<Vec<String>, ControllerError> {
        let namespace = module.metadata.namespace.as_deref().unwrap_or_default();
        let current_version = module.module_version();

        // Kernels that already run the current module version.
        let current: BTreeSet<&str> = existing
            .iter()
            .filter(|ds| is_module_loader(ds) && module_version_of(ds) == current_version)
            .filter_map(kernel_version_of)
            .collect();

        let mut deleted = Vec::new();
        for ds in existing {
            let Some(name) = ds.metadata.name.as_deref() else {
                continue;
            };
            let stale = if is_module_loader(ds) {
                match kernel_version_of(ds) {
                    Some(kernel) if valid_kernels.contains(kernel) => {
                        module_version_of(ds) != current_version && current.contains(kernel)
                    }
                    _ => true,
                }
            } else if is_device_plugin(ds) {
                module.spec.device_plugin.is_none() || module_version_of(ds) != current_version
            } else {
                false
            };
            if !stale {
                continue;
            }
            info!("Deleting stale DaemonSet {}/{}", namespace, name);
            self.cluster
                .delete_daemon_set(namespace, name)
                .await
                .with_context(|| format!("failed to delete DaemonSet {}/{}", namespace, name))?;
            deleted.push(name.to_string());
        }
        Ok(deleted)
    }
}

#[cfg(test)]
#[path = "daemonset_test.rs"]
mod tests;
