//! Module status reporting.

use crate::cluster::ClusterApi;
use crate::daemonset::{is_device_plugin, is_module_loader};
use crate::error::{ControllerError, ResultExt};
use async_trait::async_trait;
use crds::{DaemonSetStatus, Module, ModuleStatus};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait ModuleStatusUpdater: Send + Sync {
    async fn module_update_status(
        &self,
        module: &Module,
        nodes_with_mapping: &[Node],
        targeted_nodes: &[Node],
        daemon_sets: &[DaemonSet],
    ) -> Result<(), ControllerError>;
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Status derived from the nodes and DaemonSets seen in a pass.
pub fn compute_status(
    module: &Module,
    nodes_with_mapping: &[Node],
    targeted_nodes: &[Node],
    daemon_sets: &[DaemonSet],
) -> ModuleStatus {
    let available = |filter: fn(&DaemonSet) -> bool| -> i32 {
        daemon_sets
            .iter()
            .filter(|ds| filter(ds))
            .filter_map(|ds| ds.status.as_ref())
            .map(|s| s.number_available.unwrap_or(0))
            .sum()
    };

    let module_loader = DaemonSetStatus {
        nodes_matching_selector_number: count(targeted_nodes.len()),
        desired_number: count(nodes_with_mapping.len()),
        available_number: available(is_module_loader),
    };

    let device_plugin = if module.spec.device_plugin.is_some() {
        DaemonSetStatus {
            nodes_matching_selector_number: count(targeted_nodes.len()),
            desired_number: daemon_sets
                .iter()
                .filter(|ds| is_device_plugin(ds))
                .filter_map(|ds| ds.status.as_ref())
                .map(|s| s.desired_number_scheduled)
                .sum(),
            available_number: available(is_device_plugin),
        }
    } else {
        DaemonSetStatus::default()
    };

    ModuleStatus {
        module_loader,
        device_plugin,
    }
}

/// Patches the status subresource when the computed status changed.
pub struct StatusUpdater {
    cluster: Arc<dyn ClusterApi>,
}

impl std::fmt::Debug for StatusUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusUpdater").finish_non_exhaustive()
    }
}

impl StatusUpdater {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl ModuleStatusUpdater for StatusUpdater {
    async fn module_update_status(
        &self,
        module: &Module,
        nodes_with_mapping: &[Node],
        targeted_nodes: &[Node],
        daemon_sets: &[DaemonSet],
    ) -> Result<(), ControllerError> {
        let name = module.metadata.name.as_deref().unwrap_or_default();
        let namespace = module.metadata.namespace.as_deref().unwrap_or_default();
        let status = compute_status(module, nodes_with_mapping, targeted_nodes, daemon_sets);

        if module.status.as_ref() == Some(&status) {
            debug!("Status of Module {}/{} unchanged", namespace, name);
            return Ok(());
        }

        self.cluster
            .patch_module_status(namespace, name, &status)
            .await
            .with_context(|| format!("failed to update status of Module {}/{}", namespace, name))
    }
}
