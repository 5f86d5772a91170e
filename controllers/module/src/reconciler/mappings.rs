use super::Reconciler;
use crate::api::ModuleLoaderData;
use crate::kernel::normalize_kernel_version;
use crds::Module;
use k8s_openapi::api::core::v1::Node;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

fn node_kernel_version(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .node_info
        .as_ref()
        .map(|info| info.kernel_version.trim())
        .filter(|v| !v.is_empty())
}

impl Reconciler {
    /// Resolves every distinct kernel version among `targeted_nodes` once.
    ///
    /// Returns the kernel version to loader data map and the nodes whose
    /// kernel resolved. Nodes that fail to resolve are logged and left out.
    pub(crate) fn get_relevant_kernel_mappings_and_nodes(
        &self,
        module: &Module,
        targeted_nodes: &[Node],
    ) -> (BTreeMap<String, ModuleLoaderData>, Vec<Node>) {
        let namespace = module.metadata.namespace.as_deref().unwrap_or_default();
        let name = module.metadata.name.as_deref().unwrap_or_default();

        let mut mappings: BTreeMap<String, ModuleLoaderData> = BTreeMap::new();
        let mut unmapped: BTreeSet<String> = BTreeSet::new();
        let mut nodes = Vec::new();

        for node in targeted_nodes {
            let node_name = node.metadata.name.as_deref().unwrap_or_default();
            let Some(reported) = node_kernel_version(node) else {
                info!("Node {} reports no kernel version, skipping it for Module {}/{}", node_name, namespace, name);
                continue;
            };
            let kernel_version = normalize_kernel_version(reported);

            if mappings.contains_key(kernel_version) {
                debug!("Kernel {} of node {} already resolved in this pass", kernel_version, node_name);
                nodes.push(node.clone());
                continue;
            }
            if unmapped.contains(kernel_version) {
                continue;
            }

            match self.kernel_api.from_module(module, kernel_version) {
                Ok(mld) => {
                    mappings.insert(kernel_version.to_string(), mld);
                    nodes.push(node.clone());
                }
                Err(e) => {
                    info!(
                        "Node {} with kernel {} has no usable mapping for Module {}/{}: {}",
                        node_name, kernel_version, namespace, name, e
                    );
                    unmapped.insert(kernel_version.to_string());
                }
            }
        }

        (mappings, nodes)
    }
}
