//! Maps Node events to the Modules they concern.

use crds::Module;
use k8s_openapi::api::core::v1::Node;
use kube_runtime::reflector::ObjectRef;
use std::sync::Arc;
use tracing::debug;

/// Whether every selector label is present on the node with the same value.
pub fn selector_matches(module: &Module, node: &Node) -> bool {
    let labels = node.metadata.labels.as_ref();
    module
        .spec
        .selector
        .iter()
        .all(|(key, value)| labels.and_then(|l| l.get(key)) == Some(value))
}

/// References to the cached Modules whose selector matches `node`.
pub fn find_modules_for_node(modules: &[Arc<Module>], node: &Node) -> Vec<ObjectRef<Module>> {
    let refs: Vec<ObjectRef<Module>> = modules
        .iter()
        .filter(|module| selector_matches(module, node))
        .map(|module| ObjectRef::from_obj(module.as_ref()))
        .collect();
    debug!(
        "Node {} event maps to {} Module(s)",
        node.metadata.name.as_deref().unwrap_or_default(),
        refs.len()
    );
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{module, node};

    #[test]
    fn test_node_event_requeues_matching_modules() {
        let mut everywhere = module("everywhere", "drivers", "v1");
        everywhere.spec.selector.clear();
        let modules = vec![
            Arc::new(module("kmod", "drivers", "v1")),
            Arc::new(module("other", "tools", "v1")),
            Arc::new(everywhere),
        ];

        let worker = node("a", "5.14.0", &[("worker", "true")]);
        let names: Vec<String> = find_modules_for_node(&modules, &worker)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["kmod", "other", "everywhere"]);

        let control_plane = node("b", "5.14.0", &[("worker", "false")]);
        let refs = find_modules_for_node(&modules, &control_plane);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "everywhere");
        assert_eq!(refs[0].namespace.as_deref(), Some("drivers"));
    }
}
