use super::Reconciler;
use crate::error::ControllerError;
use crds::Module;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;

const NO_SCHEDULE: &str = "NoSchedule";

/// False when the node carries a `NoSchedule` taint.
pub fn is_schedulable(node: &Node) -> bool {
    !node
        .spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.effect == NO_SCHEDULE))
}

impl Reconciler {
    /// Schedulable nodes matching the Module selector.
    pub(crate) async fn get_nodes_list_by_selector(&self, module: &Module) -> Result<Vec<Node>, ControllerError> {
        debug!("Listing nodes with selector {:?}", module.spec.selector);
        let nodes = self.cluster.list_nodes(&module.spec.selector).await?;
        let total = nodes.len();
        let schedulable: Vec<Node> = nodes.into_iter().filter(is_schedulable).collect();
        debug!("{} of {} matching nodes are schedulable", schedulable.len(), total);
        Ok(schedulable)
    }
}
