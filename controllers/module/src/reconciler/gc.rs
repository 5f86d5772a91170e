use super::Reconciler;
use crate::api::{ModuleLoaderData, module_owner_reference};
use crate::error::ControllerError;
use crds::Module;
use k8s_openapi::api::apps::v1::DaemonSet;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info};

impl Reconciler {
    /// Removes DaemonSets and succeeded Jobs the pass no longer needs.
    ///
    /// The three collections run independently: a failure in one does not
    /// skip the others. Returns the names of the deleted DaemonSets.
    pub(crate) async fn garbage_collect(
        &self,
        module: &Module,
        mld_mappings: &BTreeMap<String, ModuleLoaderData>,
        existing: &[DaemonSet],
    ) -> Result<Vec<String>, ControllerError> {
        let namespace = module.metadata.namespace.as_deref().unwrap_or_default();
        let name = module.metadata.name.as_deref().unwrap_or_default();
        let owner = module_owner_reference(module);
        let valid_kernels: BTreeSet<String> = mld_mappings.keys().cloned().collect();

        let mut errors = Vec::new();
        let mut deleted_daemon_sets = Vec::new();

        match self.daemon_api.garbage_collect(module, existing, &valid_kernels).await {
            Ok(deleted) => {
                if !deleted.is_empty() {
                    info!("Garbage collected DaemonSets {:?} of Module {}/{}", deleted, namespace, name);
                }
                deleted_daemon_sets = deleted;
            }
            Err(e) => {
                error!("Failed to garbage collect DaemonSets of Module {}/{}: {}", namespace, name, e);
                errors.push(e.context("failed to garbage collect DaemonSets"));
            }
        }

        for stage in [&self.build_api, &self.sign_api] {
            let kind = stage.stage();
            match stage.garbage_collect(name, namespace, &owner).await {
                Ok(deleted) if !deleted.is_empty() => {
                    info!("Garbage collected {} jobs {:?} of Module {}/{}", kind, deleted, namespace, name);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to garbage collect {} jobs of Module {}/{}: {}", kind, namespace, name, e);
                    errors.push(e.context(format!("failed to garbage collect {} jobs", kind)));
                }
            }
        }

        match errors.len() {
            0 => Ok(deleted_daemon_sets),
            1 => Err(errors.remove(0)),
            _ => Err(ControllerError::Multiple(errors)),
        }
    }
}
