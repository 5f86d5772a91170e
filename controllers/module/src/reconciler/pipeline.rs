use super::Reconciler;
use crate::api::ModuleLoaderData;
use crate::error::{ControllerError, ResultExt};
use crate::reconcile_helpers::{
    create_or_patch_daemon_set, device_plugin_daemon_set_name, module_loader_daemon_set_name,
};
use crate::stage::{StageManager, StageOutcome};
use crds::Module;
use tracing::{debug, info, warn};

/// Runs one stage for a kernel version.
///
/// Any outcome other than `Completed`, `Failed` or `NotNeeded` is reported as
/// `InProgress`.
pub(crate) async fn handle_stage(
    stage: &dyn StageManager,
    mld: &ModuleLoaderData,
) -> Result<StageOutcome, ControllerError> {
    let kind = stage.stage();
    let needed = stage
        .should_sync(mld)
        .await
        .with_context(|| format!("could not check if {} is needed", kind))?;
    if !needed {
        debug!("No {} needed for {}/{} on kernel {}", kind, mld.namespace, mld.name, mld.kernel_version);
        return Ok(StageOutcome::NotNeeded);
    }

    info!("Running {} for {}/{} on kernel {}", kind, mld.namespace, mld.name, mld.kernel_version);
    let outcome = stage
        .sync(mld, &mld.owner)
        .await
        .with_context(|| format!("could not synchronize the {}", kind))?;

    match outcome {
        StageOutcome::Completed => {
            info!("{} completed for {}/{} on kernel {}", kind, mld.namespace, mld.name, mld.kernel_version);
            Ok(StageOutcome::Completed)
        }
        StageOutcome::Failed => {
            warn!(
                "{} job for {}/{} on kernel {} failed; delete the job after the fix in order to restart it",
                kind, mld.namespace, mld.name, mld.kernel_version
            );
            Ok(StageOutcome::Failed)
        }
        _ => {
            info!("{} in progress for {}/{} on kernel {}", kind, mld.namespace, mld.name, mld.kernel_version);
            Ok(StageOutcome::InProgress)
        }
    }
}

impl Reconciler {
    /// Build, then sign, then the module-loader DaemonSet for one kernel.
    ///
    /// A stage that is not done ends the kernel's pipeline for this pass
    /// without an error.
    pub(crate) async fn handle_kernel_version(&self, mld: &ModuleLoaderData) -> Result<(), ControllerError> {
        let build = handle_stage(self.build_api.as_ref(), mld).await?;
        if !build.is_done() {
            return Ok(());
        }

        let sign = handle_stage(self.sign_api.as_ref(), mld).await?;
        if !sign.is_done() {
            return Ok(());
        }

        let name = module_loader_daemon_set_name(&mld.name, &mld.kernel_version, &mld.module_version)?;
        let result = create_or_patch_daemon_set(self.cluster.as_ref(), &mld.namespace, &name, |ds| {
            self.daemon_api.set_driver_container_as_desired(ds, mld)
        })
        .await
        .with_context(|| format!("failed to create or patch DaemonSet {}/{}", mld.namespace, name))?;
        info!("Module loader DaemonSet {}/{} reconciled: {:?}", mld.namespace, name, result);
        Ok(())
    }

    /// Upserts the device-plugin DaemonSet when the Module declares one.
    pub(crate) async fn handle_device_plugin(&self, module: &Module) -> Result<(), ControllerError> {
        if module.spec.device_plugin.is_none() {
            return Ok(());
        }
        let namespace = module.metadata.namespace.as_deref().unwrap_or_default();
        let module_name = module.metadata.name.as_deref().unwrap_or_default();

        let name = device_plugin_daemon_set_name(module_name, module.module_version())?;
        let result = create_or_patch_daemon_set(self.cluster.as_ref(), namespace, &name, |ds| {
            self.daemon_api.set_device_plugin_as_desired(ds, module)
        })
        .await?;
        info!("Device plugin DaemonSet {}/{} reconciled: {:?}", namespace, name, result);
        Ok(())
    }
}
