use super::Reconciler;
use tracing::{debug, warn};

impl Reconciler {
    /// Recomputes fleet-wide gauges from every Module in scope.
    ///
    /// Listing failures are logged and otherwise ignored.
    pub(crate) async fn set_kmm_metrics(&self) {
        let modules = match self.cluster.list_modules().await {
            Ok(modules) => modules,
            Err(e) => {
                warn!("Failed to list Modules for metrics: {}", e);
                return;
            }
        };

        let mut build = 0;
        let mut sign = 0;
        let mut device_plugin = 0;
        for module in &modules {
            let (can_build, can_sign) = module.build_and_sign_capable();
            build += usize::from(can_build);
            sign += usize::from(can_sign);
            device_plugin += usize::from(module.spec.device_plugin.is_some());

            let name = module.metadata.name.as_deref().unwrap_or_default();
            let namespace = module.metadata.namespace.as_deref().unwrap_or_default();
            let modprobe = &module.spec.module_loader.container.modprobe;
            if let Some(args) = modprobe.args.as_ref().filter(|a| !a.load.is_empty()) {
                self.metrics_api.set_kmm_modprobe_args(name, namespace, &args.load.join(","));
            }
            if let Some(raw) = modprobe.raw_args.as_ref().filter(|a| !a.load.is_empty()) {
                self.metrics_api.set_kmm_modprobe_raw_args(name, namespace, &raw.load.join(","));
            }
        }

        debug!(
            "Fleet metrics: {} modules, {} build, {} sign, {} device plugins",
            modules.len(),
            build,
            sign,
            device_plugin
        );
        self.metrics_api.set_kmm_modules_num(modules.len());
        self.metrics_api.set_kmm_in_cluster_build_num(build);
        self.metrics_api.set_kmm_in_cluster_sign_num(sign);
        self.metrics_api.set_kmm_device_plugin_num(device_plugin);
    }
}
