//! Fleet-wide Prometheus gauges.

use crate::error::ControllerError;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// Metrics the reconciler reports after each pass.
pub trait Metrics: Send + Sync {
    fn set_kmm_modules_num(&self, value: usize);
    fn set_kmm_in_cluster_build_num(&self, value: usize);
    fn set_kmm_in_cluster_sign_num(&self, value: usize);
    fn set_kmm_device_plugin_num(&self, value: usize);
    /// Records the modprobe arguments configured for a Module.
    fn set_kmm_modprobe_args(&self, name: &str, namespace: &str, args: &str);
    fn set_kmm_modprobe_raw_args(&self, name: &str, namespace: &str, args: &str);
    /// Drops the modprobe series of a deleted Module.
    fn remove_kmm_modprobe_args(&self, name: &str, namespace: &str);
}

/// [`Metrics`] backed by a Prometheus registry.
pub struct PrometheusMetrics {
    registry: Registry,
    modules: IntGauge,
    in_cluster_build: IntGauge,
    in_cluster_sign: IntGauge,
    device_plugin: IntGauge,
    modprobe_args: IntGaugeVec,
    modprobe_raw_args: IntGaugeVec,
    // Last reported argument string per Module, so a change replaces the series.
    last_args: Mutex<HashMap<(String, String, bool), String>>,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

fn to_gauge(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let modules = IntGauge::new("kmm_module_num", "Number of existing KMM Modules")?;
        let in_cluster_build = IntGauge::new(
            "kmm_in_cluster_build_num",
            "Number of KMM Modules with in-cluster build defined",
        )?;
        let in_cluster_sign = IntGauge::new(
            "kmm_in_cluster_sign_num",
            "Number of KMM Modules with in-cluster sign defined",
        )?;
        let device_plugin = IntGauge::new(
            "kmm_device_plugin_num",
            "Number of KMM Modules with device plugin defined",
        )?;
        let modprobe_args = IntGaugeVec::new(
            Opts::new("kmm_modprobe_args", "Modprobe arguments configured per Module"),
            &["name", "namespace", "modprobe_args"],
        )?;
        let modprobe_raw_args = IntGaugeVec::new(
            Opts::new("kmm_modprobe_raw_args", "Raw modprobe arguments configured per Module"),
            &["name", "namespace", "modprobe_raw_args"],
        )?;

        registry.register(Box::new(modules.clone()))?;
        registry.register(Box::new(in_cluster_build.clone()))?;
        registry.register(Box::new(in_cluster_sign.clone()))?;
        registry.register(Box::new(device_plugin.clone()))?;
        registry.register(Box::new(modprobe_args.clone()))?;
        registry.register(Box::new(modprobe_raw_args.clone()))?;

        Ok(Self {
            registry,
            modules,
            in_cluster_build,
            in_cluster_sign,
            device_plugin,
            modprobe_args,
            modprobe_raw_args,
            last_args: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn set_args(&self, vec: &IntGaugeVec, raw: bool, name: &str, namespace: &str, args: &str) {
        let mut last = match self.last_args.lock() {
            Ok(last) => last,
            Err(e) => {
                warn!("Failed to lock modprobe args metrics state: {}", e);
                return;
            }
        };
        let key = (namespace.to_string(), name.to_string(), raw);
        if let Some(previous) = last.insert(key, args.to_string()) {
            if previous != args {
                let _ = vec.remove_label_values(&[name, namespace, previous.as_str()]);
            }
        }
        vec.with_label_values(&[name, namespace, args]).set(1);
    }
}

impl Metrics for PrometheusMetrics {
    fn remove_kmm_modprobe_args(&self, name: &str, namespace: &str) {
        let mut last = match self.last_args.lock() {
            Ok(last) => last,
            Err(e) => {
                warn!("Failed to lock modprobe args metrics state: {}", e);
                return;
            }
        };
        for (raw, vec) in [(false, &self.modprobe_args), (true, &self.modprobe_raw_args)] {
            if let Some(previous) = last.remove(&(namespace.to_string(), name.to_string(), raw)) {
                let _ = vec.remove_label_values(&[name, namespace, previous.as_str()]);
            }
        }
    }

    fn set_kmm_modules_num(&self, value: usize) {
        self.modules.set(to_gauge(value));
    }

    fn set_kmm_in_cluster_build_num(&self, value: usize) {
        self.in_cluster_build.set(to_gauge(value));
    }

    fn set_kmm_in_cluster_sign_num(&self, value: usize) {
        self.in_cluster_sign.set(to_gauge(value));
    }

    fn set_kmm_device_plugin_num(&self, value: usize) {
        self.device_plugin.set(to_gauge(value));
    }

    fn set_kmm_modprobe_args(&self, name: &str, namespace: &str, args: &str) {
        self.set_args(&self.modprobe_args, false, name, namespace, args);
    }

    fn set_kmm_modprobe_raw_args(&self, name: &str, namespace: &str, args: &str) {
        self.set_args(&self.modprobe_raw_args, true, name, namespace, args);
    }
}
