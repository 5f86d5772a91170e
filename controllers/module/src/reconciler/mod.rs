//! Reconciliation logic for Modules.
//!
//! One pass takes a Module from its spec to the cluster state it asks for:
//! - `nodes`: select schedulable nodes matching the Module selector
//! - `mappings`: resolve each distinct kernel version once per pass
//! - `pipeline`: build, sign and deploy per kernel version, then the device plugin
//! - `gc`: remove DaemonSets and Jobs no longer backed by a kernel version
//! - `fleet_metrics`: report fleet-wide gauges
//!
//! Every collaborator is injected, so the whole pass runs against mocks in tests.

mod fleet_metrics;
mod gc;
mod mappings;
mod nodes;
mod pipeline;

use crate::backoff::FibonacciBackoff;
use crate::cluster::ClusterApi;
use crate::daemonset::DaemonSetManager;
use crate::error::{ControllerError, ResultExt};
use crate::kernel::ModuleLoaderDataFactory;
use crate::metrics::Metrics;
use crate::stage::StageManager;
use crate::status::ModuleStatusUpdater;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Backoff state for a Module
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min_seconds, max_seconds),
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Reconciles Modules.
pub struct Reconciler {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) kernel_api: Arc<dyn ModuleLoaderDataFactory>,
    pub(crate) build_api: Arc<dyn StageManager>,
    pub(crate) sign_api: Arc<dyn StageManager>,
    pub(crate) daemon_api: Arc<dyn DaemonSetManager>,
    pub(crate) metrics_api: Arc<dyn Metrics>,
    pub(crate) status_updater: Arc<dyn ModuleStatusUpdater>,
    /// Error count tracking per Module (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
    backoff_min_seconds: u64,
    backoff_max_seconds: u64,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("backoff_min_seconds", &self.backoff_min_seconds)
            .field("backoff_max_seconds", &self.backoff_max_seconds)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        kernel_api: Arc<dyn ModuleLoaderDataFactory>,
        build_api: Arc<dyn StageManager>,
        sign_api: Arc<dyn StageManager>,
        daemon_api: Arc<dyn DaemonSetManager>,
        metrics_api: Arc<dyn Metrics>,
        status_updater: Arc<dyn ModuleStatusUpdater>,
    ) -> Self {
        Self {
            cluster,
            kernel_api,
            build_api,
            sign_api,
            daemon_api,
            metrics_api,
            status_updater,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            backoff_min_seconds: 5,
            backoff_max_seconds: 300,
        }
    }

    /// Sets the requeue backoff bounds used after failed passes.
    #[must_use]
    pub fn with_backoff(mut self, min_seconds: u64, max_seconds: u64) -> Self {
        self.backoff_min_seconds = min_seconds;
        self.backoff_max_seconds = max_seconds;
        self
    }

    /// Runs one reconciliation pass for the Module `namespace/name`.
    ///
    /// A Module that no longer exists ends the pass without error. Build and
    /// sign Jobs that failed stall their kernel version but do not fail the
    /// pass; any failing call to a collaborator does.
    pub async fn reconcile_module(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        info!("Reconciling Module {}/{}", namespace, name);

        let module = match self.cluster.get_module(namespace, name).await {
            Ok(module) => module,
            Err(e) if e.is_not_found() => {
                info!("Module {}/{} deleted", namespace, name);
                self.forget_resource(&format!("{}/{}", namespace, name));
                self.metrics_api.remove_kmm_modprobe_args(name, namespace);
                return Ok(());
            }
            Err(e) => {
                return Err(e.context(format!("failed to get the requested Module {}/{}", namespace, name)));
            }
        };

        let targeted_nodes = self
            .get_nodes_list_by_selector(&module)
            .await
            .with_context(|| format!("could not get the list of nodes for Module {}/{}", namespace, name))?;

        let (mld_mappings, nodes_with_mapping) = self.get_relevant_kernel_mappings_and_nodes(&module, &targeted_nodes);

        for (kernel_version, mld) in &mld_mappings {
            self.handle_kernel_version(mld)
                .await
                .with_context(|| format!("failed to process kernel {} for Module {}/{}", kernel_version, namespace, name))?;
        }

        self.handle_device_plugin(&module)
            .await
            .with_context(|| format!("failed to handle the device plugin of Module {}/{}", namespace, name))?;

        let existing = self.daemon_api.get_module_daemon_sets(name, namespace).await?;

        let deleted = self
            .garbage_collect(&module, &mld_mappings, &existing)
            .await
            .with_context(|| format!("failed to garbage collect for Module {}/{}", namespace, name))?;
        let live: Vec<_> = existing
            .into_iter()
            .filter(|ds| ds.metadata.name.as_ref().is_none_or(|n| !deleted.contains(n)))
            .collect();

        self.set_kmm_metrics().await;

        self.status_updater
            .module_update_status(&module, &nodes_with_mapping, &targeted_nodes, &live)
            .await
            .with_context(|| format!("failed to update the status of Module {}/{}", namespace, name))?;

        info!("Reconciled Module {}/{}", namespace, name);
        Ok(())
    }

    /// Get the Fibonacci backoff duration for a Module based on its error count
    ///
    /// Returns (backoff, error_count)
    pub fn get_backoff_for_resource(&self, resource_key: &str) -> (Duration, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states
                    .entry(resource_key.to_string())
                    .or_insert_with(|| BackoffState::new(self.backoff_min_seconds, self.backoff_max_seconds));
                (state.backoff.next_backoff(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (Duration::from_secs(self.backoff_max_seconds), 0)
            }
        }
    }

    /// Increment error count for a Module
    pub fn increment_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            let state = states
                .entry(resource_key.to_string())
                .or_insert_with(|| BackoffState::new(self.backoff_min_seconds, self.backoff_max_seconds));
            state.increment_error();
        }
    }

    /// Drop the backoff state of a deleted Module
    pub fn forget_resource(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }

    /// Reset error count for a Module (on successful reconciliation)
    pub fn reset_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }
}
