//! Kubernetes resource watchers.
//!
//! Drives the reconciler from a kube_runtime::Controller over Modules. The
//! controller also watches the DaemonSets and Jobs a Module owns, and maps
//! Node events back to the Modules whose selector matches the node.

use crate::error::ControllerError;
use crate::filter;
use crate::reconciler::Reconciler;
use crds::Module;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use kube::ResourceExt;
use kube_runtime::{Controller, controller::{Action, Config as ControllerConfig}, watcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEBOUNCE: Duration = Duration::from_secs(5);

fn resource_key(module: &Module) -> String {
    format!("{}/{}", module.namespace().unwrap_or_default(), module.name_any())
}

async fn reconcile(module: Arc<Module>, ctx: Arc<Reconciler>) -> Result<Action, ControllerError> {
    let key = resource_key(&module);
    debug!("Reconciling Module {}", key);

    let namespace = module.namespace().unwrap_or_default();
    match ctx.reconcile_module(&namespace, &module.name_any()).await {
        Ok(()) => {
            ctx.reset_error(&key);
            Ok(Action::await_change())
        }
        Err(e) => {
            error!("Reconciliation failed for Module {}: {}", key, e);
            Err(e)
        }
    }
}

fn error_policy(module: Arc<Module>, error: &ControllerError, ctx: Arc<Reconciler>) -> Action {
    let key = resource_key(&module);
    ctx.increment_error(&key);
    let (backoff, error_count) = ctx.get_backoff_for_resource(&key);
    warn!(
        "Reconciliation error for Module {} (error #{}), requeueing in {:?}: {}",
        key, error_count, backoff, error
    );
    Action::requeue(backoff)
}

/// Watches Modules and the objects that affect them.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    module_api: Api<Module>,
    daemon_set_api: Api<DaemonSet>,
    job_api: Api<Job>,
    node_api: Api<Node>,
    concurrency: u16,
}

impl Watcher {
    pub fn new(
        reconciler: Arc<Reconciler>,
        module_api: Api<Module>,
        daemon_set_api: Api<DaemonSet>,
        job_api: Api<Job>,
        node_api: Api<Node>,
        concurrency: u16,
    ) -> Self {
        Self {
            reconciler,
            module_api,
            daemon_set_api,
            job_api,
            node_api,
            concurrency,
        }
    }

    /// Runs the Module controller until its stream ends.
    pub async fn watch_modules(&self) -> Result<(), ControllerError> {
        info!("Starting Module watcher (concurrency {})", self.concurrency);

        let controller_config = ControllerConfig::default()
            .debounce(DEBOUNCE)
            .concurrency(self.concurrency);

        let controller = Controller::new(self.module_api.clone(), watcher::Config::default());
        let modules = controller.store();

        controller
            .owns(self.daemon_set_api.clone(), watcher::Config::default())
            .owns(self.job_api.clone(), watcher::Config::default())
            .watches(self.node_api.clone(), watcher::Config::default(), move |node: Node| {
                filter::find_modules_for_node(&modules.state(), &node)
            })
            .with_config(controller_config)
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled Module {}/{}", obj.namespace.unwrap_or_default(), obj.name),
                    Err(e) => error!("Controller error for Module: {}", e),
                }
            })
            .await;

        warn!("Module watcher stream ended");
        Ok(())
    }
}
