//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the Module
//! reconciler to its collaborators and runs the Module watcher next to the
//! metrics and health server.

use crate::cluster::{ClusterApi, KubeCluster};
use crate::config::Config;
use crate::daemonset::DaemonSetCreator;
use crate::error::ControllerError;
use crate::kernel::KernelMapper;
use crate::metrics::PrometheusMetrics;
use crate::reconciler::Reconciler;
use crate::server;
use crate::stage::{BuildManager, ImageChecker, JobHelper, SignManager};
use crate::status::StatusUpdater;
use crate::watcher::Watcher;
use crds::Module;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use registry_client::RegistryClient;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main controller for kernel module management.
pub struct Controller {
    module_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing Module Controller");

        let kube_client = Client::try_default().await?;
        let namespace = config.watch_namespace.as_deref();

        let cluster: Arc<dyn ClusterApi> =
            Arc::new(KubeCluster::new(kube_client.clone(), config.watch_namespace.clone()));
        let registry = Arc::new(RegistryClient::new(config.registry_insecure, false));
        let images = ImageChecker::new(cluster.clone(), registry);
        let jobs = JobHelper::new(cluster.clone());
        let metrics = Arc::new(PrometheusMetrics::new()?);

        let reconciler = Reconciler::new(
            cluster.clone(),
            Arc::new(KernelMapper::new()),
            Arc::new(BuildManager::new(jobs.clone(), images.clone(), config.build_image.clone())),
            Arc::new(SignManager::new(jobs, images, config.sign_image.clone())),
            Arc::new(DaemonSetCreator::new(
                cluster.clone(),
                config.kernel_label.clone(),
                config.worker_image_pull_policy.clone(),
            )),
            metrics.clone(),
            Arc::new(StatusUpdater::new(cluster)),
        )
        .with_backoff(config.requeue_min_seconds, config.requeue_max_seconds);

        let watcher = Watcher::new(
            Arc::new(reconciler),
            scoped_api::<Module>(&kube_client, namespace),
            scoped_api::<DaemonSet>(&kube_client, namespace),
            scoped_api::<Job>(&kube_client, namespace),
            Api::<Node>::all(kube_client),
            config.concurrency,
        );

        let module_watcher = tokio::spawn(async move { watcher.watch_modules().await });
        let metrics_addr = config.metrics_addr;
        let metrics_server = tokio::spawn(async move { server::serve(metrics_addr, metrics).await });

        Ok(Self {
            module_watcher,
            metrics_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Module Controller running");

        // Both tasks run forever; either one exiting stops the controller.
        tokio::select! {
            result = &mut self.module_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Module watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Module watcher error: {}", e)))?;
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Watch(format!("Metrics server panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
