//! Kubernetes access layer.
//!
//! Every read and write the controller performs against the API server goes
//! through [`ClusterApi`], so the reconciler and its collaborators can run
//! against the in-memory cluster in `test_utils` as well as a real one.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{Module, ModuleStatus};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// Cluster operations used by the controller.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_module(&self, namespace: &str, name: &str) -> Result<Module, ControllerError>;

    /// All Modules visible to the controller.
    async fn list_modules(&self) -> Result<Vec<Module>, ControllerError>;

    /// Nodes carrying every label in `selector`.
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>, ControllerError>;

    /// Secret holding registry credentials; `None` when it does not exist.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ControllerError>;

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>, ControllerError>;

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet, ControllerError>;

    /// Replaces a DaemonSet; fails with a conflict when its `resourceVersion` is stale.
    async fn replace_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet, ControllerError>;

    async fn list_daemon_sets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DaemonSet>, ControllerError>;

    /// Deletes a DaemonSet; deleting an absent one succeeds.
    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<(), ControllerError>;

    async fn list_jobs(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Job>, ControllerError>;

    async fn create_job(&self, job: &Job) -> Result<Job, ControllerError>;

    /// Deletes a Job and its pods; deleting an absent one succeeds.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ControllerError>;

    async fn patch_module_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ModuleStatus,
    ) -> Result<(), ControllerError>;
}

/// Renders a label map as an equality-based label selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`ClusterApi`] backed by a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    watch_namespace: Option<String>,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("watch_namespace", &self.watch_namespace)
            .finish_non_exhaustive()
    }
}

impl KubeCluster {
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self {
        Self { client, watch_namespace }
    }

    fn modules(&self, namespace: &str) -> Api<Module> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn daemon_sets(&self, namespace: &str) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of(meta: &ObjectMeta) -> Result<&str, ControllerError> {
    meta.namespace
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidState(format!("object {:?} has no namespace", meta.name)))
}

fn ignore_not_found(result: Result<(), ControllerError>) -> Result<(), ControllerError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_module(&self, namespace: &str, name: &str) -> Result<Module, ControllerError> {
        self.modules(namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("Module {}/{}", namespace, name)))
    }

    async fn list_modules(&self) -> Result<Vec<Module>, ControllerError> {
        let api: Api<Module> = match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>, ControllerError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&label_selector(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>, ControllerError> {
        Ok(self.daemon_sets(namespace).get_opt(name).await?)
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet, ControllerError> {
        let ns = namespace_of(&daemon_set.metadata)?;
        Ok(self.daemon_sets(ns).create(&PostParams::default(), daemon_set).await?)
    }

    async fn replace_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet, ControllerError> {
        let ns = namespace_of(&daemon_set.metadata)?;
        let name = daemon_set
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidState("DaemonSet has no name".to_string()))?;
        Ok(self.daemon_sets(ns).replace(name, &PostParams::default(), daemon_set).await?)
    }

    async fn list_daemon_sets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DaemonSet>, ControllerError> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.daemon_sets(namespace).list(&params).await?.items)
    }

    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        debug!("Deleting DaemonSet {}/{}", namespace, name);
        let result = self
            .daemon_sets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(ControllerError::from);
        ignore_not_found(result)
    }

    async fn list_jobs(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Job>, ControllerError> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.jobs(namespace).list(&params).await?.items)
    }

    async fn create_job(&self, job: &Job) -> Result<Job, ControllerError> {
        let ns = namespace_of(&job.metadata)?;
        Ok(self.jobs(ns).create(&PostParams::default(), job).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        debug!("Deleting Job {}/{}", namespace, name);
        let result = self
            .jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(ControllerError::from);
        ignore_not_found(result)
    }

    async fn patch_module_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ModuleStatus,
    ) -> Result<(), ControllerError> {
        let patch = json!({ "status": status });
        self.modules(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector_is_sorted_and_comma_joined() {
        let mut labels = BTreeMap::new();
        labels.insert("b".to_string(), "2".to_string());
        labels.insert("a".to_string(), "1".to_string());
        assert_eq!(label_selector(&labels), "a=1,b=2");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }
}
