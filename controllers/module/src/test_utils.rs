//! Test utilities for the Module Controller
//!
//! In-memory stand-ins for the cluster and for every reconciler collaborator,
//! plus builders for the objects tests need.

use crate::api::ModuleLoaderData;
use crate::cluster::ClusterApi;
use crate::error::ControllerError;
use crate::kernel::{KernelMapper, ModuleLoaderDataFactory};
use crate::metrics::Metrics;
use crate::stage::{Stage, StageManager, StageOutcome};
use async_trait::async_trait;
use crds::{Module, ModuleSpec, ModuleStatus};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetUpdateStrategy};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus, NodeSystemInfo, Secret, Taint};
use k8s_openapi::ByteString;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

pub const KERNEL_LABEL: &str = "feature.node.kubernetes.io/kernel-version.full";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// In-memory API server.
///
/// Writes bump a `resourceVersion` counter and are recorded in `writes`, so
/// tests can assert both the stored state and that nothing was written.
#[derive(Default)]
pub struct MockCluster {
    pub modules: Mutex<BTreeMap<Key, Module>>,
    pub nodes: Mutex<Vec<Node>>,
    pub secrets: Mutex<BTreeMap<Key, Secret>>,
    pub daemon_sets: Mutex<BTreeMap<Key, DaemonSet>>,
    pub jobs: Mutex<BTreeMap<Key, Job>>,
    pub writes: Mutex<Vec<String>>,
    resource_version: AtomicU64,
    generated_names: AtomicUsize,
    pub fail_list_nodes: AtomicBool,
    pub fail_list_modules: AtomicBool,
    pub fail_status_patch: AtomicBool,
    /// Number of upcoming DaemonSet replaces to reject with a conflict
    pub replace_conflicts: AtomicUsize,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn record(&self, write: String) {
        self.writes.lock().unwrap().push(write);
    }

    pub fn add_module(&self, module: Module) {
        let ns = module.metadata.namespace.clone().unwrap_or_default();
        let name = module.metadata.name.clone().unwrap_or_default();
        self.modules.lock().unwrap().insert(key(&ns, &name), module);
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn clear_nodes(&self) {
        self.nodes.lock().unwrap().clear();
    }

    /// Stores a `kubernetes.io/dockerconfigjson` Secret.
    pub fn add_pull_secret(&self, namespace: &str, name: &str, docker_config: &str) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            data: Some(BTreeMap::from([(
                ".dockerconfigjson".to_string(),
                ByteString(docker_config.as_bytes().to_vec()),
            )])),
            ..Default::default()
        };
        self.secrets.lock().unwrap().insert(key(namespace, name), secret);
    }

    pub fn add_daemon_set(&self, mut ds: DaemonSet) {
        ds.metadata.resource_version = Some(self.next_resource_version());
        let ns = ds.metadata.namespace.clone().unwrap_or_default();
        let name = ds.metadata.name.clone().unwrap_or_default();
        self.daemon_sets.lock().unwrap().insert(key(&ns, &name), ds);
    }

    pub fn add_job(&self, job: Job) {
        let ns = job.metadata.namespace.clone().unwrap_or_default();
        let name = job.metadata.name.clone().unwrap_or_default();
        self.jobs.lock().unwrap().insert(key(&ns, &name), job);
    }

    /// Fills in what an API server defaults on a stored DaemonSet.
    pub fn apply_server_defaults(&self, namespace: &str, name: &str) {
        let mut daemon_sets = self.daemon_sets.lock().unwrap();
        let ds = daemon_sets.get_mut(&key(namespace, name)).expect("daemonset exists");
        let spec = ds.spec.get_or_insert_with(Default::default);
        spec.revision_history_limit.get_or_insert(10);
        spec.update_strategy.get_or_insert_with(|| DaemonSetUpdateStrategy {
            type_: Some("RollingUpdate".to_string()),
            ..Default::default()
        });
        let pod = spec.template.spec.get_or_insert_with(Default::default);
        pod.dns_policy.get_or_insert_with(|| "ClusterFirst".to_string());
        pod.restart_policy.get_or_insert_with(|| "Always".to_string());
        pod.scheduler_name.get_or_insert_with(|| "default-scheduler".to_string());
        pod.termination_grace_period_seconds.get_or_insert(30);
        pod.security_context.get_or_insert_with(Default::default);
        if pod.service_account_name.is_some() {
            pod.service_account = pod.service_account_name.clone();
        }
        for container in &mut pod.containers {
            container.image_pull_policy.get_or_insert_with(|| "IfNotPresent".to_string());
            container
                .termination_message_path
                .get_or_insert_with(|| "/dev/termination-log".to_string());
            container.termination_message_policy.get_or_insert_with(|| "File".to_string());
        }
        ds.metadata.resource_version = Some(self.next_resource_version());
    }

    pub fn daemon_set(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        self.daemon_sets.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    pub fn daemon_set_names(&self) -> Vec<String> {
        self.daemon_sets.lock().unwrap().keys().map(|(_, n)| n.clone()).collect()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.lock().unwrap().keys().map(|(_, n)| n.clone()).collect()
    }

    pub fn module_status(&self, namespace: &str, name: &str) -> Option<ModuleStatus> {
        self.modules
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .and_then(|m| m.status.clone())
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    /// Sets `succeeded` or a `Failed` condition on a stored Job.
    pub fn finish_job(&self, namespace: &str, name: &str, succeeded: bool) {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&key(namespace, name)).expect("job exists");
        job.status = Some(job_status(succeeded));
    }
}

pub fn job_status(succeeded: bool) -> JobStatus {
    if succeeded {
        JobStatus {
            succeeded: Some(1),
            ..Default::default()
        }
    } else {
        JobStatus {
            failed: Some(1),
            conditions: Some(vec![k8s_openapi::api::batch::v1::JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_module(&self, namespace: &str, name: &str) -> Result<Module, ControllerError> {
        self.modules
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(format!("Module {}/{}", namespace, name)))
    }

    async fn list_modules(&self) -> Result<Vec<Module>, ControllerError> {
        if self.fail_list_modules.load(Ordering::SeqCst) {
            return Err(ControllerError::InvalidState("injected list modules failure".to_string()));
        }
        Ok(self.modules.lock().unwrap().values().cloned().collect())
    }

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>, ControllerError> {
        if self.fail_list_nodes.load(Ordering::SeqCst) {
            return Err(ControllerError::InvalidState("injected list nodes failure".to_string()));
        }
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| labels_match(n.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ControllerError> {
        Ok(self.secrets.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>, ControllerError> {
        Ok(self.daemon_set(namespace, name))
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet, ControllerError> {
        let ns = daemon_set.metadata.namespace.clone().unwrap_or_default();
        let name = daemon_set.metadata.name.clone().unwrap_or_default();
        let mut daemon_sets = self.daemon_sets.lock().unwrap();
        if daemon_sets.contains_key(&key(&ns, &name)) {
            return Err(ControllerError::Conflict(format!("DaemonSet {}/{} already exists", ns, name)));
        }
        let mut stored = daemon_set.clone();
        stored.metadata.resource_version = Some(self.next_resource_version());
        daemon_sets.insert(key(&ns, &name), stored.clone());
        drop(daemon_sets);
        self.record(format!("create daemonset {}/{}", ns, name));
        Ok(stored)
    }

    async fn replace_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet, ControllerError> {
        let ns = daemon_set.metadata.namespace.clone().unwrap_or_default();
        let name = daemon_set.metadata.name.clone().unwrap_or_default();
        if self
            .replace_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            // Someone else wrote in between: bump the stored version.
            if let Some(current) = self.daemon_sets.lock().unwrap().get_mut(&key(&ns, &name)) {
                current.metadata.resource_version = Some(self.next_resource_version());
            }
            return Err(ControllerError::Conflict(format!("DaemonSet {}/{} was modified", ns, name)));
        }
        let mut daemon_sets = self.daemon_sets.lock().unwrap();
        let current = daemon_sets
            .get(&key(&ns, &name))
            .ok_or_else(|| ControllerError::NotFound(format!("DaemonSet {}/{}", ns, name)))?;
        if current.metadata.resource_version != daemon_set.metadata.resource_version {
            return Err(ControllerError::Conflict(format!("DaemonSet {}/{} was modified", ns, name)));
        }
        let mut stored = daemon_set.clone();
        stored.metadata.resource_version = Some(self.next_resource_version());
        daemon_sets.insert(key(&ns, &name), stored.clone());
        drop(daemon_sets);
        self.record(format!("replace daemonset {}/{}", ns, name));
        Ok(stored)
    }

    async fn list_daemon_sets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DaemonSet>, ControllerError> {
        Ok(self
            .daemon_sets
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), ds)| ns == namespace && labels_match(ds.metadata.labels.as_ref(), labels))
            .map(|(_, ds)| ds.clone())
            .collect())
    }

    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        if self.daemon_sets.lock().unwrap().remove(&key(namespace, name)).is_some() {
            self.record(format!("delete daemonset {}/{}", namespace, name));
        }
        Ok(())
    }

    async fn list_jobs(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Job>, ControllerError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), job)| ns == namespace && labels_match(job.metadata.labels.as_ref(), labels))
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn create_job(&self, job: &Job) -> Result<Job, ControllerError> {
        let ns = job.metadata.namespace.clone().unwrap_or_default();
        let mut stored = job.clone();
        if stored.metadata.name.is_none() {
            let suffix = self.generated_names.fetch_add(1, Ordering::SeqCst);
            let prefix = stored.metadata.generate_name.clone().unwrap_or_default();
            stored.metadata.name = Some(format!("{}{}", prefix, suffix));
        }
        let name = stored.metadata.name.clone().unwrap_or_default();
        stored.metadata.resource_version = Some(self.next_resource_version());
        self.jobs.lock().unwrap().insert(key(&ns, &name), stored.clone());
        self.record(format!("create job {}/{}", ns, name));
        Ok(stored)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        if self.jobs.lock().unwrap().remove(&key(namespace, name)).is_some() {
            self.record(format!("delete job {}/{}", namespace, name));
        }
        Ok(())
    }

    async fn patch_module_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ModuleStatus,
    ) -> Result<(), ControllerError> {
        if self.fail_status_patch.load(Ordering::SeqCst) {
            return Err(ControllerError::InvalidState("injected status patch failure".to_string()));
        }
        let mut modules = self.modules.lock().unwrap();
        let module = modules
            .get_mut(&key(namespace, name))
            .ok_or_else(|| ControllerError::NotFound(format!("Module {}/{}", namespace, name)))?;
        module.status = Some(status.clone());
        drop(modules);
        self.record(format!("status module {}/{}", namespace, name));
        Ok(())
    }
}

/// Resolver that counts calls and delegates to [`KernelMapper`].
#[derive(Default)]
pub struct CountingFactory {
    pub calls: Mutex<Vec<String>>,
}

impl CountingFactory {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ModuleLoaderDataFactory for CountingFactory {
    fn from_module(&self, module: &Module, kernel_version: &str) -> Result<ModuleLoaderData, ControllerError> {
        self.calls.lock().unwrap().push(kernel_version.to_string());
        KernelMapper::new().from_module(module, kernel_version)
    }
}

/// Scriptable stage.
pub struct MockStage {
    stage: Stage,
    pub needs_sync: AtomicBool,
    pub outcome: Mutex<StageOutcome>,
    /// Outcomes overriding `outcome` for single kernel versions
    pub kernel_outcomes: Mutex<HashMap<String, StageOutcome>>,
    pub sync_calls: Mutex<Vec<String>>,
    pub gc_calls: AtomicUsize,
    pub gc_deleted: Mutex<Vec<String>>,
    pub fail_should_sync: AtomicBool,
    pub fail_gc: AtomicBool,
}

impl MockStage {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            needs_sync: AtomicBool::new(false),
            outcome: Mutex::new(StageOutcome::Completed),
            kernel_outcomes: Mutex::new(HashMap::new()),
            sync_calls: Mutex::new(Vec::new()),
            gc_calls: AtomicUsize::new(0),
            gc_deleted: Mutex::new(Vec::new()),
            fail_should_sync: AtomicBool::new(false),
            fail_gc: AtomicBool::new(false),
        }
    }

    /// Stage that needs syncing and reports `outcome`.
    pub fn with_outcome(stage: Stage, outcome: StageOutcome) -> Self {
        let mock = Self::new(stage);
        mock.needs_sync.store(true, Ordering::SeqCst);
        *mock.outcome.lock().unwrap() = outcome;
        mock
    }

    /// Reports `outcome` for `kernel_version` only.
    pub fn set_kernel_outcome(&self, kernel_version: &str, outcome: StageOutcome) {
        self.kernel_outcomes
            .lock()
            .unwrap()
            .insert(kernel_version.to_string(), outcome);
    }

    pub fn sync_calls(&self) -> Vec<String> {
        self.sync_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageManager for MockStage {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn should_sync(&self, _mld: &ModuleLoaderData) -> Result<bool, ControllerError> {
        if self.fail_should_sync.load(Ordering::SeqCst) {
            return Err(ControllerError::InvalidState(format!("injected {} failure", self.stage)));
        }
        Ok(self.needs_sync.load(Ordering::SeqCst))
    }

    async fn sync(&self, mld: &ModuleLoaderData, _owner: &OwnerReference) -> Result<StageOutcome, ControllerError> {
        self.sync_calls.lock().unwrap().push(mld.kernel_version.clone());
        let outcome = self.kernel_outcomes.lock().unwrap().get(&mld.kernel_version).copied();
        Ok(outcome.unwrap_or(*self.outcome.lock().unwrap()))
    }

    async fn garbage_collect(
        &self,
        _module_name: &str,
        _namespace: &str,
        _owner: &OwnerReference,
    ) -> Result<Vec<String>, ControllerError> {
        self.gc_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_gc.load(Ordering::SeqCst) {
            return Err(ControllerError::InvalidState(format!("injected {} gc failure", self.stage)));
        }
        Ok(self.gc_deleted.lock().unwrap().clone())
    }
}

/// Metrics sink that keeps the last value of every gauge.
#[derive(Default)]
pub struct MockMetrics {
    pub gauges: Mutex<HashMap<&'static str, usize>>,
    pub modprobe_args: Mutex<HashMap<String, String>>,
}

impl MockMetrics {
    pub fn gauge(&self, name: &'static str) -> Option<usize> {
        self.gauges.lock().unwrap().get(name).copied()
    }
}

impl Metrics for MockMetrics {
    fn set_kmm_modules_num(&self, value: usize) {
        self.gauges.lock().unwrap().insert("modules", value);
    }

    fn set_kmm_in_cluster_build_num(&self, value: usize) {
        self.gauges.lock().unwrap().insert("build", value);
    }

    fn set_kmm_in_cluster_sign_num(&self, value: usize) {
        self.gauges.lock().unwrap().insert("sign", value);
    }

    fn set_kmm_device_plugin_num(&self, value: usize) {
        self.gauges.lock().unwrap().insert("device_plugin", value);
    }

    fn set_kmm_modprobe_args(&self, name: &str, namespace: &str, args: &str) {
        self.modprobe_args
            .lock()
            .unwrap()
            .insert(format!("{}/{}", namespace, name), args.to_string());
    }

    fn remove_kmm_modprobe_args(&self, name: &str, namespace: &str) {
        let mut args = self.modprobe_args.lock().unwrap();
        args.remove(&format!("{}/{}", namespace, name));
        args.remove(&format!("raw {}/{}", namespace, name));
    }

    fn set_kmm_modprobe_raw_args(&self, name: &str, namespace: &str, args: &str) {
        self.modprobe_args
            .lock()
            .unwrap()
            .insert(format!("raw {}/{}", namespace, name), args.to_string());
    }
}

/// Node with a kernel version and labels.
pub fn node(name: &str, kernel_version: &str, labels: &[(&str, &str)]) -> Node {
    let mut all_labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    all_labels.insert(KERNEL_LABEL.to_string(), kernel_version.to_string());
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(all_labels),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            node_info: Some(NodeSystemInfo {
                kernel_version: kernel_version.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

/// Adds a taint to a node.
pub fn tainted(mut node: Node, effect: &str) -> Node {
    node.spec.get_or_insert_with(NodeSpec::default).taints = Some(vec![Taint {
        key: "example.com/maintenance".to_string(),
        effect: effect.to_string(),
        ..Default::default()
    }]);
    node
}

/// Module selecting `worker=true` nodes with a default image and version.
pub fn module(name: &str, namespace: &str, version: &str) -> Module {
    let mut spec = ModuleSpec::default();
    spec.selector.insert("worker".to_string(), "true".to_string());
    spec.module_loader.container.container_image = Some(format!("quay.io/org/{}:${{KERNEL_FULL_VERSION}}", name));
    spec.module_loader.container.version = Some(version.to_string());
    spec.module_loader.container.modprobe.module_name = name.to_string();
    let mut module = Module::new(name, spec);
    module.metadata.namespace = Some(namespace.to_string());
    module.metadata.uid = Some(format!("uid-{}", name));
    module
}
