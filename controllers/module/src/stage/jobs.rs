//! Job bookkeeping shared by the build and sign stages.

use super::{Stage, StageOutcome};
use crate::api::ModuleLoaderData;
use crate::cluster::ClusterApi;
use crate::error::{ControllerError, ResultExt};
use crds::labels;
use k8s_openapi::api::batch::v1::Job;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Finds, creates, replaces and collects stage Jobs.
#[derive(Clone)]
pub struct JobHelper {
    cluster: Arc<dyn ClusterApi>,
}

impl std::fmt::Debug for JobHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHelper").finish_non_exhaustive()
    }
}

/// Labels identifying the Job of one stage for one kernel.
pub fn job_labels(module_name: &str, kernel_version: &str, stage: Stage) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MODULE_NAME.to_string(), module_name.to_string()),
        (labels::KERNEL_VERSION.to_string(), kernel_version.to_string()),
        (labels::JOB_TYPE.to_string(), stage.job_type().to_string()),
    ])
}

/// SHA-256 over the JSON encoding of a Job spec.
pub fn job_spec_hash(job: &Job) -> Result<String, ControllerError> {
    let bytes = serde_json::to_vec(&job.spec)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Maps a Job's status to a stage outcome.
pub fn job_outcome(job: &Job) -> StageOutcome {
    let Some(status) = &job.status else {
        return StageOutcome::InProgress;
    };
    let condition = |kind: &str| {
        status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == kind && c.status == "True")
    };
    if status.succeeded.unwrap_or(0) > 0 || condition("Complete") {
        StageOutcome::Completed
    } else if condition("Failed") {
        StageOutcome::Failed
    } else {
        StageOutcome::InProgress
    }
}

impl JobHelper {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    async fn find_job(&self, mld: &ModuleLoaderData, stage: Stage) -> Result<Option<Job>, ControllerError> {
        let selector = job_labels(&mld.name, &mld.kernel_version, stage);
        let mut jobs = self
            .cluster
            .list_jobs(&mld.namespace, &selector)
            .await
            .with_context(|| format!("failed to list {} jobs of {}/{}", stage, mld.namespace, mld.name))?;
        match jobs.len() {
            0 | 1 => Ok(jobs.pop()),
            n => Err(ControllerError::InvalidState(format!(
                "found {} {} jobs for Module {}/{} and kernel {}",
                n, stage, mld.namespace, mld.name, mld.kernel_version
            ))),
        }
    }

    /// Drives the stage Job towards `template`.
    ///
    /// A Job whose hash annotation matches the template reports its status;
    /// a Job rendered from an older template is replaced.
    pub async fn sync(
        &self,
        mld: &ModuleLoaderData,
        stage: Stage,
        mut template: Job,
    ) -> Result<StageOutcome, ControllerError> {
        let hash = job_spec_hash(&template)?;
        template
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(labels::LAST_HASH_ANNOTATION.to_string(), hash.clone());

        let existing = self.find_job(mld, stage).await?;
        if let Some(job) = existing {
            let job_name = job.metadata.name.clone().unwrap_or_default();
            let current_hash = job
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(labels::LAST_HASH_ANNOTATION));
            if current_hash == Some(&hash) {
                let outcome = job_outcome(&job);
                debug!("{} job {}/{} is {:?}", stage, mld.namespace, job_name, outcome);
                return Ok(outcome);
            }
            info!(
                "{} job {}/{} is outdated for kernel {}, recreating it",
                stage, mld.namespace, job_name, mld.kernel_version
            );
            self.cluster
                .delete_job(&mld.namespace, &job_name)
                .await
                .with_context(|| format!("failed to delete outdated {} job {}/{}", stage, mld.namespace, job_name))?;
        }

        let created = self
            .cluster
            .create_job(&template)
            .await
            .with_context(|| format!("failed to create {} job for {}/{}", stage, mld.namespace, mld.name))?;
        info!(
            "Created {} job {}/{} for kernel {}",
            stage,
            mld.namespace,
            created.metadata.name.as_deref().unwrap_or_default(),
            mld.kernel_version
        );
        Ok(StageOutcome::InProgress)
    }

    /// Deletes every succeeded Job of the Module for `stage`.
    pub async fn garbage_collect(
        &self,
        module_name: &str,
        namespace: &str,
        stage: Stage,
    ) -> Result<Vec<String>, ControllerError> {
        let selector = BTreeMap::from([
            (labels::MODULE_NAME.to_string(), module_name.to_string()),
            (labels::JOB_TYPE.to_string(), stage.job_type().to_string()),
        ]);
        let jobs = self.cluster.list_jobs(namespace, &selector).await?;

        let mut deleted = Vec::new();
        for job in jobs {
            let succeeded = job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0);
            if succeeded == 0 {
                continue;
            }
            let Some(name) = job.metadata.name else {
                continue;
            };
            self.cluster.delete_job(namespace, &name).await?;
            deleted.push(name);
        }
        Ok(deleted)
    }
}
