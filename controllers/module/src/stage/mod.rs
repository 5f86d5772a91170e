//! Build and sign stages of the per-kernel pipeline.
//!
//! Both stages run as Kubernetes Jobs and share the same contract: decide
//! whether the stage is needed, drive its Job towards completion, and clean
//! up Jobs that already succeeded.

mod build;
mod images;
mod jobs;
mod sign;

pub use build::BuildManager;
pub use images::ImageChecker;
pub use jobs::JobHelper;
pub use sign::SignManager;

use crate::api::ModuleLoaderData;
use crate::error::ControllerError;
use async_trait::async_trait;
use crds::labels;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::fmt;

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Build,
    Sign,
}

impl Stage {
    /// Value of the job-type label.
    pub fn job_type(self) -> &'static str {
        match self {
            Stage::Build => labels::JOB_TYPE_BUILD,
            Stage::Sign => labels::JOB_TYPE_SIGN,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_type())
    }
}

/// Result of one synchronization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Failed,
    InProgress,
    NotNeeded,
}

impl StageOutcome {
    /// Whether the pipeline may move on to the next stage.
    pub fn is_done(self) -> bool {
        matches!(self, StageOutcome::Completed | StageOutcome::NotNeeded)
    }
}

/// One stage of the pipeline.
///
/// `should_sync` and `sync` must leave the cluster untouched when nothing
/// changed, since the pipeline reruns from the first stage on every pass.
#[async_trait]
pub trait StageManager: Send + Sync {
    fn stage(&self) -> Stage;

    async fn should_sync(&self, mld: &ModuleLoaderData) -> Result<bool, ControllerError>;

    async fn sync(&self, mld: &ModuleLoaderData, owner: &OwnerReference) -> Result<StageOutcome, ControllerError>;

    /// Deletes succeeded Jobs of this Module and returns their names.
    async fn garbage_collect(
        &self,
        module_name: &str,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<Vec<String>, ControllerError>;
}
