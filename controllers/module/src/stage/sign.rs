//! Module signing for secure boot.

use super::build::secret_volume;
use super::images::ImageChecker;
use super::jobs::{JobHelper, job_labels};
use super::{Stage, StageManager, StageOutcome};
use crate::api::ModuleLoaderData;
use crate::error::ControllerError;
use async_trait::async_trait;
use crds::Sign;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, PodSpec, PodTemplateSpec, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::debug;

const KEY_DIR: &str = "/signingkey";
const CERT_DIR: &str = "/signingcert";

/// Signs kernel modules inside the unsigned image and pushes the signed image.
pub struct SignManager {
    jobs: JobHelper,
    images: ImageChecker,
    sign_image: String,
}

impl std::fmt::Debug for SignManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignManager")
            .field("sign_image", &self.sign_image)
            .finish_non_exhaustive()
    }
}

impl SignManager {
    pub fn new(jobs: JobHelper, images: ImageChecker, sign_image: impl Into<String>) -> Self {
        Self {
            jobs,
            images,
            sign_image: sign_image.into(),
        }
    }

    pub fn make_job(&self, mld: &ModuleLoaderData, sign: &Sign, owner: &OwnerReference) -> Job {
        let labels = job_labels(&mld.name, &mld.kernel_version, Stage::Sign);

        let args = vec![
            "-unsignedimage".to_string(),
            mld.unsigned_image(),
            "-signedimage".to_string(),
            mld.container_image.clone(),
            "-key".to_string(),
            format!("{}/key.priv", KEY_DIR),
            "-cert".to_string(),
            format!("{}/cert.pem", CERT_DIR),
            "-filestosign".to_string(),
            sign.files_to_sign.join(":"),
        ];

        let volumes = vec![
            secret_volume("signing-key", &sign.key_secret, Some(("key", "key.priv"))),
            secret_volume("signing-cert", &sign.cert_secret, Some(("cert", "cert.pem"))),
        ];
        let mounts = vec![
            VolumeMount {
                name: "signing-key".to_string(),
                mount_path: KEY_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "signing-cert".to_string(),
                mount_path: CERT_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        Job {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-sign-", mld.name)),
                namespace: Some(mld.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                completions: Some(1),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "signimage".to_string(),
                            image: Some(self.sign_image.clone()),
                            args: Some(args),
                            volume_mounts: Some(mounts),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
                        image_pull_secrets: mld
                            .image_repo_secret
                            .as_ref()
                            .map(|name| vec![LocalObjectReference { name: name.clone() }]),
                        node_selector: (!mld.selector.is_empty()).then(|| mld.selector.clone()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl StageManager for SignManager {
    fn stage(&self) -> Stage {
        Stage::Sign
    }

    async fn should_sync(&self, mld: &ModuleLoaderData) -> Result<bool, ControllerError> {
        if mld.sign.is_none() {
            return Ok(false);
        }
        let exists = self.images.image_exists(mld, &mld.container_image).await?;
        debug!("Signed image {} exists: {}", mld.container_image, exists);
        Ok(!exists)
    }

    async fn sync(&self, mld: &ModuleLoaderData, owner: &OwnerReference) -> Result<StageOutcome, ControllerError> {
        let Some(sign) = &mld.sign else {
            return Ok(StageOutcome::NotNeeded);
        };
        let job = self.make_job(mld, sign, owner);
        self.jobs.sync(mld, Stage::Sign, job).await
    }

    async fn garbage_collect(
        &self,
        module_name: &str,
        namespace: &str,
        _owner: &OwnerReference,
    ) -> Result<Vec<String>, ControllerError> {
        self.jobs.garbage_collect(module_name, namespace, Stage::Sign).await
    }
}
