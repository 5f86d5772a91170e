//! In-cluster image builds.

use super::images::ImageChecker;
use super::jobs::{JobHelper, job_labels};
use super::{Stage, StageManager, StageOutcome};
use crate::api::ModuleLoaderData;
use crate::error::ControllerError;
use async_trait::async_trait;
use crds::Build;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, KeyToPath, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::debug;

const DOCKERFILE_DIR: &str = "/workspace";

/// Builds module images with kaniko Jobs.
pub struct BuildManager {
    jobs: JobHelper,
    images: ImageChecker,
    build_image: String,
}

impl std::fmt::Debug for BuildManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildManager")
            .field("build_image", &self.build_image)
            .finish_non_exhaustive()
    }
}

impl BuildManager {
    pub fn new(jobs: JobHelper, images: ImageChecker, build_image: impl Into<String>) -> Self {
        Self {
            jobs,
            images,
            build_image: build_image.into(),
        }
    }

    /// Renders the build Job for `mld`.
    pub fn make_job(&self, mld: &ModuleLoaderData, build: &Build, owner: &OwnerReference) -> Job {
        let labels = job_labels(&mld.name, &mld.kernel_version, Stage::Build);

        let mut args = vec![
            format!("--dockerfile={}/Dockerfile", DOCKERFILE_DIR),
            format!("--context=dir://{}", DOCKERFILE_DIR),
            format!("--destination={}", mld.build_output_image()),
            format!("--build-arg=KERNEL_VERSION={}", mld.kernel_version),
            format!("--build-arg=KERNEL_FULL_VERSION={}", mld.kernel_version),
            format!("--build-arg=MOD_NAME={}", mld.name),
            format!("--build-arg=MOD_NAMESPACE={}", mld.namespace),
        ];
        args.extend(
            build
                .build_args
                .iter()
                .map(|arg| format!("--build-arg={}={}", arg.name, arg.value)),
        );
        if build.base_image_registry_tls.insecure {
            args.push("--insecure-pull".to_string());
        }
        if build.base_image_registry_tls.insecure_skip_tls_verify {
            args.push("--skip-tls-verify-pull".to_string());
        }

        let mut volumes = vec![Volume {
            name: "dockerfile".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: build.dockerfile_config_map.clone(),
                items: Some(vec![KeyToPath {
                    key: "dockerfile".to_string(),
                    path: "Dockerfile".to_string(),
                    mode: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut mounts = vec![VolumeMount {
            name: "dockerfile".to_string(),
            mount_path: DOCKERFILE_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }];

        for secret in &build.secrets {
            let volume_name = format!("secret-{}", secret);
            volumes.push(secret_volume(&volume_name, secret, None));
            mounts.push(VolumeMount {
                name: volume_name,
                mount_path: format!("/run/secrets/{}", secret),
                read_only: Some(true),
                ..Default::default()
            });
        }

        if let Some(pull_secret) = &mld.image_repo_secret {
            volumes.push(secret_volume(
                "registry-auth",
                pull_secret,
                Some((".dockerconfigjson", "config.json")),
            ));
            mounts.push(VolumeMount {
                name: "registry-auth".to_string(),
                mount_path: "/kaniko/.docker".to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        Job {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-build-", mld.name)),
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
                            name: "kaniko".to_string(),
                            image: Some(self.build_image.clone()),
                            args: Some(args),
                            volume_mounts: Some(mounts),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
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

/// Secret volume, optionally projecting a single key to `path`.
pub(super) fn secret_volume(volume_name: &str, secret: &str, item: Option<(&str, &str)>) -> Volume {
    Volume {
        name: volume_name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            items: item.map(|(key, path)| {
                vec![KeyToPath {
                    key: key.to_string(),
                    path: path.to_string(),
                    mode: None,
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl StageManager for BuildManager {
    fn stage(&self) -> Stage {
        Stage::Build
    }

    async fn should_sync(&self, mld: &ModuleLoaderData) -> Result<bool, ControllerError> {
        if mld.build.is_none() {
            return Ok(false);
        }
        let image = mld.build_output_image();
        let exists = self.images.image_exists(mld, &image).await?;
        debug!("Build output {} for {}/{} exists: {}", image, mld.namespace, mld.name, exists);
        Ok(!exists)
    }

    async fn sync(&self, mld: &ModuleLoaderData, owner: &OwnerReference) -> Result<StageOutcome, ControllerError> {
        let Some(build) = &mld.build else {
            return Ok(StageOutcome::NotNeeded);
        };
        let job = self.make_job(mld, build, owner);
        self.jobs.sync(mld, Stage::Build, job).await
    }

    async fn garbage_collect(
        &self,
        module_name: &str,
        namespace: &str,
        _owner: &OwnerReference,
    ) -> Result<Vec<String>, ControllerError> {
        self.jobs.garbage_collect(module_name, namespace, Stage::Build).await
    }
}
