//! Helper functions for common reconciliation patterns
//!
//! Deterministic workload naming and the create-or-patch upsert used for
//! every DaemonSet the controller owns.

use crate::cluster::ClusterApi;
use crate::error::ControllerError;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Attempts made by [`create_or_patch_daemon_set`] before giving up on conflicts.
pub const MAX_CONFLICT_RETRIES: usize = 3;

/// What an upsert did to the stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

/// Stable hash of named fields.
///
/// The fields go through a sorted map before encoding, so the result does not
/// depend on the order they are passed in.
pub fn hash_fields(fields: &[(&str, &str)]) -> Result<u64, ControllerError> {
    let canonical: BTreeMap<&str, &str> = fields.iter().copied().collect();
    let encoded = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&encoded);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(prefix))
}

/// `<module>-<hash(kernel version, module version)>`
pub fn module_loader_daemon_set_name(
    module_name: &str,
    kernel_version: &str,
    module_version: &str,
) -> Result<String, ControllerError> {
    let hash = hash_fields(&[("kernelVersion", kernel_version), ("moduleVersion", module_version)])?;
    Ok(format!("{}-{:x}", module_name, hash))
}

/// `<module>-device-plugin-<hash(module version)>`
pub fn device_plugin_daemon_set_name(module_name: &str, module_version: &str) -> Result<String, ControllerError> {
    let hash = hash_fields(&[("moduleVersion", module_version)])?;
    Ok(format!("{}-device-plugin-{:x}", module_name, hash))
}

/// Creates the DaemonSet or brings the live one in line with `mutate`.
///
/// `mutate` renders the desired state onto either a fresh object or a copy of
/// the live one. An unchanged render is not written. Replaces carry the
/// observed `resourceVersion`; on conflict the object is read again.
pub async fn create_or_patch_daemon_set<F>(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<OperationResult, ControllerError>
where
    F: Fn(&mut DaemonSet) -> Result<(), ControllerError> + Send + Sync,
{
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let result = match cluster.get_daemon_set(namespace, name).await? {
            None => {
                let mut desired = DaemonSet {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                mutate(&mut desired)?;
                cluster.create_daemon_set(&desired).await.map(|_| OperationResult::Created)
            }
            Some(current) => {
                let mut desired = current.clone();
                mutate(&mut desired)?;
                if desired == current {
                    debug!("DaemonSet {}/{} is up to date", namespace, name);
                    return Ok(OperationResult::Unchanged);
                }
                cluster.replace_daemon_set(&desired).await.map(|_| OperationResult::Updated)
            }
        };

        match result {
            Err(e) if e.is_conflict() => {
                warn!(
                    "Conflict writing DaemonSet {}/{} (attempt {}/{}): {}",
                    namespace, name, attempt, MAX_CONFLICT_RETRIES, e
                );
            }
            other => return other,
        }
    }

    Err(ControllerError::Conflict(format!(
        "DaemonSet {}/{} kept changing after {} attempts",
        namespace, name, MAX_CONFLICT_RETRIES
    )))
}

#[cfg(test)]
#[path = "reconcile_helpers_test.rs"]
mod reconcile_helpers_test;
