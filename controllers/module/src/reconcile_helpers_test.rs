//! Unit tests for reconcile_helpers module

use super::*;
use crate::test_utils::*;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

fn render(image: &'static str) -> impl Fn(&mut DaemonSet) -> Result<(), ControllerError> + Send + Sync {
    move |ds: &mut DaemonSet| {
        ds.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("app".to_string(), image.to_string());
        Ok(())
    }
}

#[test]
fn test_hash_fields_ignores_field_order() {
    let a = hash_fields(&[("kernelVersion", "5.14.0"), ("moduleVersion", "v1")]).unwrap();
    let b = hash_fields(&[("moduleVersion", "v1"), ("kernelVersion", "5.14.0")]).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_module_loader_name_is_deterministic() {
    let first = module_loader_daemon_set_name("kmod", "5.14.0", "v1").unwrap();
    let second = module_loader_daemon_set_name("kmod", "5.14.0", "v1").unwrap();
    assert_eq!(first, second);
    assert!(first.starts_with("kmod-"));
    let suffix = first.trim_start_matches("kmod-");
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_module_loader_name_depends_on_both_versions() {
    let base = module_loader_daemon_set_name("kmod", "5.14.0", "v1").unwrap();
    let other_module_version = module_loader_daemon_set_name("kmod", "5.14.0", "v2").unwrap();
    let other_kernel = module_loader_daemon_set_name("kmod", "6.1.0", "v1").unwrap();
    assert_ne!(base, other_module_version);
    assert_ne!(base, other_kernel);
    assert_ne!(other_module_version, other_kernel);
}

#[test]
fn test_device_plugin_name_depends_on_module_version() {
    let v1 = device_plugin_daemon_set_name("kmod", "v1").unwrap();
    let v2 = device_plugin_daemon_set_name("kmod", "v2").unwrap();
    assert!(v1.starts_with("kmod-device-plugin-"));
    assert_ne!(v1, v2);
}

#[tokio::test]
async fn test_create_or_patch_creates_then_is_unchanged() {
    let cluster = MockCluster::new();

    let first = create_or_patch_daemon_set(&cluster, "drivers", "kmod-abc", render("one"))
        .await
        .unwrap();
    assert_eq!(first, OperationResult::Created);
    let stored = cluster.daemon_set("drivers", "kmod-abc").unwrap();

    let second = create_or_patch_daemon_set(&cluster, "drivers", "kmod-abc", render("one"))
        .await
        .unwrap();
    assert_eq!(second, OperationResult::Unchanged);
    assert_eq!(cluster.daemon_set("drivers", "kmod-abc").unwrap(), stored);
    assert_eq!(cluster.writes().len(), 1);
}

#[tokio::test]
async fn test_create_or_patch_updates_changed_render() {
    let cluster = MockCluster::new();
    create_or_patch_daemon_set(&cluster, "drivers", "kmod-abc", render("one"))
        .await
        .unwrap();

    let result = create_or_patch_daemon_set(&cluster, "drivers", "kmod-abc", render("two"))
        .await
        .unwrap();
    assert_eq!(result, OperationResult::Updated);
    let stored = cluster.daemon_set("drivers", "kmod-abc").unwrap();
    assert_eq!(stored.metadata.labels.unwrap()["app"], "two");
}

#[tokio::test]
async fn test_create_or_patch_retries_on_conflict() {
    let cluster = MockCluster::new();
    create_or_patch_daemon_set(&cluster, "drivers", "kmod-abc", render("one"))
        .await
        .unwrap();

    cluster.replace_conflicts.store(2, Ordering::SeqCst);
    let result = create_or_patch_daemon_set(&cluster, "drivers", "kmod-abc", render("two"))
        .await
        .unwrap();
    assert_eq!(result, OperationResult::Updated);
}

#[tokio::test]
async fn test_create_or_patch_gives_up_after_repeated_conflicts() {
    let cluster = MockCluster::new();
    create_or_patch_daemon_set(&cluster, "drivers", "kmod-abc", render("one"))
        .await
        .unwrap();

    cluster.replace_conflicts.store(MAX_CONFLICT_RETRIES, Ordering::SeqCst);
    let err = create_or_patch_daemon_set(&cluster, "drivers", "kmod-abc", render("two"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}
