//! Label and annotation keys stamped on objects owned by a Module.
//!
//! The upserter writes them, the garbage collectors and the watcher read
//! them back, so they must never change between releases.

/// Name of the owning Module.
pub const MODULE_NAME: &str = "kmm.node.kubernetes.io/module.name";

/// Normalized kernel version a per-node DaemonSet or a build/sign Job serves.
pub const KERNEL_VERSION: &str = "kmm.node.kubernetes.io/kernel-version.full";

/// Module version a per-node DaemonSet was rendered for.
pub const MODULE_VERSION: &str = "kmm.node.kubernetes.io/module.version";

/// DaemonSet role, one of [`ROLE_MODULE_LOADER`] or [`ROLE_DEVICE_PLUGIN`].
pub const ROLE: &str = "kmm.node.kubernetes.io/role";
pub const ROLE_MODULE_LOADER: &str = "module-loader";
pub const ROLE_DEVICE_PLUGIN: &str = "device-plugin";

/// Job type, one of [`JOB_TYPE_BUILD`] or [`JOB_TYPE_SIGN`].
pub const JOB_TYPE: &str = "kmm.node.kubernetes.io/job-type";
pub const JOB_TYPE_BUILD: &str = "build";
pub const JOB_TYPE_SIGN: &str = "sign";

/// Hash of the Job template a build/sign Job was created from.
pub const LAST_HASH_ANNOTATION: &str = "kmm.node.kubernetes.io/last-hash";
