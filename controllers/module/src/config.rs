//! Controller configuration loaded from environment variables.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::str::FromStr;

pub const DEFAULT_KERNEL_LABEL: &str = "feature.node.kubernetes.io/kernel-version.full";
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_BUILD_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";
pub const DEFAULT_SIGN_IMAGE: &str = "quay.io/edge-infrastructure/kernel-module-management-signimage:latest";

/// Runtime configuration of the Module Controller.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch for Modules; all namespaces when unset
    pub watch_namespace: Option<String>,
    /// Node label carrying the full kernel version
    pub kernel_label: String,
    pub metrics_addr: SocketAddr,
    pub build_image: String,
    pub sign_image: String,
    pub worker_image_pull_policy: Option<String>,
    /// Talk plain HTTP to registries when checking for images
    pub registry_insecure: bool,
    pub requeue_min_seconds: u64,
    pub requeue_max_seconds: u64,
    pub concurrency: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            kernel_label: DEFAULT_KERNEL_LABEL.to_string(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            build_image: DEFAULT_BUILD_IMAGE.to_string(),
            sign_image: DEFAULT_SIGN_IMAGE.to_string(),
            worker_image_pull_policy: None,
            registry_insecure: false,
            requeue_min_seconds: 5,
            requeue_max_seconds: 300,
            concurrency: 3,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            kernel_label: get("KERNEL_LABEL").unwrap_or(defaults.kernel_label),
            metrics_addr: parse_or("METRICS_ADDR", get("METRICS_ADDR"), defaults.metrics_addr)?,
            build_image: get("BUILD_IMAGE").unwrap_or(defaults.build_image),
            sign_image: get("SIGN_IMAGE").unwrap_or(defaults.sign_image),
            worker_image_pull_policy: get("WORKER_IMAGE_PULL_POLICY"),
            registry_insecure: parse_or("REGISTRY_INSECURE", get("REGISTRY_INSECURE"), false)?,
            requeue_min_seconds: parse_or(
                "REQUEUE_MIN_SECONDS",
                get("REQUEUE_MIN_SECONDS"),
                defaults.requeue_min_seconds,
            )?,
            requeue_max_seconds: parse_or(
                "REQUEUE_MAX_SECONDS",
                get("REQUEUE_MAX_SECONDS"),
                defaults.requeue_max_seconds,
            )?,
            concurrency: parse_or("CONTROLLER_CONCURRENCY", get("CONTROLLER_CONCURRENCY"), defaults.concurrency)?,
        };

        if config.requeue_min_seconds == 0 || config.requeue_min_seconds > config.requeue_max_seconds {
            return Err(ControllerError::InvalidConfig(format!(
                "REQUEUE_MIN_SECONDS ({}) must be positive and not exceed REQUEUE_MAX_SECONDS ({})",
                config.requeue_min_seconds, config.requeue_max_seconds
            )));
        }
        if config.concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "CONTROLLER_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| {
            ControllerError::InvalidConfig(format!("{} has invalid value {:?}: {}", key, raw, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.kernel_label, DEFAULT_KERNEL_LABEL);
        assert_eq!(config.metrics_addr.to_string(), DEFAULT_METRICS_ADDR);
        assert!(!config.registry_insecure);
        assert_eq!(config.concurrency, 3);
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("WATCH_NAMESPACE", "drivers"),
            ("KERNEL_LABEL", "example.com/kernel"),
            ("METRICS_ADDR", "127.0.0.1:9090"),
            ("REGISTRY_INSECURE", "true"),
            ("REQUEUE_MIN_SECONDS", "2"),
            ("REQUEUE_MAX_SECONDS", "60"),
            ("CONTROLLER_CONCURRENCY", "8"),
        ]))
        .unwrap();
        assert_eq!(config.watch_namespace.as_deref(), Some("drivers"));
        assert_eq!(config.kernel_label, "example.com/kernel");
        assert_eq!(config.metrics_addr.port(), 9090);
        assert!(config.registry_insecure);
        assert_eq!(config.requeue_min_seconds, 2);
        assert_eq!(config.requeue_max_seconds, 60);
        assert_eq!(config.concurrency, 8);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[("REGISTRY_INSECURE", "maybe")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));

        let err = Config::from_lookup(lookup(&[
            ("REQUEUE_MIN_SECONDS", "30"),
            ("REQUEUE_MAX_SECONDS", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }
}
