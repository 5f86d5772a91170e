//! Kernel version resolution.
//!
//! Turns a Module and one node's kernel version into [`ModuleLoaderData`] by
//! picking the first kernel mapping that matches and layering it over the
//! container defaults.

use crate::api::{ModuleLoaderData, module_owner_reference};
use crate::error::ControllerError;
use crds::{KernelMapping, Matcher, Module, numeric_components};
use regex::Regex;

/// Resolves a Module for a single kernel version.
pub trait ModuleLoaderDataFactory: Send + Sync {
    fn from_module(&self, module: &Module, kernel_version: &str) -> Result<ModuleLoaderData, ControllerError>;
}

/// Strips the trailing `+` build marker some kernels report.
pub fn normalize_kernel_version(kernel_version: &str) -> &str {
    kernel_version.strip_suffix('+').unwrap_or(kernel_version)
}

/// Mapping-based [`ModuleLoaderDataFactory`].
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelMapper;

impl KernelMapper {
    pub fn new() -> Self {
        Self
    }

    /// First mapping matching `kernel_version`, in declaration order.
    pub fn find_mapping<'a>(
        &self,
        mappings: &'a [KernelMapping],
        kernel_version: &str,
    ) -> Result<Option<&'a KernelMapping>, ControllerError> {
        for (index, mapping) in mappings.iter().enumerate() {
            let matcher = mapping
                .matcher()
                .map_err(|e| ControllerError::KernelMapping(format!("mapping {}: {}", index, e)))?;
            let matched = match matcher {
                Matcher::Literal(literal) => literal == kernel_version,
                Matcher::Regexp(pattern) => Regex::new(pattern)
                    .map_err(|e| {
                        ControllerError::KernelMapping(format!("mapping {}: invalid regexp {:?}: {}", index, pattern, e))
                    })?
                    .is_match(kernel_version),
                Matcher::Range(range) => range.contains(kernel_version),
            };
            if matched {
                return Ok(Some(mapping));
            }
        }
        Ok(None)
    }
}

impl ModuleLoaderDataFactory for KernelMapper {
    fn from_module(&self, module: &Module, kernel_version: &str) -> Result<ModuleLoaderData, ControllerError> {
        let name = module.metadata.name.clone().unwrap_or_default();
        let namespace = module.metadata.namespace.clone().unwrap_or_default();
        let container = &module.spec.module_loader.container;

        // A Module without mappings applies its defaults to every kernel.
        let mapping = if container.kernel_mappings.is_empty() {
            None
        } else {
            let found = self.find_mapping(&container.kernel_mappings, kernel_version)?;
            Some(found.ok_or_else(|| {
                ControllerError::KernelMapping(format!(
                    "no kernel mapping of Module {}/{} matches kernel {}",
                    namespace, name, kernel_version
                ))
            })?)
        };

        let vars = TemplateVars::new(kernel_version, &name, &namespace);

        let image = mapping
            .and_then(|m| m.container_image.as_ref())
            .or(container.container_image.as_ref())
            .ok_or_else(|| {
                ControllerError::KernelMapping(format!(
                    "no container image defined for kernel {} in Module {}/{}",
                    kernel_version, namespace, name
                ))
            })?;

        let mut build = mapping.and_then(|m| m.build.clone()).or_else(|| container.build.clone());
        if let Some(build) = build.as_mut() {
            for arg in &mut build.build_args {
                arg.value = vars.render(&arg.value);
            }
        }

        let mut sign = mapping.and_then(|m| m.sign.clone()).or_else(|| container.sign.clone());
        if let Some(sign) = sign.as_mut() {
            sign.unsigned_image = sign.unsigned_image.as_deref().map(|i| vars.render(i));
            if sign.unsigned_image.is_none() && build.is_none() {
                return Err(ControllerError::KernelMapping(format!(
                    "kernel {} of Module {}/{} is signed but has neither an unsigned image nor a build",
                    kernel_version, namespace, name
                )));
            }
        }

        Ok(ModuleLoaderData {
            kernel_version: kernel_version.to_string(),
            container_image: vars.render(image),
            image_pull_policy: container.image_pull_policy.clone(),
            build,
            sign,
            module_version: module.module_version().to_string(),
            modprobe: container.modprobe.clone(),
            selector: module.spec.selector.clone(),
            service_account_name: module.spec.module_loader.service_account_name.clone(),
            image_repo_secret: module.spec.image_repo_secret.clone(),
            owner: module_owner_reference(module),
            name,
            namespace,
        })
    }
}

/// `${VAR}` substitutions available in images and build arguments.
struct TemplateVars {
    pairs: Vec<(&'static str, String)>,
}

impl TemplateVars {
    fn new(kernel_version: &str, name: &str, namespace: &str) -> Self {
        let components = numeric_components(kernel_version);
        let component = |i: usize| components.get(i).map(ToString::to_string).unwrap_or_default();
        let xyz = components
            .iter()
            .take(3)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Self {
            pairs: vec![
                ("${KERNEL_FULL_VERSION}", kernel_version.to_string()),
                ("${KERNEL_XYZ}", xyz),
                ("${KERNEL_X}", component(0)),
                ("${KERNEL_Y}", component(1)),
                ("${KERNEL_Z}", component(2)),
                ("${MOD_NAME}", name.to_string()),
                ("${MOD_NAMESPACE}", namespace.to_string()),
            ],
        }
    }

    fn render(&self, input: &str) -> String {
        self.pairs
            .iter()
            .fold(input.to_string(), |acc, (var, value)| acc.replace(var, value))
    }
}
