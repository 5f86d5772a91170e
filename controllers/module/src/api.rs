//! Per-kernel resolved Module data shared by the collaborators.

use crds::{Build, ModprobeSpec, Module, Sign};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use std::collections::BTreeMap;

/// Everything needed to build, sign and load a Module on one kernel version.
///
/// Built fresh on every reconciliation pass, once per distinct kernel version
/// among the targeted nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleLoaderData {
    pub name: String,
    pub namespace: String,
    /// Normalized kernel version (trailing `+` stripped)
    pub kernel_version: String,
    pub container_image: String,
    pub image_pull_policy: Option<String>,
    pub build: Option<Build>,
    pub sign: Option<Sign>,
    pub module_version: String,
    pub modprobe: ModprobeSpec,
    pub selector: BTreeMap<String, String>,
    pub service_account_name: Option<String>,
    pub image_repo_secret: Option<String>,
    pub owner: OwnerReference,
}

impl ModuleLoaderData {
    /// Image the build stage pushes.
    ///
    /// When the module is also signed, the build output is an intermediate
    /// unsigned image and the sign stage produces `container_image`.
    pub fn build_output_image(&self) -> String {
        match &self.sign {
            Some(_) => self.unsigned_image(),
            None => self.container_image.clone(),
        }
    }

    /// Image the sign stage reads from.
    pub fn unsigned_image(&self) -> String {
        if let Some(image) = self.sign.as_ref().and_then(|s| s.unsigned_image.as_ref()) {
            return image.clone();
        }
        append_to_tag(
            &self.container_image,
            &format!("{}_{}_kmm_unsigned", self.namespace, self.name),
        )
    }
}

/// Whether an image reference carries a tag.
///
/// A colon only starts a tag when it comes after the last slash, so a registry
/// port is left alone.
pub fn has_tag(image: &str) -> bool {
    let last_slash = image.rfind('/').map_or(0, |i| i + 1);
    image[last_slash..].contains(':')
}

/// Appends `suffix` to the tag of `image`, or uses it as the tag when there is none.
///
/// The kernel-specific part of the tag is kept, so every kernel version gets
/// its own intermediate image.
pub fn append_to_tag(image: &str, suffix: &str) -> String {
    let separator = if has_tag(image) { '_' } else { ':' };
    format!("{}{}{}", image, separator, suffix)
}

/// Controller owner reference pointing at `module`.
pub fn module_owner_reference(module: &Module) -> OwnerReference {
    OwnerReference {
        api_version: Module::api_version(&()).into_owned(),
        kind: Module::kind(&()).into_owned(),
        name: module.metadata.name.clone().unwrap_or_default(),
        uid: module.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_to_tag() {
        assert_eq!(append_to_tag("quay.io/org/kmod:v1", "x"), "quay.io/org/kmod:v1_x");
        assert_eq!(append_to_tag("quay.io/org/kmod", "x"), "quay.io/org/kmod:x");
        assert_eq!(append_to_tag("registry:5000/kmod", "x"), "registry:5000/kmod:x");
        assert_eq!(append_to_tag("registry:5000/kmod:1.0", "x"), "registry:5000/kmod:1.0_x");
    }

    #[test]
    fn test_owner_reference_points_at_module() {
        let mut module = Module::new("kmod", Default::default());
        module.metadata.uid = Some("1234".to_string());
        let owner = module_owner_reference(&module);
        assert_eq!(owner.api_version, "kmm.sigs.x-k8s.io/v1beta1");
        assert_eq!(owner.kind, "Module");
        assert_eq!(owner.name, "kmod");
        assert_eq!(owner.uid, "1234");
        assert_eq!(owner.controller, Some(true));
    }
}
