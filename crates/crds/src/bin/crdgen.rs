//! Prints the Module CRD as YAML.
//!
//! Usage: `cargo run --bin crdgen | kubectl apply -f -`

use crds::Module;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Module::crd())?);
    Ok(())
}
