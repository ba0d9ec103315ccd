//! Prints the CRD manifests as a multi-document YAML stream.
//!
//! ```text
//! cargo run -p crds --bin crdgen > config/crds.yaml
//! ```

use crds::{ENI, NetResourceSet};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("---\n{}", serde_yaml::to_string(&NetResourceSet::crd())?);
    print!("---\n{}", serde_yaml::to_string(&ENI::crd())?);
    Ok(())
}
