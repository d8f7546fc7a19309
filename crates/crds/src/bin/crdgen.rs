//! Prints the Vip CRD manifest as YAML.
//!
//! `cargo run -p crds --bin crdgen > deploy/crds/vip.yaml`

use anyhow::Result;

fn main() -> Result<()> {
    let crd = crds::vip_crd()?;
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
