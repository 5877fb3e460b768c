//! Print the `EtcdCluster` CRD in YAML, piped into the deploy manifests

use anyhow::Result;
use crd_api::EtcdCluster;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    println!("{}", serde_yaml::to_string(&EtcdCluster::crd())?);
    Ok(())
}
