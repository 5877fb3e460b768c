/// The `EtcdCluster` resource, version v1
pub mod v1;

pub use v1::*;
