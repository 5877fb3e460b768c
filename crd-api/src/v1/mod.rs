pub use cluster::{
    BackupSpec, ClusterPhase, ClusterSpec, ClusterStatus, EtcdCluster, FailureReason, RestoreSpec,
    S3Spec, SelfHostedSpec, StorageSpec, DEFAULT_REPOSITORY,
};

mod cluster;
