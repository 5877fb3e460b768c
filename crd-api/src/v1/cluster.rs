// The `JsonSchema` and `CustomResource` macro generates codes that does not pass the clippy lint.
#![allow(clippy::str_to_string)]
#![allow(clippy::missing_docs_in_private_items)]

use garde::Validate;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::serde::{Deserialize, Serialize};
use kube::CustomResource;
use schemars::JsonSchema;

/// The image repository used when the spec does not name one
pub const DEFAULT_REPOSITORY: &str = "quay.io/coreos/etcd";

/// Etcd cluster specification
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Validate)]
#[kube(
    group = "etcdoperator.etcd.io",
    version = "v1",
    kind = "EtcdCluster",
    singular = "etcdcluster",
    plural = "etcdclusters",
    root = "EtcdCluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "ec",
    printcolumn = r#"{"name":"Size", "type":"string", "description":"The desired member count", "jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "description":"The target etcd version", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "description":"The cluster phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "description":"The cluster age", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
#[schemars(rename_all = "camelCase")]
#[garde(allow_unvalidated)]
pub struct ClusterSpec {
    /// Size of the etcd cluster, odd sizes keep quorum affordable
    #[garde(range(min = 1))]
    #[schemars(range(min = 1))]
    pub size: usize,
    /// The target etcd version, e.g. "3.2.13" or "v3.2.13"
    #[garde(pattern(r"^v?[0-9]+\.[0-9]+\.[0-9]+$"))]
    #[schemars(regex(pattern = r"^v?[0-9]+\.[0-9]+\.[0-9]+$"))]
    pub version: String,
    /// The image repository, defaults to `quay.io/coreos/etcd`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// When true, the periodic reconciliation of this cluster is suppressed.
    /// Delete and spec changes are still observed.
    #[serde(default)]
    pub paused: bool,
    /// Backup specification, absence makes disaster recovery impossible
    #[garde(dive)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,
    /// Marks this cluster as restored from existing snapshots instead of
    /// bootstrapped from an empty seed member
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,
    /// Self-hosted bootstrap specification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_hosted: Option<SelfHostedSpec>,
}

impl ClusterSpec {
    /// The image tag of the target version
    #[must_use]
    #[inline]
    pub fn version_tag(&self) -> String {
        if self.version.starts_with('v') {
            self.version.clone()
        } else {
            format!("v{}", self.version)
        }
    }

    /// The full image of the target version
    #[must_use]
    #[inline]
    pub fn image(&self) -> String {
        format!(
            "{}:{}",
            self.repository.as_deref().unwrap_or(DEFAULT_REPOSITORY),
            self.version_tag()
        )
    }

    /// Validate the field constraints of this spec
    ///
    /// # Errors
    ///
    /// Return `Err` when a field is out of its allowed range
    #[inline]
    pub fn validate_fields(&self) -> Result<(), garde::Report> {
        Validate::validate(self, &())
    }
}

/// Etcd cluster backup specification
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
#[schemars(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Maximum number of snapshots to retain, older snapshots are pruned
    #[garde(range(min = 1))]
    #[schemars(range(min = 1))]
    pub max_snapshots: usize,
    /// Backup storage type
    #[garde(dive)]
    #[serde(flatten)]
    pub storage: StorageSpec,
}

/// Etcd cluster backup storage specification
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Validate)]
#[serde(untagged)]
pub enum StorageSpec {
    /// S3 backup type
    S3 {
        /// S3 backup specification
        #[garde(dive)]
        s3: S3Spec,
    },
    /// Persistent volume backup type
    Pvc {
        /// Persistent volume claim shared by the operator and the instances
        #[garde(skip)]
        pvc: PersistentVolumeClaim,
    },
}

impl StorageSpec {
    /// The backing claim, if the storage type is a persistent volume
    #[must_use]
    #[inline]
    pub fn as_pvc(&self) -> Option<&PersistentVolumeClaim> {
        match *self {
            Self::Pvc { ref pvc } => Some(pvc),
            Self::S3 { .. } => None,
        }
    }
}

/// Etcd cluster backup S3 specification
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Validate)]
pub struct S3Spec {
    /// S3 bucket name to use for backup
    #[garde(pattern(r"^[a-z0-9][a-z0-9-]{1,61}[a-z0-9]$"))]
    #[schemars(regex(pattern = r"^[a-z0-9][a-z0-9-]{1,61}[a-z0-9]$"))]
    pub bucket: String,
}

/// Restore marker. A cluster carrying it seeds its first member from the
/// latest snapshot instead of bootstrapping an empty one.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
#[schemars(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// The name the snapshots were taken under, defaults to this cluster's name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_cluster_name: Option<String>,
}

/// Self-hosted bootstrap specification
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
#[schemars(rename_all = "camelCase")]
pub struct SelfHostedSpec {
    /// Client endpoint of an existing boot member to migrate into this
    /// cluster. Absence bootstraps a fresh self-hosted cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_member_client_endpoint: Option<String>,
}

/// Etcd cluster status, written back by the operator only
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[schemars(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// The lifecycle phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,
    /// The reason of the `Failed` phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Number of reconciliation ticks executed
    #[serde(default)]
    pub control_ticks: u64,
    /// Number of ticks skipped while the cluster was paused
    #[serde(default)]
    pub control_paused: u64,
    /// Names of the currently known data-plane members
    #[serde(default)]
    pub members: Vec<String>,
}

/// The lifecycle phase of a managed cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    /// The cluster is being bootstrapped
    #[default]
    Creating,
    /// The reconciliation loop is actively ticking
    Running,
    /// Periodic reconciliation is suppressed
    Paused,
    /// The reconciliation loop has terminated
    Failed,
}

/// The reason of a `Failed` phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum FailureReason {
    /// Disaster recovery was required but no backup storage is attached
    /// or no snapshot is available
    NoBackup,
    /// A member name outside the managed naming scheme was observed
    InvalidMemberName,
}
