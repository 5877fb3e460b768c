use std::fmt::Debug;
use std::fs::{create_dir_all, read_dir, remove_dir_all, remove_file};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use crd_api::{EtcdCluster, StorageSpec};
use kube::ResourceExt;
use tracing::debug;

use crate::consts::BACKUP_DIR;

use super::Error;

/// Snapshot file suffix
const SNAPSHOT_SUFFIX: &str = "etcd.backup";

/// Snapshot metadata encoded in the file name
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Metadata {
    /// The cluster lineage this snapshot belongs to
    pub(crate) name: String,
    /// The store revision the snapshot was taken at
    pub(crate) revision: i64,
}

impl ToString for Metadata {
    fn to_string(&self) -> String {
        format!("{}.{}.{SNAPSHOT_SUFFIX}", self.name, self.revision)
    }
}

impl TryFrom<&Path> for Metadata {
    type Error = anyhow::Error;

    fn try_from(value: &Path) -> Result<Self> {
        let filename = value
            .file_name()
            .ok_or(anyhow!("backup file name not found, got {value:?}"))?
            .to_str()
            .ok_or(anyhow!("the backup path is not a valid unicode"))?;
        let mut split = filename.trim_end_matches(SNAPSHOT_SUFFIX).split('.');
        if let (Some(name), Some(revision)) = (split.next(), split.next()) {
            let revision: i64 = revision.parse()?;
            return Ok(Metadata {
                name: name.to_owned(),
                revision,
            });
        };
        Err(anyhow!(
            "invalid file name: {filename}, expect <name>.<revision>"
        ))
    }
}

/// The restore instruction attached to a fresh instance so that it installs
/// a snapshot before the replicated-store process starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecoveryHint {
    /// Snapshot location on the mounted backup volume
    pub(crate) snapshot_path: PathBuf,
    /// The claim carrying the snapshots
    pub(crate) claim_name: String,
}

/// External backup subsystem. The core only relies on this narrow contract
/// so any object store can stand behind it.
#[async_trait]
pub(crate) trait BackupCoordinator: Debug + Send + Sync + 'static {
    /// Create the durable backup context of this cluster
    async fn setup(&self) -> Result<()>;

    /// Remove everything the backup subsystem owns for this cluster
    async fn cleanup(&self) -> Result<()>;

    /// Whether at least one complete snapshot is available
    async fn latest_snapshot_exists(&self) -> Result<bool>;

    /// The restore instruction pointing at the latest snapshot
    async fn recovery_hint(&self) -> Result<RecoveryHint>;
}

/// Build the backup coordinator the spec asks for, `None` when the spec
/// carries no backup section
pub(crate) fn coordinator(
    resource: &EtcdCluster,
) -> Result<Option<Box<dyn BackupCoordinator>>, Error> {
    let Some(spec) = resource.spec.backup.as_ref() else {
        return Ok(None);
    };
    let lineage = resource
        .spec
        .restore
        .as_ref()
        .and_then(|restore| restore.backup_cluster_name.clone())
        .unwrap_or_else(|| resource.name_any());
    match spec.storage {
        StorageSpec::Pvc { ref pvc } => {
            let claim_name = pvc
                .metadata
                .name
                .clone()
                .ok_or(Error::MissingObject(".spec.backup.pvc.metadata.name"))?;
            Ok(Some(Box::new(PvCoordinator {
                backup_path: Path::new(BACKUP_DIR).join(lineage),
                claim_name,
                max_snapshots: spec.max_snapshots,
            })))
        }
        StorageSpec::S3 { .. } => Err(Error::InvalidSpec(
            "s3 backup storage is not supported yet".to_owned(),
        )),
    }
}

/// Snapshots on a persistent volume mounted by both the operator and the
/// recovering instances
#[derive(Debug)]
pub(crate) struct PvCoordinator {
    /// Directory holding this lineage's snapshots
    backup_path: PathBuf,
    /// The claim mounted into recovering instances
    claim_name: String,
    /// Snapshots beyond this count are pruned, oldest first
    max_snapshots: usize,
}

impl PvCoordinator {
    /// All snapshots under the backup path, ordered by revision
    fn snapshots(&self) -> Result<Vec<Metadata>> {
        let entries = read_dir(&self.backup_path)?;
        let mut snapshots = entries
            .filter_map(|item| {
                item.ok()
                    .and_then(|entry| entry.file_name().into_string().ok())
            })
            .filter(|item| item.ends_with(SNAPSHOT_SUFFIX))
            .map(|item| Metadata::try_from(Path::new(&item)))
            .collect::<Result<Vec<_>, _>>()?;
        snapshots.sort_by_key(|metadata| metadata.revision);
        Ok(snapshots)
    }

    /// The newest snapshot, if any
    fn latest(&self) -> Result<Option<Metadata>> {
        Ok(self.snapshots()?.pop())
    }
}

#[async_trait]
impl BackupCoordinator for PvCoordinator {
    async fn setup(&self) -> Result<()> {
        create_dir_all(&self.backup_path)?;
        let mut snapshots = self.snapshots()?;
        while snapshots.len() > self.max_snapshots {
            let oldest = snapshots.remove(0);
            let path = self.backup_path.join(oldest.to_string());
            debug!("pruning snapshot {}", path.display());
            remove_file(path)?;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        if self.backup_path.exists() {
            remove_dir_all(&self.backup_path)?;
        }
        Ok(())
    }

    async fn latest_snapshot_exists(&self) -> Result<bool> {
        Ok(self.latest()?.is_some())
    }

    async fn recovery_hint(&self) -> Result<RecoveryHint> {
        let latest = self.latest()?.ok_or_else(|| {
            anyhow!("no snapshot found under {}", self.backup_path.display())
        })?;
        Ok(RecoveryHint {
            snapshot_path: self.backup_path.join(latest.to_string()),
            claim_name: self.claim_name.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs::{create_dir_all, write};
    use std::path::Path;

    use super::{BackupCoordinator, Metadata, PvCoordinator};

    #[test]
    fn metadata_file_name_round_trip() {
        let metadata = Metadata {
            name: "my-etcd".to_owned(),
            revision: 1,
        };
        let filename: String = metadata.to_string();
        let expect = "my-etcd.1.etcd.backup";
        assert_eq!(filename, expect);
        let metadata = Metadata::try_from(Path::new(expect)).unwrap();
        assert_eq!(
            &metadata,
            &Metadata {
                name: "my-etcd".to_owned(),
                revision: 1,
            }
        );
    }

    #[tokio::test]
    async fn setup_prunes_beyond_the_retention_limit() {
        let dir = std::env::temp_dir().join(format!("etcd-backup-test-{}", uuid::Uuid::new_v4()));
        create_dir_all(&dir).unwrap();
        for revision in 1..=4_i64 {
            let metadata = Metadata {
                name: "my-etcd".to_owned(),
                revision,
            };
            write(dir.join(metadata.to_string()), b"snapshot").unwrap();
        }
        let coordinator = PvCoordinator {
            backup_path: dir,
            claim_name: "backup-pvc".to_owned(),
            max_snapshots: 2,
        };

        coordinator.setup().await.unwrap();
        let remaining = coordinator.snapshots().unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].revision, 3);
        assert_eq!(remaining[1].revision, 4);

        let hint = coordinator.recovery_hint().await.unwrap();
        assert!(hint
            .snapshot_path
            .to_string_lossy()
            .ends_with("my-etcd.4.etcd.backup"));
        assert_eq!(hint.claim_name, "backup-pvc");

        coordinator.cleanup().await.unwrap();
        assert!(!coordinator.backup_path.exists());
    }
}
