use std::time::Duration;

/// Capacity of the per-cluster event queue. A full queue indicates a
/// control-plane bug rather than a routine overload.
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 100;
/// Interval between two attempts to persist a closing status
pub(crate) const STATUS_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// The label attached to subresources, indicates the etcdcluster name
pub(crate) const LABEL_CLUSTER_NAME: &str = "etcdcluster/name";
/// The label attached to an instance, indicates the member it backs
pub(crate) const LABEL_CLUSTER_MEMBER: &str = "etcdcluster/member";
/// Indicate the version of operator that creates this subresource
pub(crate) const LABEL_OPERATOR_VERSION: &str = "etcdcluster/operator-version";
/// The name of the client port
pub(crate) const CLIENT_PORT_NAME: &str = "client";
/// The name of the peer port
pub(crate) const PEER_PORT_NAME: &str = "peer";
/// The etcd client port
pub(crate) const DEFAULT_CLIENT_PORT: i32 = 2379;
/// The etcd peer port
pub(crate) const DEFAULT_PEER_PORT: i32 = 2380;
/// The etcd container name in an instance
pub(crate) const ETCD_CONTAINER_NAME: &str = "etcd";
/// Mount path of the data volume
pub(crate) const DATA_MOUNT_DIR: &str = "/var/etcd";
/// The etcd data dir inside an instance, beneath the data volume mount so
/// that a snapshot restore can create it
pub(crate) const DATA_DIR: &str = "/var/etcd/data";
/// The emptyDir volume name holding the etcd data
pub(crate) const DATA_VOLUME_NAME: &str = "etcd-data";
/// Mount path of the backup volume, shared by the operator and recovering instances
pub(crate) const BACKUP_DIR: &str = "/etcd-backup";
/// The volume name of the mounted backup claim
pub(crate) const BACKUP_VOLUME_NAME: &str = "etcd-backup";
