/// Backup coordinator interface
mod backup;
/// Data-plane quorum client
mod etcd;
/// Orchestrator adapter
mod k8s;
/// Member model
mod member;
/// Membership reconciliation
mod reconcile;

use std::time::Duration;

use clippy_utilities::OverflowArithmetic;
use crd_api::{ClusterPhase, ClusterStatus, EtcdCluster, FailureReason};
use flume::{Receiver, Sender, TrySendError};
use kube::Client;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::consts::{EVENT_QUEUE_CAPACITY, STATUS_RETRY_INTERVAL};
use crate::metrics;

use backup::BackupCoordinator;
use k8s::{ClusterState, K8sAdapter, PodPlan};
use member::{member_name, Member, MemberSet};

pub(crate) use k8s::is_already_exists;

/// All possible errors of the reconciliation core
#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    /// Missing an object key in the declarative resource
    #[error("missing object key {0} in cluster")]
    MissingObject(&'static str),
    /// The spec does not satisfy its field constraints
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),
    /// Orchestrator api error, retried on the next tick
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    /// Data plane error, retried on the next tick
    #[error("data plane error: {0}")]
    DataPlane(#[from] etcd_client::Error),
    /// Status encoding error
    #[error("status encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Backup coordinator error, retried on the next tick
    #[error("backup coordinator error: {0}")]
    Backup(#[from] anyhow::Error),
    /// The previous decision is still materializing, try again later
    #[error("not ready: {0}")]
    NotReady(String),
    /// Disaster recovery is required but impossible
    #[error("cannot recover: no backup storage or no snapshot")]
    NoBackup,
    /// A member name outside the managed naming scheme
    #[error("member name {0} does not end in a decimal counter")]
    BadMemberName(String),
}

impl Error {
    /// Whether this error terminates the reconciliation loop
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(*self, Self::NoBackup | Self::BadMemberName(_))
    }

    /// Whether this error means "try again later" rather than a failure
    pub(crate) fn is_not_ready(&self) -> bool {
        matches!(*self, Self::NotReady(_))
    }

    /// The user-visible failure reason, if one applies
    pub(crate) fn failure_reason(&self) -> Option<FailureReason> {
        match *self {
            Self::NoBackup => Some(FailureReason::NoBackup),
            Self::BadMemberName(_) => Some(FailureReason::InvalidMemberName),
            Self::MissingObject(_)
            | Self::InvalidSpec(_)
            | Self::Kube(_)
            | Self::DataPlane(_)
            | Self::Serde(_)
            | Self::Backup(_)
            | Self::NotReady(_) => None,
        }
    }

    /// The metrics label of this error kind
    pub(crate) fn label(&self) -> &'static str {
        match *self {
            Self::MissingObject(_) => "missing_object",
            Self::InvalidSpec(_) => "invalid_spec",
            Self::Kube(_) => "kube",
            Self::DataPlane(_) => "data_plane",
            Self::Serde(_) => "serde",
            Self::Backup(_) => "backup",
            Self::NotReady(_) => "not_ready",
            Self::NoBackup => "no_backup",
            Self::BadMemberName(_) => "bad_member_name",
        }
    }
}

/// External command delivered to the reconciliation loop
#[derive(Debug)]
pub(crate) enum ClusterEvent {
    /// Replace the in-memory spec, applied on the next tick
    Modify(Box<EtcdCluster>),
    /// Tear the cluster down and exit the loop
    Delete,
}

/// The spec fields whose change is forwarded to the loop.
/// Every other field change is ignored to avoid spurious churn.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedFields {
    /// Desired member count
    size: usize,
    /// Target version
    version: String,
    /// Reconciliation suppressed
    paused: bool,
}

impl From<&EtcdCluster> for TrackedFields {
    fn from(resource: &EtcdCluster) -> Self {
        Self {
            size: resource.spec.size,
            version: resource.spec.version.clone(),
            paused: resource.spec.paused,
        }
    }
}

/// Cluster-independent knobs shared by every reconciler
#[derive(Debug, Clone)]
pub(crate) struct ClusterOptions {
    /// The kubernetes cluster dns suffix
    pub(crate) cluster_suffix: String,
    /// Interval between two reconciliation ticks
    pub(crate) reconcile_interval: Duration,
}

/// The external face of a running reconciliation loop
#[derive(Debug)]
pub(crate) struct ClusterHandle {
    /// Cluster name
    name: String,
    /// Spec fields last forwarded to the loop
    tracked: TrackedFields,
    /// Event intake of the loop
    events: Sender<ClusterEvent>,
}

impl ClusterHandle {
    /// Deliver a spec change. A change that does not touch size, version or
    /// paused is equivalent to no event.
    pub(crate) fn update(&mut self, resource: &EtcdCluster) {
        let tracked = TrackedFields::from(resource);
        if tracked == self.tracked {
            return;
        }
        self.tracked = tracked;
        self.send(ClusterEvent::Modify(Box::new(resource.clone())));
    }

    /// Ask the loop to tear the cluster down
    pub(crate) fn delete(&self) {
        self.send(ClusterEvent::Delete);
    }

    /// Non-blocking enqueue. A stopped loop drops the event, a full queue
    /// indicates a control-plane bug.
    fn send(&self, event: ClusterEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Disconnected(event)) => {
                debug!(
                    "cluster {}: loop already stopped, dropped {event:?}",
                    self.name
                );
            }
            Err(TrySendError::Full(event)) => {
                panic!(
                    "cluster {}: event queue overflowed, dropped {event:?}",
                    self.name
                );
            }
        }
    }
}

/// The per-cluster reconciliation core. All mutable state is owned by the
/// loop task, external input enters only through the event queue and the
/// shutdown channel.
pub(crate) struct Cluster {
    /// Latest known declarative resource, carries the spec and the resource
    /// version of the last status write
    resource: EtcdCluster,
    /// In-memory status, the core is its single writer
    status: ClusterStatus,
    /// The data-plane membership view of the last successful sync
    members: MemberSet,
    /// Name counter, strictly increasing for the cluster lifetime
    seq: u64,
    /// Cluster name
    name: String,
    /// Cluster namespace
    namespace: String,
    /// Orchestrator adapter
    k8s: K8sAdapter,
    /// Backup coordinator, attached when the spec carries a backup section
    backup: Option<Box<dyn BackupCoordinator>>,
    /// Event intake of the loop
    events: Receiver<ClusterEvent>,
    /// Process shutdown signal
    shutdown: watch::Receiver<()>,
    /// Interval between two reconciliation ticks
    reconcile_interval: Duration,
    /// The kubernetes cluster dns suffix
    cluster_suffix: String,
}

impl Cluster {
    /// Validate the spec, perform the one-time bootstrap and launch the
    /// reconciliation loop. Returns once the loop is running. A bootstrap
    /// failure aborts without starting the loop, partially created resources
    /// are not rolled back.
    pub(crate) async fn create(
        kube_client: Client,
        resource: EtcdCluster,
        options: ClusterOptions,
        shutdown: watch::Receiver<()>,
    ) -> Result<ClusterHandle, Error> {
        Self::start(kube_client, resource, options, shutdown, true).await
    }

    /// Like `create` but never seeds: the first tick observes zero live
    /// instances and enters disaster recovery.
    pub(crate) async fn restore(
        kube_client: Client,
        resource: EtcdCluster,
        options: ClusterOptions,
        shutdown: watch::Receiver<()>,
    ) -> Result<ClusterHandle, Error> {
        Self::start(kube_client, resource, options, shutdown, false).await
    }

    /// Shared construction of `create` and `restore`
    async fn start(
        kube_client: Client,
        resource: EtcdCluster,
        options: ClusterOptions,
        shutdown: watch::Receiver<()>,
        seed: bool,
    ) -> Result<ClusterHandle, Error> {
        resource
            .spec
            .validate_fields()
            .map_err(|report| Error::InvalidSpec(report.to_string()))?;
        let k8s = K8sAdapter::new(kube_client, &resource)?;
        let name = k8s.cluster_name().to_owned();
        let namespace = resource
            .metadata
            .namespace
            .clone()
            .ok_or(Error::MissingObject(".metadata.namespace"))?;
        let backup = backup::coordinator(&resource)?;
        if let Some(ref coordinator) = backup {
            coordinator.setup().await?;
        }
        let (event_tx, event_rx) = flume::bounded(EVENT_QUEUE_CAPACITY);
        let handle = ClusterHandle {
            name: name.clone(),
            tracked: TrackedFields::from(&resource),
            events: event_tx,
        };
        let mut cluster = Self {
            resource,
            status: ClusterStatus::default(),
            members: MemberSet::default(),
            seq: 0,
            name,
            namespace,
            k8s,
            backup,
            events: event_rx,
            shutdown,
            reconcile_interval: options.reconcile_interval,
            cluster_suffix: options.cluster_suffix,
        };
        if seed && cluster.resource.spec.restore.is_none() {
            cluster.bootstrap().await?;
        }
        cluster.k8s.create_client_service().await?;
        info!("cluster {}: reconciliation loop starting", cluster.name);
        let _loop = tokio::spawn(cluster.run());
        Ok(handle)
    }

    /// Create the seed member of a fresh cluster. The plain, the self-hosted
    /// and the boot-member paths are mutually exclusive and only chosen here.
    async fn bootstrap(&mut self) -> Result<(), Error> {
        match self.resource.spec.self_hosted.clone() {
            None => self.create_seed_member(false).await,
            Some(self_hosted) => match self_hosted.boot_member_client_endpoint {
                None => {
                    info!("cluster {}: fresh self-hosted bootstrap", self.name);
                    self.create_seed_member(false).await
                }
                Some(endpoint) => self.migrate_boot_member(&endpoint).await,
            },
        }
    }

    /// Create a seed member with a fresh bootstrap token. With
    /// `recover_from_backup` the instance installs the latest snapshot
    /// before etcd starts.
    async fn create_seed_member(&mut self, recover_from_backup: bool) -> Result<(), Error> {
        let name = member_name(&self.name, self.seq);
        let member = Member::new(&name, &self.namespace, &self.cluster_suffix);
        // the service goes first so that the peer url resolves at startup
        self.k8s.create_member_service(&name).await?;
        let recovery = if recover_from_backup {
            let Some(ref coordinator) = self.backup else {
                return Err(Error::NoBackup);
            };
            Some(coordinator.recovery_hint().await?)
        } else {
            None
        };
        let mut seed = MemberSet::default();
        seed.insert(member.clone());
        let plan = PodPlan {
            initial_cluster: seed.peer_url_pairs(),
            member,
            cluster_state: ClusterState::New,
            token: Some(Uuid::new_v4().to_string()),
            recovery,
        };
        self.k8s.create_member_pod(&plan).await?;
        self.members = seed;
        self.seq = self.seq.overflow_add(1);
        info!("cluster {}: seed member {name} created", self.name);
        Ok(())
    }

    /// Register the first managed member with an existing external boot
    /// member, then start its instance against that cluster. Subsequent
    /// growth goes through the regular membership reconciliation.
    async fn migrate_boot_member(&mut self, boot_endpoint: &str) -> Result<(), Error> {
        let name = member_name(&self.name, self.seq);
        let member = Member::new(&name, &self.namespace, &self.cluster_suffix);
        self.k8s.create_member_service(&name).await?;
        let added = etcd::member_add(&[boot_endpoint.to_owned()], member.peer_urls.clone()).await?;
        let mut members = MemberSet::default();
        for mut known in added.members {
            if known.name.is_empty() {
                // the new member publishes its name once its instance starts
                known.name = name.clone();
            }
            members.insert(known);
        }
        let plan = PodPlan {
            initial_cluster: members.peer_url_pairs(),
            member,
            cluster_state: ClusterState::Existing,
            token: None,
            recovery: None,
        };
        self.k8s.create_member_pod(&plan).await?;
        self.members = members;
        self.seq = self.seq.overflow_add(1);
        info!(
            "cluster {}: boot member at {boot_endpoint} adopted, first managed member {name} created",
            self.name
        );
        Ok(())
    }

    /// The reconciliation loop. Exits on the process shutdown signal (the
    /// cluster survives), on a delete event (the cluster is torn down) or on
    /// a fatal reconciliation error (the cluster is left for the operator).
    async fn run(mut self) {
        let mut tick = interval(self.reconcile_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        #[allow(clippy::integer_arithmetic)] // this error originates in the macro `tokio::select`
        let need_delete = loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("cluster {}: controller shutdown, owned resources survive", self.name);
                    break false;
                }
                event = self.events.recv_async() => match event {
                    Ok(ClusterEvent::Modify(resource)) => {
                        debug!("cluster {}: spec updated, applied on the next tick", self.name);
                        self.resource = *resource;
                    }
                    Ok(ClusterEvent::Delete) => {
                        info!("cluster {}: delete requested", self.name);
                        break true;
                    }
                    Err(_closed) => {
                        warn!("cluster {}: every event sender dropped without a delete", self.name);
                        break false;
                    }
                },
                _instant = tick.tick() => {
                    if self.tick_once().await {
                        break false;
                    }
                }
            }
        };
        self.teardown(need_delete).await;
    }

    /// One timer tick. Returns true when a fatal error terminated the loop.
    async fn tick_once(&mut self) -> bool {
        let timer = metrics::RECONCILE_DURATION.start_timer();
        let result = self.reconcile_once().await;
        drop(timer);
        let fatal = match result {
            Ok(()) => false,
            Err(ref err) if err.is_not_ready() => {
                debug!("cluster {}: {err}", self.name);
                false
            }
            Err(ref err) if err.is_fatal() => {
                error!("cluster {}: {err}", self.name);
                self.status.phase = ClusterPhase::Failed;
                self.status.reason = err.failure_reason();
                true
            }
            Err(err) => {
                warn!("cluster {}: {err}, retrying on the next tick", self.name);
                metrics::RECONCILE_FAILED_COUNT
                    .with_label_values(&[err.label()])
                    .inc();
                false
            }
        };
        self.persist_status().await;
        fatal
    }

    /// Persist the in-memory status, best-effort. The updated resource is
    /// stored back so that the next write carries the right resource version.
    async fn persist_status(&mut self) {
        if self.resource.status.as_ref() == Some(&self.status) {
            return;
        }
        self.resource.status = Some(self.status.clone());
        match self.k8s.update_status(&self.resource).await {
            Ok(updated) => self.resource = updated,
            Err(err) => {
                warn!("cluster {}: status update failed: {err}", self.name);
                // a stale resource version cannot win the next write
                if let Ok(fresh) = self.k8s.latest().await {
                    self.resource.metadata.resource_version = fresh.metadata.resource_version;
                }
            }
        }
    }

    /// Deferred teardown after the loop exits. With `need_delete` every owned
    /// orchestrator resource and the backup context are destroyed,
    /// best-effort. The closing status write retries until it succeeds, a
    /// deleted resource counts as success.
    async fn teardown(mut self, need_delete: bool) {
        if need_delete {
            info!("cluster {}: tearing down owned resources", self.name);
            match self.k8s.list_pods().await {
                Ok(pods) => {
                    for pod in pods {
                        if let Err(err) = self.k8s.delete_pod(&pod.name).await {
                            warn!(
                                "cluster {}: failed to delete instance {}: {err}",
                                self.name, pod.name
                            );
                        }
                    }
                }
                Err(err) => warn!("cluster {}: failed to list instances: {err}", self.name),
            }
            match self.k8s.list_services().await {
                Ok(services) => {
                    for service in services {
                        if let Err(err) = self.k8s.delete_service(&service).await {
                            warn!(
                                "cluster {}: failed to delete service {service}: {err}",
                                self.name
                            );
                        }
                    }
                }
                Err(err) => warn!("cluster {}: failed to list services: {err}", self.name),
            }
            if let Err(err) = self.k8s.delete_client_service().await {
                warn!(
                    "cluster {}: failed to delete the client service: {err}",
                    self.name
                );
            }
            if let Some(ref coordinator) = self.backup {
                if let Err(err) = coordinator.cleanup().await {
                    warn!("cluster {}: backup cleanup failed: {err}", self.name);
                }
            }
        }
        // the closing write, the loop of this cluster never runs again
        self.status.phase = ClusterPhase::Failed;
        self.resource.status = Some(self.status.clone());
        loop {
            match self.k8s.update_status(&self.resource).await {
                Ok(_updated) => break,
                Err(err) => {
                    warn!(
                        "cluster {}: closing status update failed: {err}",
                        self.name
                    );
                    if let Ok(fresh) = self.k8s.latest().await {
                        self.resource.metadata.resource_version = fresh.metadata.resource_version;
                    }
                    sleep(STATUS_RETRY_INTERVAL).await;
                }
            }
        }
        info!("cluster {}: reconciliation loop closed", self.name);
    }
}

#[cfg(test)]
mod test {
    use crd_api::ClusterSpec;
    use flume::TryRecvError;

    use super::{ClusterEvent, ClusterHandle, EtcdCluster, TrackedFields, EVENT_QUEUE_CAPACITY};

    fn resource(size: usize, version: &str, paused: bool) -> EtcdCluster {
        let mut cluster = EtcdCluster::new(
            "my-etcd",
            ClusterSpec {
                size,
                version: version.to_owned(),
                repository: None,
                paused,
                backup: None,
                restore: None,
                self_hosted: None,
            },
        );
        cluster.metadata.namespace = Some("default".to_owned());
        cluster
    }

    fn test_handle(
        capacity: usize,
        first: &EtcdCluster,
    ) -> (ClusterHandle, flume::Receiver<ClusterEvent>) {
        let (events, rx) = flume::bounded(capacity);
        (
            ClusterHandle {
                name: "my-etcd".to_owned(),
                tracked: TrackedFields::from(first),
                events,
            },
            rx,
        )
    }

    #[test]
    fn modify_without_a_tracked_change_is_no_event() {
        let initial = resource(3, "3.2.13", false);
        let (mut handle, rx) = test_handle(EVENT_QUEUE_CAPACITY, &initial);

        let mut untracked = resource(3, "3.2.13", false);
        untracked.spec.repository = Some("registry.local/etcd".to_owned());
        handle.update(&untracked);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let resized = resource(5, "3.2.13", false);
        handle.update(&resized);
        assert!(matches!(rx.try_recv(), Ok(ClusterEvent::Modify(_))));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let paused = resource(5, "3.2.13", true);
        handle.update(&paused);
        assert!(matches!(rx.try_recv(), Ok(ClusterEvent::Modify(_))));

        let upgraded = resource(5, "3.3.0", true);
        handle.update(&upgraded);
        assert!(matches!(rx.try_recv(), Ok(ClusterEvent::Modify(_))));
    }

    #[test]
    fn delete_twice_is_equivalent_to_once() {
        let initial = resource(3, "3.2.13", false);
        let (handle, rx) = test_handle(EVENT_QUEUE_CAPACITY, &initial);
        handle.delete();
        assert!(matches!(rx.try_recv(), Ok(ClusterEvent::Delete)));
        drop(rx); // the loop is gone
        handle.delete();
    }

    #[test]
    #[should_panic(expected = "event queue")]
    fn full_queue_is_a_control_plane_bug() {
        let initial = resource(3, "3.2.13", false);
        let (handle, _rx) = test_handle(1, &initial);
        handle.delete();
        handle.delete();
    }
}
