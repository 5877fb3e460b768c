use std::collections::BTreeMap;
use std::sync::Arc;

use crd_api::EtcdCluster;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};

use crate::consts::{
    BACKUP_DIR, BACKUP_VOLUME_NAME, CLIENT_PORT_NAME, DATA_DIR, DATA_MOUNT_DIR, DATA_VOLUME_NAME,
    DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT, ETCD_CONTAINER_NAME, LABEL_CLUSTER_MEMBER,
    LABEL_CLUSTER_NAME, LABEL_OPERATOR_VERSION, PEER_PORT_NAME,
};

use super::backup::RecoveryHint;
use super::member::Member;
use super::Error;

/// `--initial-cluster-state` of a new instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClusterState {
    /// The instance bootstraps a brand new cluster
    New,
    /// The instance joins a cluster that already exists
    Existing,
}

impl ClusterState {
    /// The flag value
    fn flag(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Existing => "existing",
        }
    }
}

/// Everything needed to create one member instance
#[derive(Debug)]
pub(crate) struct PodPlan {
    /// The member backing this instance
    pub(crate) member: Member,
    /// The bootstrap peer list, `name=peer_url` pairs
    pub(crate) initial_cluster: String,
    /// Whether the instance bootstraps or joins
    pub(crate) cluster_state: ClusterState,
    /// Bootstrap token, set only for a genuine bootstrap
    pub(crate) token: Option<String>,
    /// Restore instruction, the instance installs a snapshot before etcd starts
    pub(crate) recovery: Option<RecoveryHint>,
}

/// Builds the kubernetes objects of one cluster
pub(crate) struct Factory {
    /// `EtcdCluster`
    resource: Arc<EtcdCluster>,
}

impl Factory {
    /// Constructor
    pub(crate) fn new(resource: Arc<EtcdCluster>) -> Self {
        Self { resource }
    }

    /// The name of the client-facing load-balanced service
    pub(crate) fn client_service_name(cluster_name: &str) -> String {
        format!("{cluster_name}-client")
    }

    /// Extract name, namespace
    pub(crate) fn extract_id(&self) -> Result<(&str, &str), Error> {
        let name = self
            .resource
            .metadata
            .name
            .as_deref()
            .ok_or(Error::MissingObject(".metadata.name"))?;
        let namespace = self
            .resource
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingObject(".metadata.namespace"))?;
        Ok((name, namespace))
    }

    /// Extract owner reference
    fn extract_owner_ref(&self) -> OwnerReference {
        // unwrap controller_owner_ref is always safe
        let Some(owner_ref) = self.resource.controller_owner_ref(&()) else {
            unreachable!("kube-runtime has undergone some changes.")
        };
        owner_ref
    }

    /// The labels identifying this cluster's subresources, extended with the
    /// member name for per-member objects
    fn selector_labels(cluster_name: &str, member: Option<&str>) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([(
            LABEL_CLUSTER_NAME.to_owned(),
            cluster_name.to_owned(),
        )]);
        if let Some(member) = member {
            let _prev = labels.insert(LABEL_CLUSTER_MEMBER.to_owned(), member.to_owned());
        }
        labels
    }

    /// Build the metadata shared by all subresources
    fn general_metadata(&self, object_name: String, member: Option<&str>) -> Result<ObjectMeta, Error> {
        let (name, namespace) = self.extract_id()?;
        let owner_ref = self.extract_owner_ref();
        let mut labels = Self::selector_labels(name, member);
        let _prev = labels.insert(
            LABEL_OPERATOR_VERSION.to_owned(),
            env!("CARGO_PKG_VERSION").to_owned(),
        );
        Ok(ObjectMeta {
            labels: Some(labels),
            name: Some(object_name),
            namespace: Some(namespace.to_owned()), // all subresources share the same namespace
            owner_references: Some(vec![owner_ref]), // allow k8s GC to automatically clean up itself
            ..ObjectMeta::default()
        })
    }

    /// The per-member service, the stable network identity of one member.
    /// It publishes addresses before readiness so that peer DNS resolves
    /// while the instance is still starting.
    pub(crate) fn member_service(&self, member: &str) -> Result<Service, Error> {
        let (name, _) = self.extract_id()?;
        Ok(Service {
            metadata: self.general_metadata(member.to_owned(), Some(member))?,
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    ServicePort {
                        name: Some(CLIENT_PORT_NAME.to_owned()),
                        port: DEFAULT_CLIENT_PORT,
                        ..ServicePort::default()
                    },
                    ServicePort {
                        name: Some(PEER_PORT_NAME.to_owned()),
                        port: DEFAULT_PEER_PORT,
                        ..ServicePort::default()
                    },
                ]),
                selector: Some(Self::selector_labels(name, Some(member))),
                publish_not_ready_addresses: Some(true),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        })
    }

    /// The client-facing service routing to any member
    pub(crate) fn client_service(&self) -> Result<Service, Error> {
        let (name, _) = self.extract_id()?;
        Ok(Service {
            metadata: self.general_metadata(Self::client_service_name(name), None)?,
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some(CLIENT_PORT_NAME.to_owned()),
                    port: DEFAULT_CLIENT_PORT,
                    ..ServicePort::default()
                }]),
                selector: Some(Self::selector_labels(name, None)),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        })
    }

    /// The workload instance of one member
    pub(crate) fn member_pod(&self, plan: &PodPlan) -> Result<Pod, Error> {
        let member = &plan.member;
        let spec = &self.resource.spec;
        let peer = member.peer_urls.join(",");
        let client = member.client_urls.join(",");

        let mut etcd_cmd = format!(
            "/usr/local/bin/etcd --data-dir {DATA_DIR} --name {} \
             --initial-advertise-peer-urls {peer} \
             --listen-peer-urls http://0.0.0.0:{DEFAULT_PEER_PORT} \
             --listen-client-urls http://0.0.0.0:{DEFAULT_CLIENT_PORT} \
             --advertise-client-urls {client} \
             --initial-cluster {} \
             --initial-cluster-state {}",
            member.name,
            plan.initial_cluster,
            plan.cluster_state.flag(),
        );
        if let Some(ref token) = plan.token {
            etcd_cmd = format!("{etcd_cmd} --initial-cluster-token {token}");
        }

        let data_mount = VolumeMount {
            mount_path: DATA_MOUNT_DIR.to_owned(),
            name: DATA_VOLUME_NAME.to_owned(),
            ..VolumeMount::default()
        };
        let mut volumes = vec![Volume {
            name: DATA_VOLUME_NAME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        }];

        let init_containers = plan
            .recovery
            .as_ref()
            .map(|hint| {
                volumes.push(Volume {
                    name: BACKUP_VOLUME_NAME.to_owned(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: hint.claim_name.clone(),
                        ..PersistentVolumeClaimVolumeSource::default()
                    }),
                    ..Volume::default()
                });
                let restore_cmd = format!(
                    "ETCDCTL_API=3 etcdctl snapshot restore {} --name {} \
                     --initial-cluster {} --initial-advertise-peer-urls {peer} \
                     --data-dir {DATA_DIR}",
                    hint.snapshot_path.display(),
                    member.name,
                    plan.initial_cluster,
                );
                vec![Container {
                    name: "restore-snapshot".to_owned(),
                    image: Some(spec.image()),
                    command: Some(vec!["/bin/sh".to_owned(), "-ecx".to_owned(), restore_cmd]),
                    volume_mounts: Some(vec![
                        data_mount.clone(),
                        VolumeMount {
                            mount_path: BACKUP_DIR.to_owned(),
                            name: BACKUP_VOLUME_NAME.to_owned(),
                            ..VolumeMount::default()
                        },
                    ]),
                    ..Container::default()
                }]
            });

        let etcd = Container {
            name: ETCD_CONTAINER_NAME.to_owned(),
            image: Some(spec.image()),
            command: Some(etcd_cmd.split_whitespace().map(ToOwned::to_owned).collect()),
            ports: Some(vec![
                ContainerPort {
                    name: Some(CLIENT_PORT_NAME.to_owned()),
                    container_port: DEFAULT_CLIENT_PORT,
                    ..ContainerPort::default()
                },
                ContainerPort {
                    name: Some(PEER_PORT_NAME.to_owned()),
                    container_port: DEFAULT_PEER_PORT,
                    ..ContainerPort::default()
                },
            ]),
            volume_mounts: Some(vec![data_mount]),
            ..Container::default()
        };

        Ok(Pod {
            metadata: self.general_metadata(member.name.clone(), Some(&member.name))?,
            spec: Some(PodSpec {
                init_containers,
                containers: vec![etcd],
                volumes: Some(volumes),
                // the reconciler decides when an instance comes back
                restart_policy: Some("Never".to_owned()),
                ..PodSpec::default()
            }),
            ..Pod::default()
        })
    }
}

/// A one-line view of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PodSummary {
    /// Instance name
    pub(crate) name: String,
    /// Instance phase reported by the orchestrator
    pub(crate) phase: String,
    /// The version the instance runs, parsed from its image tag
    pub(crate) version: Option<String>,
}

/// Summarize an instance into the view the reconciler works with
fn summarize(pod: Pod) -> PodSummary {
    let name = pod.name_any();
    let phase = pod
        .status
        .and_then(|status| status.phase)
        .unwrap_or_else(|| "Unknown".to_owned());
    let version = pod
        .spec
        .and_then(|spec| {
            spec.containers
                .into_iter()
                .find(|container| container.name == ETCD_CONTAINER_NAME)
        })
        .and_then(|container| container.image)
        .and_then(|image| image_tag(&image));
    PodSummary {
        name,
        phase,
        version,
    }
}

/// The tag of a container image, `None` when the image is untagged
fn image_tag(image: &str) -> Option<String> {
    image
        .rsplit_once(':')
        .and_then(|(_, tag)| (!tag.contains('/')).then(|| tag.to_owned()))
}

/// Whether the orchestrator error means "already exists".
/// Callers treat it as success.
pub(crate) fn is_already_exists(err: &kube::Error) -> bool {
    matches!(*err, kube::Error::Api(ref response) if response.reason == "AlreadyExists")
}

/// Whether the orchestrator error means "not found".
/// Callers treat it as success.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(*err, kube::Error::Api(ref response) if response.code == 404)
}

/// Orchestrator adapter of one cluster. Create and delete are idempotent,
/// every other error propagates to the reconciler which retries on the next
/// tick.
pub(crate) struct K8sAdapter {
    /// Pods api scoped to the cluster namespace
    pods: Api<Pod>,
    /// Services api scoped to the cluster namespace
    services: Api<Service>,
    /// `EtcdCluster` api, carries the status writes
    clusters: Api<EtcdCluster>,
    /// Object builders
    factory: Factory,
    /// The cluster name
    cluster_name: String,
}

impl K8sAdapter {
    /// Constructor
    pub(crate) fn new(kube_client: Client, resource: &EtcdCluster) -> Result<Self, Error> {
        let factory = Factory::new(Arc::new(resource.clone()));
        let (name, namespace) = factory.extract_id()?;
        let (name, namespace) = (name.to_owned(), namespace.to_owned());
        Ok(Self {
            pods: Api::namespaced(kube_client.clone(), &namespace),
            services: Api::namespaced(kube_client.clone(), &namespace),
            clusters: Api::namespaced(kube_client, &namespace),
            factory,
            cluster_name: name,
        })
    }

    /// The cluster this adapter works for
    pub(crate) fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// The label selector of this cluster's subresources
    fn label_selector(&self) -> String {
        format!("{LABEL_CLUSTER_NAME}={}", self.cluster_name)
    }

    /// Create the per-member service of `member`
    pub(crate) async fn create_member_service(&self, member: &str) -> Result<(), Error> {
        let service = self.factory.member_service(member)?;
        match self.services.create(&PostParams::default(), &service).await {
            Ok(_created) => Ok(()),
            Err(ref err) if is_already_exists(err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a service
    pub(crate) async fn delete_service(&self, name: &str) -> Result<(), Error> {
        match self.services.delete(name, &DeleteParams::default()).await {
            Ok(_deleted) => Ok(()),
            Err(ref err) if is_not_found(err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Create the workload instance described by `plan`.
    /// The per-member service must exist beforehand so that the peer url
    /// resolves when etcd starts.
    pub(crate) async fn create_member_pod(&self, plan: &PodPlan) -> Result<(), Error> {
        let pod = self.factory.member_pod(plan)?;
        match self.pods.create(&PostParams::default(), &pod).await {
            Ok(_created) => Ok(()),
            Err(ref err) if is_already_exists(err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a workload instance
    pub(crate) async fn delete_pod(&self, name: &str) -> Result<(), Error> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_deleted) => Ok(()),
            Err(ref err) if is_not_found(err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// All instances labeled for this cluster
    pub(crate) async fn list_pods(&self) -> Result<Vec<PodSummary>, Error> {
        let params = ListParams::default().labels(&self.label_selector());
        let pods = self.pods.list(&params).await?;
        Ok(pods.items.into_iter().map(summarize).collect())
    }

    /// The names of all services labeled for this cluster,
    /// the client service included
    pub(crate) async fn list_services(&self) -> Result<Vec<String>, Error> {
        let params = ListParams::default().labels(&self.label_selector());
        let services = self.services.list(&params).await?;
        Ok(services.items.iter().map(ResourceExt::name_any).collect())
    }

    /// Publish the client-facing load-balanced service
    pub(crate) async fn create_client_service(&self) -> Result<(), Error> {
        let service = self.factory.client_service()?;
        match self.services.create(&PostParams::default(), &service).await {
            Ok(_created) => Ok(()),
            Err(ref err) if is_already_exists(err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the client-facing load-balanced service
    pub(crate) async fn delete_client_service(&self) -> Result<(), Error> {
        self.delete_service(&Factory::client_service_name(&self.cluster_name))
            .await
    }

    /// Persist the status subresource. The returned resource carries the
    /// fresh resource version, the caller stores it so the next write wins
    /// the optimistic concurrency check. A deleted resource counts as
    /// persisted.
    pub(crate) async fn update_status(&self, resource: &EtcdCluster) -> Result<EtcdCluster, Error> {
        let data = serde_json::to_vec(resource)?;
        match self
            .clusters
            .replace_status(&self.cluster_name, &PostParams::default(), data)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(ref err) if is_not_found(err) => Ok(resource.clone()),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch the latest version of the declarative resource
    pub(crate) async fn latest(&self) -> Result<EtcdCluster, Error> {
        Ok(self.clusters.get(&self.cluster_name).await?)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::{Container, Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::cluster::backup::RecoveryHint;
    use crate::cluster::member::Member;

    use super::{
        image_tag, summarize, ClusterState, EtcdCluster, Factory, PodPlan, PodSummary,
    };

    static CLUSTER: &str = r#"
apiVersion: etcdoperator.etcd.io/v1
kind: EtcdCluster
metadata:
  name: my-etcd
spec:
  size: 3
  version: "3.2.13"
    "#;

    fn after_apiserver(cluster: &mut EtcdCluster) {
        cluster.metadata.namespace = Some("default".to_owned());
        cluster.metadata.uid = Some("this-is-a-random-uid".to_owned());
    }

    fn factory() -> Factory {
        let mut cluster: EtcdCluster = serde_yaml::from_str(CLUSTER).unwrap();
        after_apiserver(&mut cluster);
        Factory::new(Arc::new(cluster))
    }

    fn plan(state: ClusterState, token: Option<&str>, recovery: Option<RecoveryHint>) -> PodPlan {
        let member = Member::new("my-etcd-0000", "default", "cluster.local");
        PodPlan {
            initial_cluster: format!("my-etcd-0000={}", member.peer_urls[0]),
            member,
            cluster_state: state,
            token: token.map(ToOwned::to_owned),
            recovery,
        }
    }

    #[test]
    fn member_service_should_resolve_before_ready() {
        let service = factory().member_service("my-etcd-0000").unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("my-etcd-0000"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        let selector = spec.selector.unwrap();
        assert_eq!(selector["etcdcluster/name"], "my-etcd");
        assert_eq!(selector["etcdcluster/member"], "my-etcd-0000");
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 2379);
        assert_eq!(ports[1].port, 2380);
    }

    #[test]
    fn client_service_should_select_every_member() {
        let service = factory().client_service().unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("my-etcd-client"));
        let spec = service.spec.unwrap();
        assert!(spec.publish_not_ready_addresses.is_none());
        let selector = spec.selector.unwrap();
        assert_eq!(selector["etcdcluster/name"], "my-etcd");
        assert!(!selector.contains_key("etcdcluster/member"));
        assert_eq!(spec.ports.unwrap().len(), 1);
    }

    #[test]
    fn seed_pod_should_carry_bootstrap_flags() {
        let pod = factory()
            .member_pod(&plan(ClusterState::New, Some("a-bootstrap-token"), None))
            .unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("my-etcd-0000"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert!(spec.init_containers.is_none());
        let command = spec.containers[0].command.clone().unwrap().join(" ");
        assert!(command.contains("--initial-cluster-state new"));
        assert!(command.contains("--initial-cluster-token a-bootstrap-token"));
        assert!(command.contains(
            "--initial-cluster my-etcd-0000=http://my-etcd-0000.default.svc.cluster.local:2380"
        ));
        assert_eq!(
            spec.containers[0].image.as_deref(),
            Some("quay.io/coreos/etcd:v3.2.13")
        );
    }

    #[test]
    fn joining_pod_should_not_carry_a_token() {
        let pod = factory()
            .member_pod(&plan(ClusterState::Existing, None, None))
            .unwrap();
        let command = pod.spec.unwrap().containers[0]
            .command
            .clone()
            .unwrap()
            .join(" ");
        assert!(command.contains("--initial-cluster-state existing"));
        assert!(!command.contains("--initial-cluster-token"));
    }

    #[test]
    fn recovering_pod_should_restore_before_etcd_starts() {
        let hint = RecoveryHint {
            snapshot_path: "/etcd-backup/my-etcd/my-etcd.7.etcd.backup".into(),
            claim_name: "backup-pvc".to_owned(),
        };
        let pod = factory()
            .member_pod(&plan(ClusterState::New, Some("token"), Some(hint)))
            .unwrap();
        let spec = pod.spec.unwrap();
        let inits = spec.init_containers.unwrap();
        let init = &inits[0];
        assert_eq!(init.name, "restore-snapshot");
        let restore = init.command.clone().unwrap().join(" ");
        assert!(restore.contains("snapshot restore /etcd-backup/my-etcd/my-etcd.7.etcd.backup"));
        assert!(restore.contains("--data-dir /var/etcd/data"));
        let volumes = spec.volumes.unwrap();
        assert!(volumes
            .iter()
            .any(|volume| volume.persistent_volume_claim.as_ref().is_some_and(
                |claim| claim.claim_name == "backup-pvc"
            )));
    }

    #[test]
    fn summarize_should_read_phase_and_version() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("my-etcd-0002".to_owned()),
                ..ObjectMeta::default()
            },
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                containers: vec![Container {
                    name: "etcd".to_owned(),
                    image: Some("quay.io/coreos/etcd:v3.1.0".to_owned()),
                    ..Container::default()
                }],
                ..k8s_openapi::api::core::v1::PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_owned()),
                ..PodStatus::default()
            }),
        };
        assert_eq!(
            summarize(pod),
            PodSummary {
                name: "my-etcd-0002".to_owned(),
                phase: "Running".to_owned(),
                version: Some("v3.1.0".to_owned()),
            }
        );
    }

    #[test]
    fn image_tag_should_ignore_registry_ports() {
        assert_eq!(image_tag("quay.io/coreos/etcd:v3.2.13").as_deref(), Some("v3.2.13"));
        assert_eq!(image_tag("registry:5000/etcd").as_deref(), None);
        assert_eq!(image_tag("etcd").as_deref(), None);
    }
}
