use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use crd_api::EtcdCluster;
use futures::{FutureExt, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::runtime::wait::{await_condition, conditions};
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::{is_already_exists, Cluster, ClusterHandle, ClusterOptions};
use crate::config::{Config, Namespace};
use crate::metrics;
use crate::router;

/// wait crd to establish timeout
const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(20);

/// Etcd operator for k8s
#[derive(Debug)]
pub struct Operator {
    /// Config of this operator
    config: Config,
}

impl Operator {
    /// Constructor
    #[inline]
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run operator
    ///
    /// # Errors
    ///
    /// Return `Err` when run failed
    #[inline]
    pub async fn run(&self) -> Result<()> {
        let kube_client: Client = Client::try_default().await?;
        self.prepare_crd(&kube_client).await?;
        metrics::init();
        let cluster_api: Api<EtcdCluster> = match self.config.namespace {
            Namespace::Single(ref namespace) => {
                Api::namespaced(kube_client.clone(), namespace.as_str())
            }
            Namespace::ClusterWide => Api::all(kube_client.clone()),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let forceful_shutdown = async {
            info!("press ctrl+c to shut down gracefully");
            let _ctrl_c = signal::ctrl_c().await;
            let _ig = shutdown_tx.send(());
            info!("graceful shutdown already requested, press ctrl+c again to force shut down");
            let _ctrl_c_c = signal::ctrl_c().await;
        };

        let web_server = self.web_server();
        let route_task = self.route_clusters(kube_client, cluster_api, shutdown_rx);

        tokio::pin!(forceful_shutdown);
        tokio::pin!(web_server);
        tokio::pin!(route_task);

        let mut web_server_shutdown = false;
        let mut route_shutdown = false;

        #[allow(clippy::integer_arithmetic)] // required by tokio::select
        loop {
            tokio::select! {
                _ = &mut forceful_shutdown => {
                    warn!("forceful shutdown");
                    break
                }
                res = &mut route_task, if !route_shutdown => {
                    res?;
                    route_shutdown = true;
                    info!("cluster routing graceful shutdown");
                }
                res = &mut web_server, if !web_server_shutdown => {
                    res?;
                    web_server_shutdown = true;
                    info!("web server graceful shutdown");
                }
            }

            if web_server_shutdown && route_shutdown {
                break;
            }
        }

        Ok(())
    }

    /// Create the CRD if it does not already exist, then wait until the
    /// apiserver establishes it
    async fn prepare_crd(&self, kube_client: &Client) -> Result<()> {
        if !self.config.create_crd {
            debug!("--create-crd set to false, skip creating the CRD");
            return Ok(());
        }
        let crd_api: Api<CustomResourceDefinition> = Api::all(kube_client.clone());
        let definition = EtcdCluster::crd();
        if let Err(err) = crd_api.create(&PostParams::default(), &definition).await {
            if !is_already_exists(&err) {
                return Err(err.into());
            }
            debug!("the EtcdCluster CRD already exists");
        }
        let establish = await_condition(
            crd_api,
            EtcdCluster::crd_name(),
            conditions::is_crd_established(),
        );
        let _crd = tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, establish).await??;
        debug!("crd established");
        Ok(())
    }

    /// Watch the `EtcdCluster` resources and route every change to its
    /// cluster core, one reconciliation loop per cluster
    async fn route_clusters(
        &self,
        kube_client: Client,
        cluster_api: Api<EtcdCluster>,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<()> {
        let options = ClusterOptions {
            cluster_suffix: self.config.cluster_suffix.clone(),
            reconcile_interval: Duration::from_secs(self.config.reconcile_interval),
        };
        let loop_shutdown = shutdown.clone();
        let mut handles: HashMap<String, ClusterHandle> = HashMap::new();
        let mut stream = watcher(cluster_api, watcher::Config::default()).boxed();
        loop {
            #[allow(clippy::integer_arithmetic)] // required by tokio::select
            tokio::select! {
                _ = shutdown.changed() => break,
                event = stream.next() => match event {
                    Some(Ok(Event::Applied(resource))) => {
                        on_applied(&kube_client, resource, &mut handles, &options, &loop_shutdown)
                            .await;
                    }
                    Some(Ok(Event::Deleted(resource))) => {
                        let name = resource.name_any();
                        if let Some(handle) = handles.remove(&name) {
                            handle.delete();
                            metrics::MANAGED_CLUSTERS.dec();
                        }
                    }
                    Some(Ok(Event::Restarted(resources))) => {
                        for resource in resources {
                            on_applied(&kube_client, resource, &mut handles, &options, &loop_shutdown)
                                .await;
                        }
                    }
                    Some(Err(err)) => warn!("cluster watch error: {err}"),
                    None => break,
                },
            }
        }
        Ok(())
    }

    /// Run a server that exposes the operator metrics and health
    async fn web_server(&self) -> Result<()> {
        let app = Router::new()
            .route("/metrics", get(router::metrics))
            .route("/healthz", get(router::healthz));

        axum::Server::bind(&self.config.listen_addr.parse()?)
            .serve(app.into_make_service())
            .with_graceful_shutdown(signal::ctrl_c().map(|_| ()))
            .await?;

        Ok(())
    }
}

/// A resource appeared or changed. A known cluster gets the change routed to
/// its loop, an unknown one gets a fresh core. A cluster carrying the restore
/// marker recovers from its snapshots instead of bootstrapping.
async fn on_applied(
    kube_client: &Client,
    resource: EtcdCluster,
    handles: &mut HashMap<String, ClusterHandle>,
    options: &ClusterOptions,
    shutdown: &watch::Receiver<()>,
) {
    let name = resource.name_any();
    if let Some(handle) = handles.get_mut(&name) {
        handle.update(&resource);
        return;
    }
    debug!("cluster {name}: spawning a reconciliation loop");
    let created = if resource.spec.restore.is_some() {
        Cluster::restore(kube_client.clone(), resource, options.clone(), shutdown.clone()).await
    } else {
        Cluster::create(kube_client.clone(), resource, options.clone(), shutdown.clone()).await
    };
    match created {
        Ok(handle) => {
            metrics::MANAGED_CLUSTERS.inc();
            let _prev = handles.insert(name, handle);
        }
        Err(err) => error!("cluster {name}: create failed: {err}"),
    }
}
