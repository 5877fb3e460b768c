use clap::Parser;

/// Etcd operator config
#[derive(Debug, Parser)]
#[non_exhaustive]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The namespace to work, default to cluster wide
    #[arg(long, value_parser = namespace_mode_parser, default_value = "")]
    pub namespace: Namespace,
    /// The address on which the metrics HTTP server will listen to
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen_addr: String,
    /// Whether to create the CRD upon startup
    #[arg(long, default_value = "false")]
    pub create_crd: bool,
    /// The kubernetes cluster DNS suffix
    #[arg(long, default_value = "cluster.local")]
    pub cluster_suffix: String,
    /// Interval between two reconciliation ticks of a cluster [unit: seconds]
    #[arg(long, default_value = "5")]
    pub reconcile_interval: u64,
}

/// The namespace to work, `ClusterWide` means work with all namespaces
#[allow(clippy::exhaustive_enums)] // it is clear that this enum is exhaustive
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Namespace {
    /// A single namespace
    Single(String),
    /// All namespaces
    ClusterWide,
}

/// parse namespace mode
#[allow(clippy::unnecessary_wraps)] // required by clap
fn namespace_mode_parser(value: &str) -> Result<Namespace, String> {
    if value.is_empty() {
        return Ok(Namespace::ClusterWide);
    }
    Ok(Namespace::Single(value.to_owned()))
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::{Config, Namespace};

    #[test]
    fn parse_default_config() {
        let config = Config::parse_from(["etcd-operator"]);
        assert_eq!(config.namespace, Namespace::ClusterWide);
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert!(!config.create_crd);
        assert_eq!(config.cluster_suffix, "cluster.local");
        assert_eq!(config.reconcile_interval, 5);
    }

    #[test]
    fn parse_single_namespace() {
        let config = Config::parse_from([
            "etcd-operator",
            "--namespace=default",
            "--reconcile-interval=7",
        ]);
        assert_eq!(config.namespace, Namespace::Single("default".to_owned()));
        assert_eq!(config.reconcile_interval, 7);
    }
}
