//! etcd-operator

use anyhow::Result;
use clap::Parser;
use etcd_operator::config::Config;
use etcd_operator::operator::Operator;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    debug!("{:?}", config);

    Operator::new(config).run().await
}
