use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kubemr::cmd::operator::Args;
use kubemr::job::{Config, Credentials};
use kubemr::operator::Operator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,kubemr=debug".into()),
        )
        .init();
    let args = Args::parse();
    info!("operator starting");

    let cfg = Config::from_env();
    cfg.validate()?;
    let client = kubemr::k8s::client(args.apiserver.as_deref(), args.kubeconfig.as_deref()).await?;
    let operator = Operator::new(client, cfg, Credentials::from_env());
    operator.run().await
}
