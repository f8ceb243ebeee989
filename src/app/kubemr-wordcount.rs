//! Worker pod entrypoint running the word-count workload.

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use kubemr::cmd::worker::Args;
use kubemr::worker::Runner;
use kubemr::workload;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,kubemr=debug".into()),
        )
        .init();
    let args = Args::parse();

    let worker = workload::named("wordcount")?;
    match Runner::from_env(args.apiserver.as_deref(), args.kubeconfig.as_deref()).await {
        Ok(mut runner) => {
            if let Err(err) = runner.run(worker.as_ref()).await {
                error!("worker finished with: {err:#}");
            }
        }
        // a terminal job at startup is not our problem to report loudly
        Err(err) => error!("{err:#}"),
    }
    // Terminate successfully so the batch controller reaps the pod
    Ok(())
}
