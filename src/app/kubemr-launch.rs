//! In-process launcher: reads a job document, deploys the worker pods and
//! runs the embedded coordination server until the job is done, printing
//! the results on stdout.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use k8s_openapi::api::batch::v1::{Job as BatchJob, JobSpec as BatchJobSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kubemr::cmd::launch::Args;
use kubemr::job::{server, Config, MapReduceJob};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,kubemr=debug".into()),
        )
        .init();
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.jobfile)
        .with_context(|| format!("reading {}", args.jobfile))?;
    let jb: MapReduceJob = serde_json::from_str(&raw).context("parsing job document")?;
    if jb.name.is_empty() {
        bail!("A name must be provided");
    }
    jb.spec.validate()?;

    let mut cfg = Config::from_env();
    cfg.validate()?;

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    let port = listener.local_addr()?.port();
    let advertise = args
        .advertise
        .clone()
        .or_else(|| std::env::var("MY_POD_IP").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    cfg.job_url = format!("http://{advertise}:{port}/{}/", jb.name);
    info!("job url is {}", cfg.job_url);

    let client =
        kubemr::k8s::client(args.apiserver.as_deref(), args.kubeconfig.as_deref()).await?;
    let batch = deploy(&client, &jb, &cfg).await?;

    let outcome = server::run(jb, listener, Duration::from_secs(args.timeout)).await;

    // Worker pods go away no matter how the job ended
    cleanup(&client, &batch).await;

    let results = outcome?;
    println!("{}", serde_json::to_string(&results)?);
    Ok(())
}

/// Materializes the batch job: the user template, restart-on-failure, and
/// the coordination URL plus object-store wiring in every container. The
/// template is expected to carry the S3 credentials itself.
async fn deploy(client: &Client, jb: &MapReduceJob, cfg: &Config) -> Result<BatchJob> {
    let spec = jb.spec.validate()?;
    let mut template = spec.template.clone().unwrap_or_default();
    let pod_spec = template.spec.as_mut().context("template has no pod spec")?;
    pod_spec.restart_policy = Some("OnFailure".to_string());
    for container in &mut pod_spec.containers {
        let mut env = container.env.take().unwrap_or_default();
        env.extend(cfg.pod_env(&jb.name, jb.namespace()));
        container.env = Some(env);
    }
    let batch = BatchJob {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", jb.name)),
            namespace: Some(jb.namespace().to_string()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                "kubemr".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(BatchJobSpec {
            parallelism: Some(jb.spec.replicas()),
            template,
            ..Default::default()
        }),
        status: None,
    };
    let api: Api<BatchJob> = Api::namespaced(client.clone(), jb.namespace());
    let created = api
        .create(&PostParams::default(), &batch)
        .await
        .context("creating batch job")?;
    info!("created batch job {}", created.name_any());
    Ok(created)
}

async fn cleanup(client: &Client, batch: &BatchJob) {
    let name = batch.name_any();
    let namespace = batch.namespace().unwrap_or_else(|| "default".to_string());
    info!("deleting batch job {name}");
    let api: Api<BatchJob> = Api::namespaced(client.clone(), &namespace);
    if let Err(err) = api.delete(&name, &DeleteParams::default()).await {
        error!("deleting batch job {name}: {err}");
    }
}
