//! The cluster-wide operator: watches MapReduceJob resources, walks them
//! from validation to deployment, and reclaims everything when they go.
//!
//! All status transitions are CAS patches, so any number of operators can
//! run side by side; losing a patch race just means another instance did
//! the work.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::batch::v1::{Job as BatchJob, JobSpec as BatchJobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapKeySelector, EnvVar, EnvVarSource, Pod, Secret, SecretKeySelector,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    DeleteParams, ListParams, Patch as KubePatch, PatchParams, PostParams, PropagationPolicy,
};
use kube::core::DynamicObject;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::job::crd::{self, JobClient};
use crate::job::{self, Config, Credentials, JobStatus, MapReduceJob};
use crate::s3::ObjectStore;

/// Name of the per-namespace secret and configmap the operator reconciles.
pub const RESOURCE_NAME: &str = "kubemr";

const WATCH_RETRY: Duration = Duration::from_secs(5);

pub struct Operator {
    client: Client,
    jobs: JobClient,
    store: ObjectStore,
    config: Config,
    credentials: Credentials,
}

impl Operator {
    pub fn new(client: Client, config: Config, credentials: Credentials) -> Self {
        let store = ObjectStore::new(&config, &credentials, config.base_prefix());
        Self {
            jobs: JobClient::new(client.clone()),
            client,
            store,
            config,
            credentials,
        }
    }

    /// Installs the CRD when missing, sweeps the object store once, then
    /// consumes the watch forever, reopening it on every disconnect.
    pub async fn run(&self) -> Result<()> {
        self.ensure_crd().await?;
        if let Err(err) = self.sweep_store().await {
            warn!("startup sweep: {err:#}");
        }
        loop {
            info!("watching mapreducejobs across all namespaces");
            let stream = watcher(self.jobs.all(), watcher::Config::default());
            futures::pin_mut!(stream);
            loop {
                match stream.try_next().await {
                    Ok(Some(event)) => self.handle(event).await,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("watch interrupted: {err}");
                        break;
                    }
                }
            }
            tokio::time::sleep(WATCH_RETRY).await;
        }
    }

    async fn ensure_crd(&self) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match api.get(&crd::crd_name()).await {
            Ok(_) => {
                info!("CRD {} exists", crd::crd_name());
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                info!("creating CRD {}", crd::crd_name());
                api.create(&PostParams::default(), &crd::crd())
                    .await
                    .context("creating CRD")?;
                Ok(())
            }
            Err(err) => Err(err).context("fetching CRD"),
        }
    }

    async fn handle(&self, event: watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                match crd::from_dynamic(&obj) {
                    Ok(jb) => {
                        if let Err(err) = self.observe(&jb).await {
                            warn!("job {}: {err:#}", jb.name);
                        }
                    }
                    // Leave broken objects to the next reconciliation
                    Err(err) => debug!("skipping event: {err:#}"),
                }
            }
            watcher::Event::Delete(obj) => match crd::from_dynamic(&obj) {
                Ok(jb) => self.teardown(&jb).await,
                Err(err) => debug!("skipping delete: {err:#}"),
            },
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    async fn observe(&self, jb: &MapReduceJob) -> Result<()> {
        match jb.status {
            None => self.check_spec(jb).await,
            Some(JobStatus::Pending) => self.deploy(jb).await,
            // MAP onwards is driven by the workers
            _ => Ok(()),
        }
    }

    /// First sight of a resource: stamp FAIL or seed the map table.
    async fn check_spec(&self, jb: &MapReduceJob) -> Result<()> {
        let ns = jb.namespace();
        match jb.spec.validate() {
            Ok(_) => {
                let patch = jb.spec.patch_pending()?;
                match self.jobs.patch(&jb.name, ns, &patch).await {
                    Ok(()) => info!("job {} accepted", jb.name),
                    Err(err) => info!("job {}: seeding lost a race: {err:#}", jb.name),
                }
            }
            Err(err) => {
                info!("job {} is invalid: {err}", jb.name);
                let patch = job::patch_fail(None, &err.to_string());
                if let Err(err) = self.jobs.patch(&jb.name, ns, &patch).await {
                    info!("job {}: fail patch rejected: {err:#}", jb.name);
                }
            }
        }
        Ok(())
    }

    /// Acquire the deployment lock and materialize the worker pods.
    async fn deploy(&self, jb: &MapReduceJob) -> Result<()> {
        let ns = jb.namespace();
        let lock = job::patch_status(JobStatus::Pending, JobStatus::Deploying);
        if let Err(err) = self.jobs.patch(&jb.name, ns, &lock).await {
            info!("job {}: another operator is deploying: {err:#}", jb.name);
            return Ok(());
        }
        match self.materialize(jb).await {
            Ok(()) => {
                info!("job {} deployed", jb.name);
                let patch = job::patch_status(JobStatus::Deploying, JobStatus::Deployed);
                self.jobs.patch(&jb.name, ns, &patch).await
            }
            Err(err) => {
                warn!("job {} failed to deploy: {err:#}", jb.name);
                let patch = job::patch_fail(Some(JobStatus::Deploying), &format!("{err:#}"));
                self.jobs.patch(&jb.name, ns, &patch).await
            }
        }
    }

    async fn materialize(&self, jb: &MapReduceJob) -> Result<()> {
        let ns = jb.namespace();
        self.ensure_secret(ns).await?;
        self.ensure_configmap(ns).await?;
        let batch = self.build_batch_job(jb)?;
        let api: Api<BatchJob> = Api::namespaced(self.client.clone(), ns);
        match api.create(&PostParams::default(), &batch).await {
            Ok(created) => {
                info!("created batch job {}", created.name_any());
                Ok(())
            }
            // a previous operator instance got this far already
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(err) => Err(err).context("creating batch job"),
        }
    }

    /// The `kubemr` secret carries the object-store credentials. Compared
    /// structurally and updated only on drift.
    async fn ensure_secret(&self, namespace: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let desired = self.credentials.secret_data();
        match api.get(RESOURCE_NAME).await {
            Ok(existing) => {
                let current: BTreeMap<String, String> = existing
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                    .collect();
                if current != desired {
                    info!("updating secret {namespace}/{RESOURCE_NAME}");
                    api.patch(
                        RESOURCE_NAME,
                        &PatchParams::default(),
                        &KubePatch::Merge(json!({ "stringData": desired })),
                    )
                    .await
                    .context("updating secret")?;
                }
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                info!("creating secret {namespace}/{RESOURCE_NAME}");
                let secret = Secret {
                    metadata: reconciled_meta(namespace),
                    string_data: Some(desired),
                    type_: Some("Opaque".to_string()),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &secret)
                    .await
                    .context("creating secret")?;
                Ok(())
            }
            Err(err) => Err(err).context("fetching secret"),
        }
    }

    /// The `kubemr` configmap carries the non-secret object-store wiring.
    async fn ensure_configmap(&self, namespace: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let desired = self.config.configmap_data();
        match api.get(RESOURCE_NAME).await {
            Ok(existing) => {
                if existing.data.unwrap_or_default() != desired {
                    info!("updating configmap {namespace}/{RESOURCE_NAME}");
                    api.patch(
                        RESOURCE_NAME,
                        &PatchParams::default(),
                        &KubePatch::Merge(json!({ "data": desired })),
                    )
                    .await
                    .context("updating configmap")?;
                }
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                info!("creating configmap {namespace}/{RESOURCE_NAME}");
                let cm = ConfigMap {
                    metadata: reconciled_meta(namespace),
                    data: Some(desired),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &cm)
                    .await
                    .context("creating configmap")?;
                Ok(())
            }
            Err(err) => Err(err).context("fetching configmap"),
        }
    }

    /// Builds the batch job backing a MapReduceJob: the user's pod template
    /// with `restartPolicy=OnFailure` and the worker environment stamped
    /// into every container.
    fn build_batch_job(&self, jb: &MapReduceJob) -> Result<BatchJob> {
        let spec = jb
            .spec
            .validate()
            .map_err(|err| err.context("building batch job"))?;
        let mut template = spec.template.clone().unwrap_or_default();
        let pod_spec = template.spec.as_mut().context("template has no pod spec")?;
        pod_spec.restart_policy = Some("OnFailure".to_string());
        for container in &mut pod_spec.containers {
            let mut env = container.env.take().unwrap_or_default();
            env.extend(worker_env(&jb.name, jb.namespace()));
            container.env = Some(env);
        }
        Ok(BatchJob {
            metadata: ObjectMeta {
                name: Some(jb.name.clone()),
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
        })
    }

    /// The resource is gone: drop the batch job with foreground propagation,
    /// hunt lingering pods, then prune the job's object prefix.
    async fn teardown(&self, jb: &MapReduceJob) {
        let ns = jb.namespace();
        info!("job {} deleted, reclaiming resources", jb.name);
        let api: Api<BatchJob> = Api::namespaced(self.client.clone(), ns);
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        match api.delete(&jb.name, &dp).await {
            Ok(_) => info!("deleted batch job {}", jb.name),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => warn!("deleting batch job {}: {err}", jb.name),
        }
        // the batch controller labels every pod with its job's name
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let lp = ListParams::default().labels(&format!("job-name={}", jb.name));
        if let Err(err) = pods.delete_collection(&DeleteParams::default(), &lp).await {
            warn!("deleting pods of {}: {err}", jb.name);
        }
        if jb.spec.keeptmp() {
            info!("job {} asked to keep intermediate data", jb.name);
            return;
        }
        let store = self.store.clone();
        let jobs = self.jobs.clone();
        let name = jb.name.clone();
        tokio::spawn(async move {
            if let Err(err) = gc(&store, &jobs).await {
                warn!("sweep after {name}: {err:#}");
            }
        });
    }

    /// One idempotent pass of object-store garbage collection.
    pub async fn sweep_store(&self) -> Result<()> {
        gc(&self.store, &self.jobs).await
    }
}

fn reconciled_meta(namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(RESOURCE_NAME.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Environment stamped into every worker container. Identity travels as
/// plain values, object-store wiring through the reconciled configmap and
/// secret so rotating either restarts cleanly.
fn worker_env(name: &str, namespace: &str) -> Vec<EnvVar> {
    let value = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    };
    let from_configmap = |name: &str, key: &str| EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                key: key.to_string(),
                name: RESOURCE_NAME.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    };
    let from_secret = |name: &str, key: &str| EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                key: key.to_string(),
                name: RESOURCE_NAME.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    };
    vec![
        value("KUBEMR_JOB_NAME", name),
        value("KUBEMR_JOB_NAMESPACE", namespace),
        from_configmap("KUBEMR_S3_REGION", "s3region"),
        from_configmap("KUBEMR_S3_ENDPOINT", "s3endpoint"),
        from_configmap("KUBEMR_S3_BUCKET_NAME", "bucketname"),
        from_configmap("KUBEMR_S3_BUCKET_PREFIX", "bucketprefix"),
        from_secret("KUBEMR_S3_ACCESS_KEY_ID", "S3_ACCESS_KEY_ID"),
        from_secret("KUBEMR_S3_SECRET_ACCESS_KEY", "S3_SECRET_ACCESS_KEY"),
    ]
}

/// Derives the owning job from a prefix component (its last non-empty
/// segment).
fn job_name_of(prefix: &str) -> Option<&str> {
    prefix.rsplit('/').find(|segment| !segment.is_empty())
}

/// Deletes every prefix whose job no longer exists. Safe to run at any
/// time; failures are logged per prefix and never wedge the operator.
async fn gc(store: &ObjectStore, jobs: &JobClient) -> Result<()> {
    let live = jobs.live_names().await?;
    let mut token = None;
    loop {
        let (page, next) = store.list_from("", Some("/"), token).await?;
        for prefix in page.common_prefixes {
            let Some(name) = job_name_of(&prefix) else {
                continue;
            };
            if live.contains(name) {
                continue;
            }
            info!("pruning orphaned prefix {prefix}");
            if let Err(err) = store.delete_prefix(&prefix).await {
                warn!("pruning {prefix}: {err:#}");
            }
        }
        match next {
            Some(t) => token = Some(t),
            None => return Ok(()),
        }
    }
}
