//! The in-pod worker runner.
//!
//! A runner fetches the job document, claims one task at a time, executes
//! the user's map/reduce code and publishes the outcome, until the job goes
//! terminal. The same loop runs against both transports: HTTP PUTs to the
//! embedded coordination server, or CAS patches straight to the custom
//! resource. A lost claim is never an error, just a reason to re-fetch.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::job::client::Client as HttpClient;
use crate::job::crd::JobClient;
use crate::job::{
    self, Config, Credentials, JobStatus, MapReduceJob, MapTask, ReduceTask, TaskStatus,
};
use crate::s3::ObjectStore;

pub mod kvgroup;
pub mod utils;

pub use utils::Utilities;

/// Delay between startup retries while the job is not ready for work.
const STARTUP_WAIT: Duration = Duration::from_secs(10);
/// Delay while slower workers finish the tasks we could not claim.
const STRAGGLER_WAIT: Duration = Duration::from_secs(20);
/// Publishing a finished task is the one retried interaction.
const PUBLISH_ATTEMPTS: u64 = 10;

/// The user's side of the contract: one map and one reduce function. The
/// partition keys of `map`'s output are the user's choice but must agree
/// across every map task of a job.
#[async_trait]
pub trait JobWorker: Send + Sync {
    async fn map(
        &self,
        id: usize,
        input: &str,
        utils: &Utilities,
    ) -> Result<BTreeMap<u32, String>>;

    async fn reduce(&self, id: u32, inputs: &[String], utils: &Utilities) -> Result<String>;
}

/// Transport behind the runner. Claims return `false` when another worker
/// holds the task; that is the contention signal, not an error.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn fetch(&self) -> Result<MapReduceJob>;
    async fn claim_map(&self, id: usize, task: &MapTask) -> Result<bool>;
    async fn publish_map(&self, id: usize, task: &MapTask) -> Result<()>;
    async fn fail_map(&self, id: usize, task: &MapTask) -> Result<()>;
    async fn claim_reduce(&self, id: u32, task: &ReduceTask) -> Result<bool>;
    async fn publish_reduce(&self, id: u32, task: &ReduceTask) -> Result<()>;
    async fn fail_reduce(&self, id: u32, task: &ReduceTask) -> Result<()>;
    /// First worker to observe all maps complete materializes the reduce
    /// table. Losing the race is fine.
    async fn seed_reduces(&self, reduces: &BTreeMap<u32, ReduceTask>) -> Result<()>;
    async fn seed_results(&self, results: &[String]) -> Result<()>;
}

/// In-process mode: the coordination server owns phase transitions, the
/// worker only stores tasks.
#[async_trait]
impl JobApi for HttpClient {
    async fn fetch(&self) -> Result<MapReduceJob> {
        self.get_job().await
    }

    async fn claim_map(&self, id: usize, task: &MapTask) -> Result<bool> {
        self.put_map(id, task).await
    }

    async fn publish_map(&self, id: usize, task: &MapTask) -> Result<()> {
        if !self.put_map(id, task).await? {
            // phase moved on, nothing useful left to store
            info!("map {id}: server rejected the result");
        }
        Ok(())
    }

    async fn fail_map(&self, id: usize, task: &MapTask) -> Result<()> {
        self.put_map(id, task).await?;
        Ok(())
    }

    async fn claim_reduce(&self, id: u32, task: &ReduceTask) -> Result<bool> {
        self.put_reduce(id, task).await
    }

    async fn publish_reduce(&self, id: u32, task: &ReduceTask) -> Result<()> {
        if !self.put_reduce(id, task).await? {
            info!("reduce {id}: server rejected the result");
        }
        Ok(())
    }

    async fn fail_reduce(&self, id: u32, task: &ReduceTask) -> Result<()> {
        self.put_reduce(id, task).await?;
        Ok(())
    }

    async fn seed_reduces(&self, _reduces: &BTreeMap<u32, ReduceTask>) -> Result<()> {
        // the evaluator owns this transition, give it a moment
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn seed_results(&self, _results: &[String]) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }
}

/// CRD mode: every mutation is a CAS patch against the resource.
pub struct CrdApi {
    client: JobClient,
    name: String,
    namespace: String,
}

impl CrdApi {
    pub fn new(client: JobClient, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    async fn patch(&self, patch: &crate::jsonpatch::Patch) -> Result<()> {
        self.client.patch(&self.name, &self.namespace, patch).await
    }

    /// A rejected CAS means somebody else won; report it as contention.
    async fn try_patch(&self, what: &str, patch: &crate::jsonpatch::Patch) -> Result<bool> {
        match self.patch(patch).await {
            Ok(()) => Ok(true),
            Err(err) => {
                info!("{what}: {err:#}");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl JobApi for CrdApi {
    async fn fetch(&self) -> Result<MapReduceJob> {
        self.client.get(&self.name, &self.namespace).await
    }

    async fn claim_map(&self, id: usize, task: &MapTask) -> Result<bool> {
        self.try_patch(
            &format!("claim map {id}"),
            &job::patch_claim_map(id, &task.worker),
        )
        .await
    }

    async fn publish_map(&self, id: usize, task: &MapTask) -> Result<()> {
        self.patch(&job::patch_publish_map(id, &task.outputs)?).await
    }

    async fn fail_map(&self, id: usize, task: &MapTask) -> Result<()> {
        self.patch(&job::patch_fail_map(id, &task.err)).await
    }

    async fn claim_reduce(&self, id: u32, task: &ReduceTask) -> Result<bool> {
        self.try_patch(
            &format!("claim reduce {id}"),
            &job::patch_claim_reduce(id, &task.worker),
        )
        .await
    }

    async fn publish_reduce(&self, id: u32, task: &ReduceTask) -> Result<()> {
        self.patch(&job::patch_publish_reduce(id, &task.output)).await
    }

    async fn fail_reduce(&self, id: u32, task: &ReduceTask) -> Result<()> {
        self.patch(&job::patch_fail_reduce(id, &task.err)).await
    }

    async fn seed_reduces(&self, reduces: &BTreeMap<u32, ReduceTask>) -> Result<()> {
        self.try_patch("seeding reduces", &job::patch_seed_reduces(reduces)?)
            .await?;
        Ok(())
    }

    async fn seed_results(&self, results: &[String]) -> Result<()> {
        self.try_patch("seeding results", &job::patch_seed_results(results)?)
            .await?;
        Ok(())
    }
}

/// Manages the lifecycle of one worker process.
pub struct Runner {
    api: Box<dyn JobApi>,
    job: MapReduceJob,
    hostname: String,
    utils: Utilities,
    job_args: BTreeMap<String, String>,
}

impl Runner {
    /// Wires a runner from the pod environment: `KUBEMR_JOB_URL` selects the
    /// HTTP transport, otherwise the custom resource is patched directly.
    /// Blocks until the job is ready for work.
    pub async fn from_env(apiserver: Option<&str>, kubeconfig: Option<&str>) -> Result<Runner> {
        let cfg = Config::from_env();
        cfg.validate()?;
        let creds = Credentials::from_env();
        let name = std::env::var("KUBEMR_JOB_NAME").unwrap_or_default();
        let namespace =
            std::env::var("KUBEMR_JOB_NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let api: Box<dyn JobApi> = if !cfg.job_url.is_empty() {
            info!("joining coordination server at {}", cfg.job_url);
            Box::new(HttpClient::new(&cfg.job_url)?)
        } else {
            if name.is_empty() {
                bail!("KUBEMR_JOB_NAME must be set");
            }
            let client = crate::k8s::client(apiserver, kubeconfig).await?;
            Box::new(CrdApi::new(JobClient::new(client), &name, &namespace))
        };

        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        // Hold off until the job is claimable
        let job = loop {
            let job = api.fetch().await?;
            match job.status {
                None
                | Some(JobStatus::Pending)
                | Some(JobStatus::Deploying)
                | Some(JobStatus::Fail) => {
                    info!("job {} not ready ({:?}), waiting", job.name, job.status);
                    tokio::time::sleep(STARTUP_WAIT).await;
                }
                Some(JobStatus::Complete) => bail!("COMPLETE"),
                _ => break job,
            }
        };

        let store = ObjectStore::new(&cfg, &creds, cfg.job_prefix(&job.name));
        if let Err(err) = store.ensure_bucket().await {
            warn!("ensuring bucket: {err:#}");
        }
        let job_args = job.spec.jobargs();
        Ok(Runner {
            api,
            job,
            hostname,
            utils: Utilities::new(store),
            job_args,
        })
    }

    /// Explicit wiring, used by tests and custom binaries.
    pub fn new(api: Box<dyn JobApi>, job: MapReduceJob, hostname: String, utils: Utilities) -> Self {
        let job_args = job.spec.jobargs();
        Self {
            api,
            job,
            hostname,
            utils,
            job_args,
        }
    }

    /// Advisory arguments from the job spec.
    pub fn job_args(&self) -> &BTreeMap<String, String> {
        &self.job_args
    }

    /// Work until the job is terminal. `Ok(())` means COMPLETE; a FAIL (ours
    /// or anybody's) surfaces as an error.
    pub async fn run(&mut self, worker: &dyn JobWorker) -> Result<()> {
        loop {
            self.work(worker).await?;
            self.job = self.api.fetch().await?;
            match self.job.status {
                None => bail!("Uninitialized job"),
                Some(JobStatus::Complete) => {
                    info!("job {} is complete", self.job.name);
                    return Ok(());
                }
                Some(JobStatus::Fail) => bail!("FAIL: {}", self.job.err),
                Some(JobStatus::Pending) | Some(JobStatus::Deploying) => {
                    bail!("job went backwards, refusing to continue")
                }
                _ => {}
            }
        }
    }

    /// One iteration over the current snapshot of the job.
    async fn work(&self, worker: &dyn JobWorker) -> Result<()> {
        // Preflight: grab the first unowned map task
        let unowned = self
            .job
            .maps
            .iter()
            .find(|(_, t)| t.worker.is_empty())
            .map(|(id, _)| *id);
        if let Some(id) = unowned {
            return self.run_map(worker, id).await;
        }

        if self.job.reduces.is_none() {
            // Every map is claimed; the table appears once they all finish
            if !self
                .job
                .maps
                .values()
                .all(|m| m.status == Some(TaskStatus::Complete))
            {
                debug!("maps still in flight, waiting");
                tokio::time::sleep(STRAGGLER_WAIT).await;
                return Ok(());
            }
            let derived = job::derive_reduces(&self.job.maps);
            return self.api.seed_reduces(&derived).await;
        }

        if let Some(reduces) = &self.job.reduces {
            let unowned = reduces
                .iter()
                .find(|(_, t)| t.worker.is_empty())
                .map(|(id, _)| *id);
            if let Some(id) = unowned {
                return self.run_reduce(worker, id).await;
            }
        }

        if self.job.status == Some(JobStatus::Reduce) {
            let Some(reduces) = &self.job.reduces else {
                return Ok(());
            };
            if !reduces
                .values()
                .all(|r| r.status == Some(TaskStatus::Complete))
            {
                debug!("reduces still in flight, waiting");
                tokio::time::sleep(STRAGGLER_WAIT).await;
                return Ok(());
            }
            let results = job::collect_results(reduces);
            self.api.seed_results(&results).await?;
        }
        Ok(())
    }

    async fn run_map(&self, worker: &dyn JobWorker, id: usize) -> Result<()> {
        let Some(task) = self.job.maps.get(&id) else {
            return Ok(());
        };
        let mut task = task.clone();
        task.worker = self.hostname.clone();
        task.status = Some(TaskStatus::Progress);
        if !self.api.claim_map(id, &task).await? {
            info!("map {id}: another worker got there first");
            return Ok(());
        }
        info!("map {id}: running on {}", task.input);
        match worker.map(id, &task.input, &self.utils).await {
            Ok(outputs) => {
                task.outputs = outputs;
                task.status = Some(TaskStatus::Complete);
                let mut last = Ok(());
                for attempt in 0..PUBLISH_ATTEMPTS {
                    match self.api.publish_map(id, &task).await {
                        Ok(()) => return Ok(()),
                        Err(err) => {
                            warn!("map {id}: publish attempt {attempt} failed: {err:#}");
                            last = Err(err);
                            tokio::time::sleep(Duration::from_secs(attempt * 2)).await;
                        }
                    }
                }
                last
            }
            Err(err) => {
                error!("map {id}: {err:#}");
                task.err = format!("{err:#}");
                task.status = Some(TaskStatus::Fail);
                self.api.fail_map(id, &task).await
            }
        }
    }

    async fn run_reduce(&self, worker: &dyn JobWorker, id: u32) -> Result<()> {
        let Some(task) = self.job.reduces.as_ref().and_then(|r| r.get(&id)) else {
            return Ok(());
        };
        let mut task = task.clone();
        task.worker = self.hostname.clone();
        task.status = Some(TaskStatus::Progress);
        if !self.api.claim_reduce(id, &task).await? {
            info!("reduce {id}: another worker got there first");
            return Ok(());
        }
        info!("reduce {id}: running on {} inputs", task.inputs.len());
        match worker.reduce(id, &task.inputs, &self.utils).await {
            Ok(output) => {
                task.output = output;
                task.status = Some(TaskStatus::Complete);
                let mut last = Ok(());
                for attempt in 0..PUBLISH_ATTEMPTS {
                    match self.api.publish_reduce(id, &task).await {
                        Ok(()) => return Ok(()),
                        Err(err) => {
                            warn!("reduce {id}: publish attempt {attempt} failed: {err:#}");
                            last = Err(err);
                            tokio::time::sleep(Duration::from_secs(attempt * 2)).await;
                        }
                    }
                }
                last
            }
            Err(err) => {
                error!("reduce {id}: {err:#}");
                task.err = format!("{err:#}");
                task.status = Some(TaskStatus::Fail);
                self.api.fail_reduce(id, &task).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Authoritative-state stand-in applying the same rules the real
    /// transports do.
    struct FakeApi {
        job: Mutex<MapReduceJob>,
    }

    impl FakeApi {
        fn new(inputs: &[&str]) -> Self {
            let mut job = MapReduceJob {
                name: "fake".into(),
                status: Some(JobStatus::Deployed),
                ..Default::default()
            };
            job.maps = inputs
                .iter()
                .enumerate()
                .map(|(i, input)| (i, MapTask::seeded(*input)))
                .collect();
            Self {
                job: Mutex::new(job),
            }
        }
    }

    #[async_trait]
    impl JobApi for FakeApi {
        async fn fetch(&self) -> Result<MapReduceJob> {
            Ok(self.job.lock().await.clone())
        }

        async fn claim_map(&self, id: usize, task: &MapTask) -> Result<bool> {
            let mut job = self.job.lock().await;
            let current = job.maps.get(&id).unwrap();
            if !current.worker.is_empty() {
                return Ok(false);
            }
            job.maps.insert(id, task.clone());
            job.status = Some(JobStatus::Map);
            Ok(true)
        }

        async fn publish_map(&self, id: usize, task: &MapTask) -> Result<()> {
            self.job.lock().await.maps.insert(id, task.clone());
            Ok(())
        }

        async fn fail_map(&self, id: usize, task: &MapTask) -> Result<()> {
            let mut job = self.job.lock().await;
            job.maps.insert(id, task.clone());
            job.fail(format!("map({id}) {}", task.err));
            Ok(())
        }

        async fn claim_reduce(&self, id: u32, task: &ReduceTask) -> Result<bool> {
            let mut job = self.job.lock().await;
            let reduces = job.reduces.as_mut().unwrap();
            if !reduces.get(&id).unwrap().worker.is_empty() {
                return Ok(false);
            }
            reduces.insert(id, task.clone());
            job.status = Some(JobStatus::Reduce);
            Ok(true)
        }

        async fn publish_reduce(&self, id: u32, task: &ReduceTask) -> Result<()> {
            let mut job = self.job.lock().await;
            job.reduces.as_mut().unwrap().insert(id, task.clone());
            Ok(())
        }

        async fn fail_reduce(&self, id: u32, task: &ReduceTask) -> Result<()> {
            let mut job = self.job.lock().await;
            job.reduces.as_mut().unwrap().insert(id, task.clone());
            job.fail(format!("reduces({id}) {}", task.err));
            Ok(())
        }

        async fn seed_reduces(&self, reduces: &BTreeMap<u32, ReduceTask>) -> Result<()> {
            let mut job = self.job.lock().await;
            if job.reduces.is_none() {
                job.reduces = Some(reduces.clone());
            }
            Ok(())
        }

        async fn seed_results(&self, results: &[String]) -> Result<()> {
            let mut job = self.job.lock().await;
            if job.results.is_none() {
                job.results = Some(results.to_vec());
                job.status = Some(JobStatus::Complete);
            }
            Ok(())
        }
    }

    struct EchoWorker;

    #[async_trait]
    impl JobWorker for EchoWorker {
        async fn map(
            &self,
            id: usize,
            input: &str,
            _utils: &Utilities,
        ) -> Result<BTreeMap<u32, String>> {
            Ok(BTreeMap::from([
                (1, format!("{input}-{id}-p1")),
                (2, format!("{input}-{id}-p2")),
            ]))
        }

        async fn reduce(&self, id: u32, inputs: &[String], _utils: &Utilities) -> Result<String> {
            Ok(format!("out-{id}-{}", inputs.len()))
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl JobWorker for FailingWorker {
        async fn map(
            &self,
            _id: usize,
            _input: &str,
            _utils: &Utilities,
        ) -> Result<BTreeMap<u32, String>> {
            bail!("boom")
        }

        async fn reduce(&self, _id: u32, _inputs: &[String], _utils: &Utilities) -> Result<String> {
            bail!("boom")
        }
    }

    fn test_utils() -> Utilities {
        let cfg = Config {
            s3_region: "us-east-1".into(),
            bucket_name: "kubemr".into(),
            bucket_prefix: "kubemr/".into(),
            ..Default::default()
        };
        Utilities::new(ObjectStore::new(
            &cfg,
            &Credentials::default(),
            "kubemr/fake/",
        ))
    }

    async fn runner_with(api: FakeApi) -> Runner {
        let job = api.fetch().await.unwrap();
        Runner::new(Box::new(api), job, "test-worker".into(), test_utils())
    }

    #[tokio::test]
    async fn runner_drives_a_job_to_completion() {
        let mut runner = runner_with(FakeApi::new(&["a", "b"])).await;
        runner.run(&EchoWorker).await.unwrap();
        let job = runner.api.fetch().await.unwrap();
        assert_eq!(job.status, Some(JobStatus::Complete));
        // two maps, two partitions each -> two reduces, one output each
        let results = job.results.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.starts_with("out-")));
        for task in job.maps.values() {
            assert_eq!(task.worker, "test-worker");
            assert_eq!(task.status, Some(TaskStatus::Complete));
        }
    }

    #[tokio::test]
    async fn user_error_fails_the_job_with_task_context() {
        let mut runner = runner_with(FakeApi::new(&["a"])).await;
        let err = runner.run(&FailingWorker).await.unwrap_err().to_string();
        assert!(err.contains("map(0)"), "{err}");
        assert!(err.contains("boom"), "{err}");
        let job = runner.api.fetch().await.unwrap();
        assert_eq!(job.status, Some(JobStatus::Fail));
        assert_eq!(job.maps[&0].status, Some(TaskStatus::Fail));
    }

    #[tokio::test]
    async fn lost_claims_are_not_errors() {
        let api = FakeApi::new(&["a"]);
        {
            let mut job = api.job.lock().await;
            let task = job.maps.get_mut(&0).unwrap();
            task.worker = "somebody-else".into();
            task.status = Some(TaskStatus::Progress);
            job.status = Some(JobStatus::Map);
        }
        let runner = runner_with(api).await;
        // nothing claimable; the iteration parks and returns cleanly
        let started = std::time::Instant::now();
        tokio::time::pause();
        runner.work(&EchoWorker).await.unwrap();
        tokio::time::resume();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
