//! HTTP client for the embedded coordination server.
//!
//! Task updates are optimistic: a 200 means the update stuck, a 400 means
//! another worker owns the task (or the phase moved on), which is not an
//! error, just a lost race. Anything else bubbles up.

use anyhow::{bail, Result};
use std::time::Duration;
use tracing::info;

use crate::job::{MapReduceJob, MapTask, ReduceTask};

pub struct Client {
    baseurl: String,
    client: reqwest::Client,
}

impl Client {
    /// `baseurl` is the job URL stamped into the pod environment, e.g.
    /// `http://10.0.0.7:8989/wordcount/`.
    pub fn new(baseurl: impl Into<String>) -> Result<Self> {
        let mut baseurl = baseurl.into();
        if !baseurl.ends_with('/') {
            baseurl.push('/');
        }
        Ok(Self {
            baseurl,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
        })
    }

    pub async fn get_job(&self) -> Result<MapReduceJob> {
        let resp = self.client.get(&self.baseurl).send().await?;
        if !resp.status().is_success() {
            bail!("Got status: {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn put(&self, url: String, payload: &impl serde::Serialize) -> Result<bool> {
        let resp = self.client.put(&url).json(payload).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::BAD_REQUEST {
            // lost the race, let the caller re-fetch and move on
            info!("{url}: {body}");
            return Ok(false);
        }
        bail!("{status}: {body}");
    }

    /// Stores a map task wholesale. `Ok(false)` means rejected (wrong phase
    /// or owned by someone else).
    pub async fn put_map(&self, taskid: usize, task: &MapTask) -> Result<bool> {
        self.put(format!("{}map/{}/", self.baseurl, taskid), task)
            .await
    }

    pub async fn put_reduce(&self, taskid: u32, task: &ReduceTask) -> Result<bool> {
        self.put(format!("{}reduce/{}/", self.baseurl, taskid), task)
            .await
    }
}
