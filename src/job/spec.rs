//! The user-supplied half of a `MapReduceJob`.
//!
//! Parsing is deliberately lenient: the API server accepts arbitrary JSON in
//! the resource, so a malformed spec must not abort parsing of the enclosing
//! document. The parse error is carried along instead and surfaces the first
//! time the operator validates the job.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::jsonpatch::Patch;
use crate::job::{JobStatus, MapTask};

const DEFAULT_REPLICAS: i32 = 1;

/// The inner spec as the user wrote it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    /// List of initial inputs for the map phase, one task each
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Number of workers to run in parallel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Pod template for the worker pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
    /// Arbitrary optional arguments surfaced to user worker code
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub jobargs: BTreeMap<String, String>,
    /// Keep intermediate objects after completion
    #[serde(default)]
    pub keeptmp: bool,
}

/// Outer container that swallows parse errors instead of propagating them.
#[derive(Debug, Clone, Default)]
pub struct Spec {
    inner: Option<JobSpec>,
    err: Option<String>,
}

impl Spec {
    pub fn get(&self) -> Option<&JobSpec> {
        self.inner.as_ref()
    }

    /// Validates the spec as received: parseable, at least one input, a pod
    /// template with at least one container, sane replica count.
    pub fn validate(&self) -> Result<&JobSpec> {
        if let Some(err) = &self.err {
            bail!("{err}");
        }
        let Some(spec) = &self.inner else {
            bail!("Spec is required");
        };
        if spec.inputs.is_empty() {
            bail!("Atleast 1 input needed");
        }
        match &spec.template {
            None => bail!("Template must be provided"),
            Some(template) => {
                let containers = template
                    .spec
                    .as_ref()
                    .map(|s| s.containers.len())
                    .unwrap_or(0);
                if containers == 0 {
                    bail!("Atleast 1 container needed in template");
                }
            }
        }
        if let Some(replicas) = spec.replicas {
            if replicas < 1 {
                bail!("Replicas must be atleast 1");
            }
        }
        Ok(spec)
    }

    /// Worker parallelism, defaulting to one.
    pub fn replicas(&self) -> i32 {
        self.inner
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(DEFAULT_REPLICAS)
    }

    pub fn keeptmp(&self) -> bool {
        self.inner.as_ref().map(|s| s.keeptmp).unwrap_or(false)
    }

    pub fn jobargs(&self) -> BTreeMap<String, String> {
        self.inner
            .as_ref()
            .map(|s| s.jobargs.clone())
            .unwrap_or_default()
    }

    /// CAS document seeding a validated job: only a resource with no status
    /// yet gets its map table populated and moves to PENDING.
    pub fn patch_pending(&self) -> Result<Patch> {
        let spec = self.validate()?;
        let maps: BTreeMap<usize, MapTask> = spec
            .inputs
            .iter()
            .enumerate()
            .map(|(i, input)| (i, MapTask::seeded(input)))
            .collect();
        Ok(Patch::new()
            .test("/status", Value::Null)
            .add("/maps", serde_json::to_value(maps)?)
            .add("/status", json!(JobStatus::Pending)))
    }
}

impl From<JobSpec> for Spec {
    fn from(inner: JobSpec) -> Self {
        Self {
            inner: Some(inner),
            err: None,
        }
    }
}

impl Serialize for Spec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.inner {
            Some(spec) => spec.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Spec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(Spec::default());
        }
        match serde_json::from_value::<JobSpec>(value) {
            Ok(inner) => Ok(Spec {
                inner: Some(inner),
                err: None,
            }),
            Err(err) => Ok(Spec {
                inner: None,
                err: Some(err.to_string()),
            }),
        }
    }
}
