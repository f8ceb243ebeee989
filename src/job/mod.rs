//! The `MapReduceJob` document, its tasks and the phase state machine.
//!
//! The same document shape is served by the embedded coordination server and
//! stored in the custom resource; the two deployment modes differ only in
//! how mutations travel (HTTP PUTs vs JSON patches).

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::jsonpatch::Patch;

pub mod client;
pub mod config;
pub mod crd;
pub mod server;
pub mod spec;

pub use config::{Config, Credentials};
pub use spec::Spec;

/// Job lifecycle. The unset state (a freshly created resource) is modelled
/// as `None` wherever a status is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Validated, worker pods not yet created
    Pending,
    /// An operator holds the deployment lock
    Deploying,
    /// Worker pods requested
    Deployed,
    /// Map tasks may be claimed
    Map,
    /// All maps finished, reduce tasks may be claimed
    Reduce,
    /// Terminal: results are published
    Complete,
    /// Terminal: see `error`
    Fail,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Fail)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Deploying => "DEPLOYING",
            JobStatus::Deployed => "DEPLOYED",
            JobStatus::Map => "MAP",
            JobStatus::Reduce => "REDUCE",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

/// Per-task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Progress,
    Complete,
    Fail,
}

/// One unit of map work. `worker` doubles as the task lock: it may only be
/// written while empty, and afterwards only the owner updates the task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MapTask {
    /// Hostname of the owning worker, empty while unclaimed
    #[serde(default)]
    pub worker: String,
    /// One input per map
    #[serde(default)]
    pub input: String,
    /// partition id -> output URI
    #[serde(default)]
    pub outputs: BTreeMap<u32, String>,
    #[serde(default, rename = "error")]
    pub err: String,
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

impl MapTask {
    pub fn seeded(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }
}

/// One unit of reduce work, one per partition emitted by the maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReduceTask {
    #[serde(default)]
    pub worker: String,
    /// One input per map task, each map's slot for this partition
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Single output, empty means "no result but successful"
    #[serde(default)]
    pub output: String,
    #[serde(default, rename = "error")]
    pub err: String,
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

/// The job document. In CRD mode `name`/`namespace` mirror the resource
/// metadata and everything else lives at the top level of the resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapReduceJob {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub spec: Spec,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default, rename = "error")]
    pub err: String,
    #[serde(default)]
    pub maps: BTreeMap<usize, MapTask>,
    #[serde(default)]
    pub reduces: Option<BTreeMap<u32, ReduceTask>>,
    #[serde(default)]
    pub results: Option<Vec<String>>,
}

/// What a single evaluation pass concluded.
#[derive(Debug, PartialEq)]
pub enum Evaluation {
    /// Nothing to do yet
    Pending,
    /// Job finished, results published
    Complete(Vec<String>),
    /// Job failed with the stored reason
    Fail(String),
}

impl MapReduceJob {
    pub fn namespace(&self) -> &str {
        if self.namespace.is_empty() {
            "default"
        } else {
            &self.namespace
        }
    }

    /// Marks the job failed with a reason. Used by every terminal error
    /// path of the in-process evaluator.
    pub fn fail(&mut self, err: impl Into<String>) {
        self.status = Some(JobStatus::Fail);
        self.err = err.into();
    }

    /// One pass of the phase state machine, the in-process counterpart of
    /// the patches workers apply in CRD mode.
    ///
    /// Under MAP: any failed task fails the whole job; once every task is
    /// complete the reduce tasks are derived from the union of map outputs.
    /// Under REDUCE: symmetric, collecting non-empty outputs into `results`
    /// in reduces iteration order.
    pub fn evaluate(&mut self) -> Evaluation {
        match self.status {
            Some(JobStatus::Map) => {
                let failed = self.maps.iter().find_map(|(taskid, m)| {
                    (m.status == Some(TaskStatus::Fail)).then(|| {
                        format!("MAP: Worker: {}, Task: {}, Err: {}", m.worker, taskid, m.err)
                    })
                });
                if let Some(err) = failed {
                    self.fail(err.clone());
                    return Evaluation::Fail(err);
                }
                if self.maps.values().all(|m| m.status == Some(TaskStatus::Complete)) {
                    self.reduces = Some(derive_reduces(&self.maps));
                    self.status = Some(JobStatus::Reduce);
                }
                Evaluation::Pending
            }
            Some(JobStatus::Reduce) => {
                let Some(reduces) = &self.reduces else {
                    return Evaluation::Pending;
                };
                let failed = reduces.iter().find_map(|(taskid, r)| {
                    (r.status == Some(TaskStatus::Fail)).then(|| {
                        format!(
                            "REDUCE: Worker: {}, Task: {}, Err: {}",
                            r.worker, taskid, r.err
                        )
                    })
                });
                if let Some(err) = failed {
                    self.fail(err.clone());
                    return Evaluation::Fail(err);
                }
                if reduces.values().all(|r| r.status == Some(TaskStatus::Complete)) {
                    let results = collect_results(reduces);
                    self.results = Some(results.clone());
                    self.status = Some(JobStatus::Complete);
                    return Evaluation::Complete(results);
                }
                Evaluation::Pending
            }
            Some(JobStatus::Complete) => {
                Evaluation::Complete(self.results.clone().unwrap_or_default())
            }
            Some(JobStatus::Fail) => Evaluation::Fail(self.err.clone()),
            // Nothing to progress before the map phase starts
            _ => Evaluation::Pending,
        }
    }
}

/// Derives the reduce tasks from finished map outputs: for every map, each
/// `(partition, uri)` pair appends `uri` to that partition's input list.
/// Deterministic given the same outputs, so independent observers agree.
pub fn derive_reduces(maps: &BTreeMap<usize, MapTask>) -> BTreeMap<u32, ReduceTask> {
    let mut inputs: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for m in maps.values() {
        for (partition, uri) in &m.outputs {
            inputs.entry(*partition).or_default().push(uri.clone());
        }
    }
    inputs
        .into_iter()
        .map(|(partition, inputs)| {
            (
                partition,
                ReduceTask {
                    inputs,
                    ..Default::default()
                },
            )
        })
        .collect()
}

/// Collects non-empty reduce outputs in reduces iteration order.
pub fn collect_results(reduces: &BTreeMap<u32, ReduceTask>) -> Vec<String> {
    reduces
        .values()
        .filter(|r| !r.output.is_empty())
        .map(|r| r.output.clone())
        .collect()
}

/////////////////////////////////////////////////////////////////////////////
// CAS patch constructors shared by the operator and the CRD-mode worker
/////////////////////////////////////////////////////////////////////////////

/// Guarded status transition, e.g. `PENDING -> DEPLOYING`.
pub fn patch_status(from: JobStatus, to: JobStatus) -> Patch {
    Patch::new()
        .test("/status", json!(from))
        .replace("/status", json!(to))
}

/// Marks a job failed; `from` is `None` for a freshly observed resource.
pub fn patch_fail(from: Option<JobStatus>, err: &str) -> Patch {
    let patch = match from {
        Some(s) => Patch::new()
            .test("/status", json!(s))
            .replace("/status", json!(JobStatus::Fail)),
        None => Patch::new()
            .test("/status", Value::Null)
            .add("/status", json!(JobStatus::Fail)),
    };
    patch.add("/error", json!(err))
}

/// Claims a map task: only succeeds while nobody owns the slot.
pub fn patch_claim_map(taskid: usize, hostname: &str) -> Patch {
    Patch::new()
        .test(format!("/maps/{taskid}/worker"), json!(""))
        .add(format!("/maps/{taskid}/worker"), json!(hostname))
        .add(format!("/maps/{taskid}/status"), json!(TaskStatus::Progress))
        .replace("/status", json!(JobStatus::Map))
}

/// Publishes map outputs and completes the task.
pub fn patch_publish_map(taskid: usize, outputs: &BTreeMap<u32, String>) -> Result<Patch> {
    Ok(Patch::new()
        .add(format!("/maps/{taskid}/outputs"), serde_json::to_value(outputs)?)
        .add(format!("/maps/{taskid}/status"), json!(TaskStatus::Complete)))
}

/// Fails one map task and the whole job with task context.
pub fn patch_fail_map(taskid: usize, err: &str) -> Patch {
    Patch::new()
        .add(format!("/maps/{taskid}/error"), json!(err))
        .add(format!("/maps/{taskid}/status"), json!(TaskStatus::Fail))
        .add("/status", json!(JobStatus::Fail))
        .add("/error", json!(format!("map({taskid}) {err}")))
}

pub fn patch_claim_reduce(taskid: u32, hostname: &str) -> Patch {
    Patch::new()
        .test(format!("/reduces/{taskid}/worker"), json!(""))
        .add(format!("/reduces/{taskid}/worker"), json!(hostname))
        .add(
            format!("/reduces/{taskid}/status"),
            json!(TaskStatus::Progress),
        )
        .replace("/status", json!(JobStatus::Reduce))
}

pub fn patch_publish_reduce(taskid: u32, output: &str) -> Patch {
    Patch::new()
        .replace(format!("/reduces/{taskid}/output"), json!(output))
        .add(format!("/reduces/{taskid}/status"), json!(TaskStatus::Complete))
}

pub fn patch_fail_reduce(taskid: u32, err: &str) -> Patch {
    Patch::new()
        .add(format!("/reduces/{taskid}/error"), json!(err))
        .add(format!("/reduces/{taskid}/status"), json!(TaskStatus::Fail))
        .add("/status", json!(JobStatus::Fail))
        .add("/error", json!(format!("reduces({taskid}) {err}")))
}

/// First writer wins: the reduce table is only ever materialized once.
pub fn patch_seed_reduces(reduces: &BTreeMap<u32, ReduceTask>) -> Result<Patch> {
    Ok(Patch::new()
        .test("/reduces", Value::Null)
        .add("/reduces", serde_json::to_value(reduces)?))
}

/// First writer wins, and completes the job.
pub fn patch_seed_results(results: &[String]) -> Result<Patch> {
    Ok(Patch::new()
        .test("/results", Value::Null)
        .add("/results", serde_json::to_value(results)?)
        .replace("/status", json!(JobStatus::Complete)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_map(input: &str, outputs: &[(u32, &str)]) -> MapTask {
        MapTask {
            worker: "worker-0".into(),
            input: input.into(),
            outputs: outputs
                .iter()
                .map(|(p, uri)| (*p, uri.to_string()))
                .collect(),
            err: String::new(),
            status: Some(TaskStatus::Complete),
        }
    }

    fn job_in_map_phase() -> MapReduceJob {
        let mut job = MapReduceJob {
            name: "foo".into(),
            status: Some(JobStatus::Map),
            ..Default::default()
        };
        job.maps.insert(0, complete_map("a", &[(1, "a"), (2, "b")]));
        job.maps.insert(1, complete_map("b", &[(1, "c"), (2, "d")]));
        job.maps.insert(2, complete_map("c", &[(1, "e"), (2, "f")]));
        job
    }

    #[test]
    fn all_maps_complete_moves_to_reduce() {
        let mut job = job_in_map_phase();
        assert_eq!(job.evaluate(), Evaluation::Pending);
        assert_eq!(job.status, Some(JobStatus::Reduce));
        let reduces = job.reduces.as_ref().unwrap();
        assert_eq!(reduces.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(reduces[&1].inputs, vec!["a", "c", "e"]);
        assert_eq!(reduces[&2].inputs, vec!["b", "d", "f"]);
    }

    #[test]
    fn incomplete_maps_stay_in_map_phase() {
        let mut job = job_in_map_phase();
        job.maps.get_mut(&1).unwrap().status = Some(TaskStatus::Progress);
        assert_eq!(job.evaluate(), Evaluation::Pending);
        assert_eq!(job.status, Some(JobStatus::Map));
        assert!(job.reduces.is_none());
    }

    #[test]
    fn map_failure_fails_the_job_with_context() {
        let mut job = job_in_map_phase();
        {
            let task = job.maps.get_mut(&1).unwrap();
            task.status = Some(TaskStatus::Fail);
            task.err = "boom".into();
        }
        match job.evaluate() {
            Evaluation::Fail(err) => {
                assert!(err.contains("MAP:"));
                assert!(err.contains("Task: 1"));
                assert!(err.contains("boom"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(job.status, Some(JobStatus::Fail));
    }

    #[test]
    fn reduce_completion_collects_results_in_order() {
        let mut job = job_in_map_phase();
        job.evaluate();
        {
            let reduces = job.reduces.as_mut().unwrap();
            for (id, out) in [(1u32, "foo"), (2, "bar")] {
                let r = reduces.get_mut(&id).unwrap();
                r.worker = "worker-0".into();
                r.output = out.into();
                r.status = Some(TaskStatus::Complete);
            }
        }
        match job.evaluate() {
            Evaluation::Complete(results) => assert_eq!(results, vec!["foo", "bar"]),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(job.status, Some(JobStatus::Complete));
    }

    #[test]
    fn empty_reduce_output_is_skipped() {
        let mut reduces = BTreeMap::new();
        reduces.insert(
            1,
            ReduceTask {
                output: String::new(),
                status: Some(TaskStatus::Complete),
                ..Default::default()
            },
        );
        reduces.insert(
            2,
            ReduceTask {
                output: "bar".into(),
                status: Some(TaskStatus::Complete),
                ..Default::default()
            },
        );
        assert_eq!(collect_results(&reduces), vec!["bar"]);
    }

    #[test]
    fn derive_reduces_is_deterministic() {
        let job = job_in_map_phase();
        assert_eq!(derive_reduces(&job.maps), derive_reduces(&job.maps));
    }

    #[test]
    fn mismatched_partitions_do_not_crash() {
        let mut job = job_in_map_phase();
        // user bug: one map emitted an extra partition
        job.maps
            .get_mut(&2)
            .unwrap()
            .outputs
            .insert(7, "g".to_string());
        job.evaluate();
        let reduces = job.reduces.as_ref().unwrap();
        assert_eq!(reduces[&7].inputs, vec!["g"]);
    }

    #[test]
    fn claim_patch_enforces_mutual_exclusion() {
        let mut doc = serde_json::to_value(&job_in_map_phase()).unwrap();
        doc["maps"]["0"]["worker"] = serde_json::json!("");
        let a: Vec<json_patch::PatchOperation> = patch_claim_map(0, "worker-a").build().unwrap();
        let b: Vec<json_patch::PatchOperation> = patch_claim_map(0, "worker-b").build().unwrap();
        json_patch::patch(&mut doc, &a).unwrap();
        assert_eq!(doc["maps"]["0"]["worker"], "worker-a");
        // second claimant must lose
        assert!(json_patch::patch(&mut doc, &b).is_err());
        assert_eq!(doc["maps"]["0"]["worker"], "worker-a");
    }

    #[test]
    fn reduces_are_materialized_exactly_once() {
        let job = job_in_map_phase();
        let reduces = derive_reduces(&job.maps);
        let patch: Vec<json_patch::PatchOperation> =
            patch_seed_reduces(&reduces).unwrap().build().unwrap();
        let mut doc = serde_json::to_value(&MapReduceJob::default()).unwrap();
        json_patch::patch(&mut doc, &patch).unwrap();
        assert!(json_patch::patch(&mut doc, &patch).is_err());
    }

    #[test]
    fn statuses_serialize_uppercase() {
        assert_eq!(serde_json::to_value(JobStatus::Map).unwrap(), "MAP");
        assert_eq!(
            serde_json::to_value(TaskStatus::Progress).unwrap(),
            "PROGRESS"
        );
        let job: MapReduceJob = serde_json::from_value(serde_json::json!({
            "name": "foo",
            "status": "REDUCE",
        }))
        .unwrap();
        assert_eq!(job.status, Some(JobStatus::Reduce));
    }
}
