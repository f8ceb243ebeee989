//! The embedded coordination server and its evaluator loop.
//!
//! In in-process mode the launcher owns the authoritative job state in
//! memory and exposes it over HTTP: workers GET the document and PUT whole
//! tasks back. Reads share the lock, mutations take it exclusively, and
//! every mutation pokes a buffered channel so the evaluator re-checks the
//! terminal conditions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info};

use crate::job::{Evaluation, JobStatus, MapReduceJob, MapTask, ReduceTask};

/// Poke channel capacity; buffered so handlers never block on the evaluator.
const POKE_BUFFER: usize = 10;

#[derive(Clone)]
pub struct AppState {
    job: Arc<RwLock<MapReduceJob>>,
    poke: mpsc::Sender<()>,
}

pub fn build_router(jobname: &str, state: AppState) -> Router {
    Router::new()
        .route(&format!("/{jobname}/"), get(handle_get))
        .route(&format!("/{jobname}/map/:taskid/"), put(handle_map))
        .route(&format!("/{jobname}/reduce/:taskid/"), put(handle_reduce))
        .with_state(state)
}

/* ---------------- handlers ---------------- */

async fn handle_get(State(state): State<AppState>) -> Response {
    let body = {
        let job = state.job.read().await;
        serde_json::to_string(&*job)
    };
    let resp = match body {
        Ok(b) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            b,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    };
    // Re-check progress after every read as well; a worker polling for the
    // reduce table may be the only traffic left.
    let _ = state.poke.try_send(());
    resp
}

async fn handle_map(
    State(state): State<AppState>,
    Path(taskid): Path<usize>,
    Json(task): Json<MapTask>,
) -> (StatusCode, String) {
    let mut job = state.job.write().await;
    if job.status != Some(JobStatus::Map) {
        return (StatusCode::BAD_REQUEST, "Not in map phase".to_string());
    }
    let Some(current) = job.maps.get(&taskid) else {
        return (StatusCode::NOT_FOUND, format!("Task {taskid} is not found"));
    };
    // Store the task only if nobody owns it, or the caller is the owner
    if !current.worker.is_empty() && current.worker != task.worker {
        return (
            StatusCode::BAD_REQUEST,
            format!("Task {taskid} is already acquired by {}", current.worker),
        );
    }
    job.maps.insert(taskid, task);
    drop(job);
    let _ = state.poke.try_send(());
    (StatusCode::OK, String::new())
}

async fn handle_reduce(
    State(state): State<AppState>,
    Path(taskid): Path<u32>,
    Json(task): Json<ReduceTask>,
) -> (StatusCode, String) {
    let mut job = state.job.write().await;
    if job.status != Some(JobStatus::Reduce) {
        return (StatusCode::BAD_REQUEST, "Not in reduce phase".to_string());
    }
    let Some(current) = job.reduces.as_ref().and_then(|r| r.get(&taskid)) else {
        return (StatusCode::NOT_FOUND, format!("Task {taskid} is not found"));
    };
    if !current.worker.is_empty() && current.worker != task.worker {
        return (
            StatusCode::BAD_REQUEST,
            format!("Task {taskid} is already acquired by {}", current.worker),
        );
    }
    if let Some(reduces) = job.reduces.as_mut() {
        reduces.insert(taskid, task);
    }
    drop(job);
    let _ = state.poke.try_send(());
    (StatusCode::OK, String::new())
}

/* ---------------- evaluator ---------------- */

/// Serves the job on `listener` and drives it to a terminal state.
///
/// Seeds one map task per input, enters the map phase and then waits for
/// worker traffic; each poke re-evaluates the state machine. The server is
/// shut down on every terminal path, including the global timeout. Deleting
/// platform resources is the caller's half of the teardown.
pub async fn run(
    mut job: MapReduceJob,
    listener: TcpListener,
    timeout: Duration,
) -> Result<Vec<String>> {
    if job.maps.is_empty() {
        if let Some(spec) = job.spec.get() {
            job.maps = spec
                .inputs
                .iter()
                .enumerate()
                .map(|(i, input)| (i, MapTask::seeded(input)))
                .collect();
        }
    }
    job.status = Some(JobStatus::Map);
    let name = job.name.clone();

    let (poke_tx, mut poke_rx) = mpsc::channel(POKE_BUFFER);
    let state = AppState {
        job: Arc::new(RwLock::new(job)),
        poke: poke_tx,
    };
    let app = build_router(&name, state.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    info!("job {name} listening on {}", listener.local_addr()?);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let outcome = loop {
        tokio::select! {
            _ = poke_rx.recv() => {
                debug!("poked");
                let mut job = state.job.write().await;
                match job.evaluate() {
                    Evaluation::Pending => {}
                    Evaluation::Complete(results) => break Ok(results),
                    Evaluation::Fail(err) => break Err(anyhow!(err)),
                }
            }
            _ = &mut deadline => {
                let err = format!("Job timed out after {timeout:?}");
                state.job.write().await.fail(err.clone());
                break Err(anyhow!(err));
            }
        }
    };

    let _ = shutdown_tx.send(());
    if let Err(err) = server.await? {
        error!("server shutdown: {err}");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::task::JoinHandle;

    fn testjob() -> MapReduceJob {
        serde_json::from_value(json!({
            "name": "foo",
            "spec": {
                "inputs": ["a", "b", "c"],
                "template": {"spec": {"containers": [{
                    "name": "wordcount",
                    "image": "turbobytes/kubemr-wordcount"
                }]}}
            }
        }))
        .unwrap()
    }

    async fn start(timeout: Duration) -> (String, JoinHandle<Result<Vec<String>>>) {
        // kube-client and aws-sdk-s3 pull in rustls with different default
        // crypto providers (ring vs aws-lc-rs); pin one explicitly so the
        // reqwest client used below doesn't panic on an ambiguous default.
        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::aws_lc_rs::default_provider(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/foo/", listener.local_addr().unwrap());
        let handle = tokio::spawn(run(testjob(), listener, timeout));
        (base, handle)
    }

    async fn get_doc(client: &reqwest::Client, base: &str) -> Value {
        for _ in 0..50 {
            if let Ok(resp) = client.get(base).send().await {
                return resp.json().await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never came up at {base}");
    }

    async fn get_doc_when(
        client: &reqwest::Client,
        base: &str,
        pred: impl Fn(&Value) -> bool,
    ) -> Value {
        for _ in 0..100 {
            let doc = get_doc(client, base).await;
            if pred(&doc) {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never reached");
    }

    async fn put(client: &reqwest::Client, url: &str, body: Value) -> StatusCode {
        let resp = client.put(url).json(&body).send().await.unwrap();
        StatusCode::from_u16(resp.status().as_u16()).unwrap()
    }

    fn done_map(worker: &str, outputs: Value) -> Value {
        json!({
            "worker": worker,
            "input": "a",
            "outputs": outputs,
            "error": "",
            "status": "COMPLETE",
        })
    }

    #[tokio::test]
    async fn happy_path_runs_to_complete() {
        let (base, handle) = start(Duration::from_secs(60)).await;
        let client = reqwest::Client::new();

        let doc = get_doc(&client, &base).await;
        assert_eq!(doc["status"], "MAP");
        assert_eq!(doc["maps"].as_object().unwrap().len(), 3);

        for (i, (x, y)) in [("a", "b"), ("c", "d"), ("e", "f")].iter().enumerate() {
            let code = put(
                &client,
                &format!("{base}map/{i}/"),
                done_map("foo", json!({"1": x, "2": y})),
            )
            .await;
            assert_eq!(code, StatusCode::OK);
        }

        let doc = get_doc_when(&client, &base, |d| d["status"] == "REDUCE").await;
        let reduces = doc["reduces"].as_object().unwrap();
        assert_eq!(reduces.len(), 2);
        assert_eq!(doc["reduces"]["1"]["inputs"], json!(["a", "c", "e"]));
        assert_eq!(doc["reduces"]["2"]["inputs"], json!(["b", "d", "f"]));

        // map phase is over now
        let resp = client
            .put(format!("{base}map/0/"))
            .json(&done_map("foo", json!({})))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        assert_eq!(resp.text().await.unwrap(), "Not in map phase");

        for (id, out) in [(1, "foo"), (2, "bar")] {
            let body = json!({
                "worker": "foo",
                "inputs": ["a", "c", "e"],
                "output": out,
                "error": "",
                "status": "COMPLETE",
            });
            let code = put(&client, &format!("{base}reduce/{id}/"), body).await;
            assert_eq!(code, StatusCode::OK);
        }

        let results = handle.await.unwrap().unwrap();
        assert_eq!(results, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn map_failure_terminates_the_job() {
        let (base, handle) = start(Duration::from_secs(60)).await;
        let client = reqwest::Client::new();
        get_doc(&client, &base).await;

        let body = json!({"worker": "w1", "input": "b", "error": "boom", "status": "FAIL"});
        let code = put(&client, &format!("{base}map/1/"), body).await;
        assert_eq!(code, StatusCode::OK);

        let err = handle.await.unwrap().unwrap_err().to_string();
        assert!(err.contains("MAP:"), "{err}");
        assert!(err.contains("Task: 1"), "{err}");
        assert!(err.contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn second_claimant_gets_rejected() {
        let (base, handle) = start(Duration::from_secs(60)).await;
        let client = reqwest::Client::new();
        get_doc(&client, &base).await;

        let claim = |worker: &str| {
            json!({"worker": worker, "input": "a", "status": "PROGRESS", "error": ""})
        };
        let url = format!("{base}map/0/");
        assert_eq!(put(&client, &url, claim("A")).await, StatusCode::OK);
        assert_eq!(put(&client, &url, claim("B")).await, StatusCode::BAD_REQUEST);

        let doc = get_doc(&client, &base).await;
        assert_eq!(doc["maps"]["0"]["worker"], "A");

        // the owner may keep updating its own task
        assert_eq!(put(&client, &url, claim("A")).await, StatusCode::OK);
        handle.abort();
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (base, handle) = start(Duration::from_secs(60)).await;
        let client = reqwest::Client::new();
        get_doc(&client, &base).await;

        let body = json!({"worker": "w", "input": "a", "status": "PROGRESS"});
        let code = put(&client, &format!("{base}map/9/"), body).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        handle.abort();
    }

    #[tokio::test]
    async fn evaluator_times_out() {
        let (_base, handle) = start(Duration::from_millis(50)).await;
        let err = handle.await.unwrap().unwrap_err().to_string();
        assert!(err.contains("Job timed out after"), "{err}");
    }
}
