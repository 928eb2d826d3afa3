
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use jobgrid::events::{EventKind, GridEvent};
use jobgrid::messaging::{topic, DispatchPolicy};
use jobgrid::scheduler::{JobId, JobState};
use jobgrid::worker::{
    current_deployment, protocol, ComputeJob, Deployment, FailureKind, JobContext, JobError,
    JobFactory, JobOutcome, JobRequest, JobSpec,
};
use jobgrid::GridError;
use test_harness::{assert_eventually, TestCluster, TEST_DEPLOYMENT};

const WAIT: Duration = Duration::from_secs(3);

fn spec(task: &str) -> JobSpec {
    JobSpec::new(TEST_DEPLOYMENT, task)
}

/// Waits for the first event of `kind`, skipping everything else.
async fn next_event(rx: &mut broadcast::Receiver<GridEvent>, kind: EventKind) -> GridEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if event.kind == kind => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind:?} event within {WAIT:?}"))
}

async fn wait_running(cluster: &TestCluster, node: usize, job_id: JobId) {
    let node = cluster.node(node).clone();
    assert_eventually(
        || {
            let node = node.clone();
            async move { node.job_state(&job_id) == Some(JobState::Running) }
        },
        WAIT,
        "job should be running",
    )
    .await;
}

// =============================================================================
// Results
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_job_across_nodes() {
    let cluster = TestCluster::new(2).await;

    let pending = cluster
        .node(0)
        .submit_job(
            cluster.id(1),
            spec("echo")
                .with_argument(json!({ "x": 1 }))
                .with_attribute("trace", "abc"),
        )
        .unwrap();
    let job_id = pending.job_id();
    assert_eq!(pending.target(), cluster.id(1));

    let response = pending.result_within(WAIT).await.unwrap();
    assert_eq!(response.job_id, job_id);
    assert_eq!(response.node_id, cluster.id(1));
    assert_eq!(response.session_id, cluster.node(0).session_id());
    assert_eq!(response.attributes.get("trace").map(String::as_str), Some("abc"));
    assert_eq!(response.into_result().unwrap(), json!({ "x": 1 }));

    // Finished jobs leave the store.
    assert_eventually(
        || async { cluster.node(1).store().is_empty() },
        WAIT,
        "store should be empty after completion",
    )
    .await;

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_jobs_across_cluster() {
    let cluster = TestCluster::new(3).await;

    let mut pending = Vec::new();
    for i in 0..30 {
        let target = cluster.id(i % 3);
        let p = cluster
            .node(0)
            .submit_job(target, spec("echo").with_argument(json!(i)))
            .unwrap();
        pending.push((i, p));
    }
    for (i, p) in pending {
        let value = p.result_within(WAIT).await.unwrap().into_result().unwrap();
        assert_eq!(value, json!(i));
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_sees_its_deployment() {
    let cluster = TestCluster::new(2).await;

    let response = cluster
        .node(0)
        .submit_job(cluster.id(1), spec("where"))
        .unwrap()
        .result_within(WAIT)
        .await
        .unwrap();
    assert_eq!(response.into_result().unwrap(), json!(TEST_DEPLOYMENT));
    assert!(current_deployment().is_none());

    cluster.shutdown().await;
}

// =============================================================================
// Failure Classification
// =============================================================================

async fn failure_of(cluster: &TestCluster, spec: JobSpec) -> (FailureKind, String) {
    let response = cluster
        .node(0)
        .submit_job(cluster.id(1), spec)
        .unwrap()
        .result_within(WAIT)
        .await
        .unwrap();
    match response.outcome {
        JobOutcome::Failed(failure) => (failure.kind, failure.message),
        JobOutcome::Completed(value) => panic!("expected a failure, got {value}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_class_loading_failures() {
    let cluster = TestCluster::new(2).await;

    let (kind, message) = failure_of(&cluster, spec("no-such-task")).await;
    assert_eq!(kind, FailureKind::ClassLoading);
    assert!(message.contains("no-such-task"));

    let (kind, _) = failure_of(&cluster, JobSpec::new("nowhere", "echo")).await;
    assert_eq!(kind, FailureKind::ClassLoading);

    let (kind, message) = failure_of(&cluster, spec("unconstructible")).await;
    assert_eq!(kind, FailureKind::ClassLoading);
    assert!(message.contains("constructor failed"));

    let (kind, _) = failure_of(&cluster, spec("missing-resource")).await;
    assert_eq!(kind, FailureKind::ClassLoading);

    // Jobs that fail to load never occupy the store.
    assert!(cluster.node(1).store().is_empty());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runtime_failures() {
    let cluster = TestCluster::new(2).await;

    let (kind, message) = failure_of(&cluster, spec("fail")).await;
    assert_eq!(kind, FailureKind::Runtime);
    assert!(message.contains("boom"));

    let (kind, message) = failure_of(&cluster, spec("panic")).await;
    assert_eq!(kind, FailureKind::Runtime);
    assert!(message.contains("job body panicked"));

    // A panicking job does not take the node down.
    let response = cluster
        .node(0)
        .submit_job(cluster.id(1), spec("echo").with_argument(json!("still here")))
        .unwrap()
        .result_within(WAIT)
        .await
        .unwrap();
    assert!(response.is_success());

    cluster.shutdown().await;
}

// =============================================================================
// Timeouts And Topology
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_timed_out_job_sends_no_response() {
    let cluster = TestCluster::new(2).await;
    let mut events = cluster.node(1).subscribe_events();

    let pending = cluster
        .node(0)
        .submit_job(
            cluster.id(1),
            spec("block").with_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    let job_id = pending.job_id();

    let event = next_event(&mut events, EventKind::JobTimedOut).await;
    assert_eq!(event.job_id, Some(job_id));

    let outcome = pending.result_within(Duration::from_millis(300)).await;
    assert!(matches!(outcome, Err(GridError::Timeout(_))));
    assert_eventually(
        || async { cluster.node(1).store().is_empty() },
        WAIT,
        "timed-out job should leave the store",
    )
    .await;

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_response_suppressed_when_origin_leaves() {
    let cluster = TestCluster::new(2).await;
    let mut events = cluster.node(1).subscribe_events();

    let pending = cluster
        .node(0)
        .submit_job(cluster.id(1), spec("block"))
        .unwrap();
    let job_id = pending.job_id();
    wait_running(&cluster, 1, job_id).await;

    cluster.membership.leave(&cluster.id(0));

    let event = next_event(&mut events, EventKind::ResponseSuppressed).await;
    assert_eq!(event.job_id, Some(job_id));
    assert_eq!(event.node_id, Some(cluster.id(0)));
    assert!(cluster.node(1).store().get(&job_id).is_none());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pending_job_fails_when_target_departs() {
    let cluster = TestCluster::new(2).await;
    let mut events = cluster.node(0).subscribe_events();

    let pending = cluster
        .node(0)
        .submit_job(cluster.id(1), spec("block"))
        .unwrap();
    wait_running(&cluster, 1, pending.job_id()).await;

    cluster.membership.fail(&cluster.id(1));

    let outcome = pending.result_within(WAIT).await;
    assert!(matches!(outcome, Err(GridError::StaleTopology(node)) if node == cluster.id(1)));
    let event = next_event(&mut events, EventKind::NodeDeparted).await;
    assert_eq!(event.node_id, Some(cluster.id(1)));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_job_id_rejected() {
    let cluster = TestCluster::new(2).await;
    let mut events = cluster.node(1).subscribe_events();
    let sender = cluster.node(0).dispatcher();

    let request = JobRequest {
        job_id: JobId::new(),
        session_id: cluster.node(0).session_id(),
        deployment: TEST_DEPLOYMENT.to_string(),
        task: "block".to_string(),
        argument: Value::Null,
        timeout_ms: 10_000,
        attributes: BTreeMap::new(),
    };
    let payload = protocol::encode(&request).unwrap();

    sender
        .send(&[cluster.id(1)], &topic::job_request(), payload.clone(), DispatchPolicy::Pooled)
        .unwrap();
    wait_running(&cluster, 1, request.job_id).await;

    sender
        .send(&[cluster.id(1)], &topic::job_request(), payload, DispatchPolicy::Pooled)
        .unwrap();
    let event = next_event(&mut events, EventKind::DuplicateJob).await;
    assert_eq!(event.job_id, Some(request.job_id));
    assert_eq!(cluster.node(1).store().len(), 1);

    cluster.shutdown().await;
}

// =============================================================================
// Cancellation
// =============================================================================

/// Blocks until interrupted and records the deployment its cancel hook ran in.
struct HookedJob {
    seen: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl ComputeJob for HookedJob {
    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
        ctx.cancelled().await;
        Err(JobError::Failed("interrupted".into()))
    }

    fn cancel(&self) {
        *self.seen.lock().unwrap() = current_deployment().map(|d| d.name().to_string());
    }
}

struct HookedFactory {
    seen: Arc<Mutex<Option<String>>>,
}

impl JobFactory for HookedFactory {
    fn create(&self, _argument: &Value) -> Result<Arc<dyn ComputeJob>, JobError> {
        Ok(Arc::new(HookedJob {
            seen: self.seen.clone(),
        }))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_hook_runs_in_deployment() {
    let cluster = TestCluster::new(2).await;
    let seen = Arc::new(Mutex::new(None));
    cluster.deployments.deploy(
        Deployment::new("hooks").with_task("hooked", HookedFactory { seen: seen.clone() }),
    );

    let pending = cluster
        .node(0)
        .submit_job(cluster.id(1), JobSpec::new("hooks", "hooked"))
        .unwrap();
    wait_running(&cluster, 1, pending.job_id()).await;

    pending.cancel().unwrap();
    let response = pending.result_within(WAIT).await.unwrap();
    assert_eq!(response.failure().map(|f| f.kind), Some(FailureKind::Cancelled));
    assert_eq!(seen.lock().unwrap().as_deref(), Some("hooks"));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_from_other_node_ignored() {
    let cluster = TestCluster::new(3).await;

    let pending = cluster
        .node(0)
        .submit_job(cluster.id(1), spec("block"))
        .unwrap();
    let job_id = pending.job_id();
    wait_running(&cluster, 1, job_id).await;

    cluster.node(2).request_cancel(cluster.id(1), job_id).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.node(1).job_state(&job_id), Some(JobState::Running));

    cluster.node(0).request_cancel(cluster.id(1), job_id).unwrap();
    let response = pending.result_within(WAIT).await.unwrap();
    assert_eq!(response.failure().map(|f| f.kind), Some(FailureKind::Cancelled));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_cancels_remaining_jobs() {
    let cluster = TestCluster::with_config(2, |cfg| cfg.with_parallel_jobs(1)).await;

    let running = cluster
        .node(0)
        .submit_job(cluster.id(1), spec("block"))
        .unwrap();
    wait_running(&cluster, 1, running.job_id()).await;
    let waiting = cluster
        .node(0)
        .submit_job(cluster.id(1), spec("block"))
        .unwrap();
    let waiting_id = waiting.job_id();
    let store = cluster.node(1).store().clone();
    assert_eventually(
        || async { store.get(&waiting_id).is_some() },
        WAIT,
        "second job should be queued",
    )
    .await;

    cluster.node(1).stop().await;

    for pending in [running, waiting] {
        let response = pending.result_within(WAIT).await.unwrap();
        assert_eq!(response.failure().map(|f| f.kind), Some(FailureKind::Cancelled));
    }
    assert!(matches!(
        cluster.node(1).submit_job(cluster.id(0), spec("echo")),
        Err(GridError::Stopping)
    ));

    cluster.shutdown().await;
}
