//! Deployments: the code a node can run, and the context jobs run in.
//!
//! A [`Deployment`] maps task names to [`JobFactory`] implementations. The
//! [`DeploymentRegistry`] is constructed explicitly and handed to the node;
//! there is no global registry. While a job body or its cancellation hook
//! runs, its deployment is available through [`current_deployment`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::cluster::NodeId;
use crate::scheduler::{JobId, SessionId};
use crate::worker::protocol::{FailureKind, JobFailure};

tokio::task_local! {
    pub(crate) static CURRENT_DEPLOYMENT: Arc<Deployment>;
}

/// Deployment of the job currently executing on this task, if any.
pub fn current_deployment() -> Option<Arc<Deployment>> {
    CURRENT_DEPLOYMENT.try_with(|d| d.clone()).ok()
}

/// Errors returned by job bodies and factories.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A class, resource or dependency the job needs is missing.
    #[error("resource loading failed: {0}")]
    ResourceLoading(String),

    #[error("{0}")]
    Failed(String),
}

/// Everything a job body can see about its own execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    session_id: SessionId,
    origin: NodeId,
    argument: Value,
    attributes: BTreeMap<String, String>,
    token: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        session_id: SessionId,
        origin: NodeId,
        argument: Value,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            job_id,
            session_id,
            origin,
            argument,
            attributes,
            token: CancellationToken::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Node that submitted the job.
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn argument(&self) -> &Value {
        &self.argument
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Set once the job is cancelled or times out.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the job is interrupted. Long-running bodies should
    /// `select!` on this.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub(crate) fn interrupt(&self) {
        self.token.cancel();
    }
}

#[async_trait]
pub trait ComputeJob: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError>;

    /// Called once, inside the job's deployment context, when the job is
    /// cancelled or times out.
    fn cancel(&self) {}
}

pub trait JobFactory: Send + Sync {
    fn create(&self, argument: &Value) -> Result<Arc<dyn ComputeJob>, JobError>;
}

impl<F> JobFactory for F
where
    F: Fn(&Value) -> Result<Arc<dyn ComputeJob>, JobError> + Send + Sync,
{
    fn create(&self, argument: &Value) -> Result<Arc<dyn ComputeJob>, JobError> {
        self(argument)
    }
}

pub struct Deployment {
    name: String,
    tasks: HashMap<String, Arc<dyn JobFactory>>,
}

impl Deployment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: HashMap::new(),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>, factory: impl JobFactory + 'static) -> Self {
        self.tasks.insert(task.into(), Arc::new(factory));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self, task: &str) -> Option<Arc<dyn JobFactory>> {
        self.tasks.get(task).cloned()
    }

    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("name", &self.name)
            .field("tasks", &self.task_names())
            .finish()
    }
}

/// A job resolved against its deployment, ready to run.
#[derive(Clone)]
pub struct LoadedJob {
    pub deployment: Arc<Deployment>,
    pub job: Arc<dyn ComputeJob>,
}

#[derive(Default)]
pub struct DeploymentRegistry {
    deployments: Mutex<HashMap<String, Arc<Deployment>>>,
}

impl DeploymentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces any deployment with the same name.
    pub fn deploy(&self, deployment: Deployment) {
        let name = deployment.name.clone();
        self.lock().insert(name.clone(), Arc::new(deployment));
        tracing::info!(deployment = %name, "Deployment registered");
    }

    pub fn undeploy(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Deployment>> {
        self.lock().get(name).cloned()
    }

    /// Resolves and instantiates a job. Any failure is a class-loading failure.
    pub fn load(
        &self,
        job_id: JobId,
        deployment: &str,
        task: &str,
        argument: &Value,
    ) -> Result<LoadedJob, JobFailure> {
        let dep = self.get(deployment).ok_or_else(|| {
            JobFailure::new(
                job_id,
                FailureKind::ClassLoading,
                format!("unknown deployment: {deployment}"),
            )
        })?;
        let factory = dep.task(task).ok_or_else(|| {
            JobFailure::new(
                job_id,
                FailureKind::ClassLoading,
                format!("unknown task {task} in deployment {deployment}"),
            )
        })?;
        let job = CURRENT_DEPLOYMENT
            .sync_scope(dep.clone(), || factory.create(argument))
            .map_err(|e| JobFailure::new(job_id, FailureKind::ClassLoading, e.to_string()))?;
        Ok(LoadedJob {
            deployment: dep,
            job,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Deployment>>> {
        self.deployments.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ComputeJob for Echo {
        async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
            let name = current_deployment().map(|d| d.name().to_string());
            Ok(serde_json::json!({ "arg": ctx.argument(), "deployment": name }))
        }
    }

    fn echo_factory(_: &Value) -> Result<Arc<dyn ComputeJob>, JobError> {
        Ok(Arc::new(Echo))
    }

    fn failing_factory(_: &Value) -> Result<Arc<dyn ComputeJob>, JobError> {
        Err(JobError::Failed("no instance".into()))
    }

    #[test]
    fn load_resolves_known_tasks() {
        let registry = DeploymentRegistry::new();
        registry.deploy(Deployment::new("demo").with_task("echo", echo_factory));

        let loaded = registry
            .load(JobId::new(), "demo", "echo", &Value::Null)
            .unwrap();
        assert_eq!(loaded.deployment.name(), "demo");
    }

    #[test]
    fn load_failures_are_class_loading() {
        let registry = DeploymentRegistry::new();
        registry.deploy(
            Deployment::new("demo")
                .with_task("echo", echo_factory)
                .with_task("broken", failing_factory),
        );
        let id = JobId::new();

        for (dep, task) in [("missing", "echo"), ("demo", "missing"), ("demo", "broken")] {
            let err = registry.load(id, dep, task, &Value::Null).err().unwrap();
            assert_eq!(err.kind, FailureKind::ClassLoading);
            assert_eq!(err.job_id, id);
        }
    }

    #[tokio::test]
    async fn deployment_is_visible_inside_scope_only() {
        let dep = Arc::new(Deployment::new("scoped"));
        let ctx = JobContext::new(
            JobId::new(),
            SessionId::new(),
            NodeId::new(),
            Value::Null,
            BTreeMap::new(),
        );

        let out = CURRENT_DEPLOYMENT
            .scope(dep, async { Echo.execute(&ctx).await })
            .await
            .unwrap();
        assert_eq!(out["deployment"], "scoped");
        assert!(current_deployment().is_none());
    }
}
