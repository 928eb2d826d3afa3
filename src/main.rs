use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use jobgrid::cluster::{ClusterNode, InMemoryMembership, LoopbackNetwork, NodeId, TimeoutProcessor};
use jobgrid::config::NodeConfig;
use jobgrid::shutdown::install_shutdown_handler;
use jobgrid::worker::{
    ComputeJob, Deployment, DeploymentRegistry, JobContext, JobError, JobOutcome, JobSpec,
};
use jobgrid::{GridError, GridNode, NodeContext};

#[derive(Parser, Debug)]
#[command(name = "jobgrid")]
#[command(version)]
#[command(about = "Cluster job execution core with ordered topic messaging")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process cluster and push demo jobs through it
    Demo(DemoArgs),
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Number of jobs submitted from the first node
    #[arg(long, default_value = "12")]
    jobs: usize,

    /// Jobs each node runs at the same time
    #[arg(long, default_value = "2")]
    parallel_jobs: usize,

    /// Execution slots per node
    #[arg(long, default_value = "4")]
    pool_size: usize,

    /// Waiting jobs per node beyond which new jobs are rejected
    #[arg(long)]
    max_waiting_jobs: Option<usize>,

    /// Per-job timeout in milliseconds
    #[arg(long, default_value = "5000")]
    job_timeout_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Demo Jobs
// =============================================================================

/// Adds up a JSON array of numbers.
struct SumJob;

#[async_trait]
impl ComputeJob for SumJob {
    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let numbers = ctx
            .argument()
            .as_array()
            .ok_or_else(|| JobError::Failed("expected an array of numbers".into()))?;
        let sum: f64 = numbers.iter().filter_map(Value::as_f64).sum();
        Ok(json!(sum))
    }
}

/// Sleeps for the requested number of milliseconds unless interrupted.
struct SleepJob;

#[async_trait]
impl ComputeJob for SleepJob {
    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let ms = ctx.argument().as_u64().unwrap_or(100);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
            _ = ctx.cancelled() => Err(JobError::Failed("interrupted".into())),
        }
    }
}

/// Always fails.
struct FailJob;

#[async_trait]
impl ComputeJob for FailJob {
    async fn execute(&self, _ctx: &JobContext) -> Result<Value, JobError> {
        Err(JobError::Failed("this job always fails".into()))
    }
}

fn sum_factory(_: &Value) -> Result<Arc<dyn ComputeJob>, JobError> {
    Ok(Arc::new(SumJob))
}

fn sleep_factory(_: &Value) -> Result<Arc<dyn ComputeJob>, JobError> {
    Ok(Arc::new(SleepJob))
}

fn fail_factory(_: &Value) -> Result<Arc<dyn ComputeJob>, JobError> {
    Ok(Arc::new(FailJob))
}

fn demo_deployment() -> Deployment {
    Deployment::new("demo")
        .with_task("sum", sum_factory)
        .with_task("sleep", sleep_factory)
        .with_task("fail", fail_factory)
}

fn demo_spec(i: usize) -> JobSpec {
    let spec = match i % 4 {
        0 | 3 => JobSpec::new("demo", "sum").with_argument(json!([i, i + 1, i + 2])),
        1 => JobSpec::new("demo", "sleep").with_argument(json!(50 * (i as u64 % 5 + 1))),
        _ => JobSpec::new("demo", "fail"),
    };
    spec.with_attribute("index", i.to_string())
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobResultOutput {
    job_id: String,
    task: String,
    node: String,
    status: String,
    result: Value,
}

#[derive(Serialize)]
struct NodeMetricsOutput {
    node: String,
    started: u64,
    rejected: u64,
    cancelled: u64,
}

#[derive(Serialize)]
struct DemoOutput {
    jobs: Vec<JobResultOutput>,
    nodes: Vec<NodeMetricsOutput>,
}

// =============================================================================
// Demo Implementation
// =============================================================================

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();

    let membership = InMemoryMembership::new();
    let network = LoopbackNetwork::new();
    let timeouts = TimeoutProcessor::new();
    let deployments = DeploymentRegistry::new();
    deployments.deploy(demo_deployment());

    let mut nodes: Vec<(String, Arc<GridNode>)> = Vec::with_capacity(args.nodes.max(1));
    for i in 0..args.nodes.max(1) {
        let id = NodeId::new();
        let name = format!("node-{}", i + 1);
        let mut config = NodeConfig::new(id, name.clone())
            .with_parallel_jobs(args.parallel_jobs)
            .with_pool_size(args.pool_size)
            .with_default_job_timeout(Duration::from_millis(args.job_timeout_ms));
        if let Some(max) = args.max_waiting_jobs {
            config = config.with_max_waiting_jobs(max);
        }

        let ctx = NodeContext::new(
            membership.provider(id),
            network.endpoint(id),
            timeouts.clone(),
            deployments.clone(),
        );
        let node = GridNode::new(config, ctx);
        node.start();
        membership.join(ClusterNode::new(id, name.clone()));
        nodes.push((name, node));
    }

    let (_, client) = &nodes[0];
    let mut submitted = Vec::with_capacity(args.jobs);
    for i in 0..args.jobs {
        let (target_name, target) = &nodes[i % nodes.len()];
        let spec = demo_spec(i);
        let task = spec.task.clone();
        let pending = client.submit_job(target.local_node_id(), spec)?;
        submitted.push((task, target_name.clone(), pending));
    }

    let limit = Duration::from_millis(args.job_timeout_ms) + Duration::from_secs(1);
    let waits = submitted.into_iter().map(|(task, node, pending)| async move {
        let job_id = pending.job_id();
        (job_id, task, node, pending.result_within(limit).await)
    });

    let results = tokio::select! {
        results = futures::future::join_all(waits) => results,
        _ = shutdown.cancelled() => {
            for (_, node) in &nodes {
                node.stop().await;
            }
            return Err(GridError::Stopping.into());
        }
    };

    let jobs: Vec<JobResultOutput> = results
        .into_iter()
        .map(|(job_id, task, node, outcome)| {
            let (status, result) = match outcome {
                Ok(response) => match response.outcome {
                    JobOutcome::Completed(value) => ("completed".to_string(), value),
                    JobOutcome::Failed(failure) => {
                        (format!("failed ({})", failure.kind), json!(failure.message))
                    }
                },
                Err(e) => ("no response".to_string(), json!(e.to_string())),
            };
            JobResultOutput {
                job_id: job_id.to_string(),
                task,
                node,
                status,
                result,
            }
        })
        .collect();

    let metrics: Vec<NodeMetricsOutput> = nodes
        .iter()
        .map(|(name, node)| {
            let snapshot = node.latest_metrics();
            NodeMetricsOutput {
                node: name.clone(),
                started: snapshot.started_total,
                rejected: snapshot.rejected_total,
                cancelled: snapshot.cancelled_total,
            }
        })
        .collect();

    for (_, node) in &nodes {
        node.stop().await;
    }

    print_demo(&args.output, DemoOutput { jobs, nodes: metrics })
}

fn print_demo(
    output_format: &OutputFormat,
    output: DemoOutput,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<38} {:<7} {:<8} {:<22} RESULT",
                "JOB ID", "TASK", "NODE", "STATUS"
            );
            println!("{}", "-".repeat(96));
            for job in &output.jobs {
                let result = job.result.to_string();
                let result_display = if result.chars().count() > 30 {
                    format!("{}...", result.chars().take(27).collect::<String>())
                } else {
                    result
                };
                println!(
                    "{:<38} {:<7} {:<8} {:<22} {}",
                    job.job_id, job.task, job.node, job.status, result_display
                );
            }
            println!();
            println!("{:<8} {:<8} {:<9} CANCELLED", "NODE", "STARTED", "REJECTED");
            println!("{}", "-".repeat(36));
            for node in &output.nodes {
                println!(
                    "{:<8} {:<8} {:<9} {}",
                    node.node, node.started, node.rejected, node.cancelled
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Demo(demo_args) => {
            run_demo(demo_args).await?;
        }
    }

    Ok(())
}
