use std::time::Duration;

use crate::cluster::NodeId;

/// Topic dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long envelopes from not-yet-discovered senders are kept waiting for
    /// the sender's JOINED event. Older entries are purged undelivered.
    pub discovery_startup_window: Duration,
    /// Capacity of the closed-topic set (oldest entries evicted first).
    pub max_closed_topics: usize,
    /// Workers reserved for DEDICATED envelopes.
    pub dedicated_pool_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            discovery_startup_window: Duration::from_secs(60),
            max_closed_topics: 10_240,
            dedicated_pool_size: 4,
        }
    }
}

/// Local job execution settings.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Jobs that may run concurrently; activations beyond this are rejected.
    pub pool_size: usize,
    /// Applied to requests that do not declare their own timeout.
    pub default_job_timeout: Duration,
    /// How long a stopping node waits for cancelled jobs to report back.
    pub shutdown_grace: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            default_job_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Settings of the built-in FIFO collision policy.
#[derive(Debug, Clone)]
pub struct CollisionConfig {
    /// Maximum number of active jobs.
    pub parallel_jobs: usize,
    /// Passive jobs beyond this are rejected. `None` means unbounded.
    pub max_waiting_jobs: Option<usize>,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            parallel_jobs: 16,
            max_waiting_jobs: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub name: String,
    pub dispatcher: DispatcherConfig,
    pub execution: ExecutionConfig,
    pub collision: CollisionConfig,
    /// Capacity of the node event bus.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            name: "node".to_string(),
            dispatcher: DispatcherConfig::default(),
            execution: ExecutionConfig::default(),
            collision: CollisionConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, name: impl Into<String>) -> Self {
        Self {
            node_id,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_discovery_window(mut self, window: Duration) -> Self {
        self.dispatcher.discovery_startup_window = window;
        self
    }

    pub fn with_max_closed_topics(mut self, max: usize) -> Self {
        self.dispatcher.max_closed_topics = max;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.execution.pool_size = pool_size;
        self
    }

    pub fn with_default_job_timeout(mut self, timeout: Duration) -> Self {
        self.execution.default_job_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.execution.shutdown_grace = grace;
        self
    }

    pub fn with_parallel_jobs(mut self, parallel_jobs: usize) -> Self {
        self.collision.parallel_jobs = parallel_jobs;
        self
    }

    pub fn with_max_waiting_jobs(mut self, max: usize) -> Self {
        self.collision.max_waiting_jobs = Some(max);
        self
    }
}
