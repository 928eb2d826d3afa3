use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::store::JobCensus;

/// Job metrics published after every admission pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobMetricsSnapshot {
    pub active_jobs: usize,
    pub passive_jobs: usize,
    pub cancelled_jobs: usize,
    /// Totals since the node started.
    pub started_total: u64,
    pub rejected_total: u64,
    pub cancelled_total: u64,
    pub max_wait_time: Duration,
    pub max_execution_time: Duration,
    /// Jobs finished since the previous snapshot.
    pub finished_jobs: u64,
    /// Summed execution time of those jobs.
    pub finished_time: Duration,
    pub taken_at: DateTime<Utc>,
}

impl Default for JobMetricsSnapshot {
    fn default() -> Self {
        Self {
            active_jobs: 0,
            passive_jobs: 0,
            cancelled_jobs: 0,
            started_total: 0,
            rejected_total: 0,
            cancelled_total: 0,
            max_wait_time: Duration::ZERO,
            max_execution_time: Duration::ZERO,
            finished_jobs: 0,
            finished_time: Duration::ZERO,
            taken_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct FinishedWindow {
    count: u64,
    time: Duration,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    started: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    finished: Mutex<FinishedWindow>,
}

impl MetricsCollector {
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self, execution_time: Duration) {
        let mut window = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        window.count += 1;
        window.time += execution_time;
    }

    /// Builds a snapshot and resets the finished-jobs window.
    pub fn snapshot(&self, census: JobCensus) -> JobMetricsSnapshot {
        let window = {
            let mut window = self.finished.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *window)
        };
        JobMetricsSnapshot {
            active_jobs: census.active,
            passive_jobs: census.passive,
            cancelled_jobs: census.cancelled,
            started_total: self.started.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
            cancelled_total: self.cancelled.load(Ordering::Relaxed),
            max_wait_time: census.max_wait,
            max_execution_time: census.max_execution,
            finished_jobs: window.count,
            finished_time: window.time,
            taken_at: Utc::now(),
        }
    }
}
