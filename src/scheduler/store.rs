use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cluster::NodeId;
use crate::error::{GridError, Result};
use crate::scheduler::job::JobId;
use crate::shutdown::{GateGuard, ShutdownGate};
use crate::worker::JobWorker;

/// Which map a job currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Passive,
    Active,
    Cancelled,
}

/// Point-in-time counts of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCensus {
    pub passive: usize,
    pub active: usize,
    pub cancelled: usize,
    /// Longest wait among passive jobs.
    pub max_wait: Duration,
    /// Longest running active job.
    pub max_execution: Duration,
}

#[derive(Debug, Default)]
struct StoreState {
    passive: HashMap<JobId, Arc<JobWorker>>,
    active: HashMap<JobId, Arc<JobWorker>>,
    cancelled: HashMap<JobId, Arc<JobWorker>>,
    dirty: bool,
}

impl StoreState {
    fn contains(&self, id: &JobId) -> bool {
        self.passive.contains_key(id)
            || self.active.contains_key(id)
            || self.cancelled.contains_key(id)
    }
}

/// Passive, active and cancelled job maps behind one lock.
///
/// A job is in exactly one map at a time. Every mutation except activation
/// sets the dirty flag, so a cleared flag is always re-set before the next
/// admission pass can mistake the state for stable.
#[derive(Debug)]
pub struct JobStore {
    state: Mutex<StoreState>,
    gate: Arc<ShutdownGate>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            gate: ShutdownGate::new(),
        }
    }
}

impl JobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a newly received job. Job ids already present anywhere are rejected.
    pub fn insert_passive(&self, worker: Arc<JobWorker>) -> Result<()> {
        let id = worker.job_id();
        let mut state = self.lock();
        if state.contains(&id) {
            return Err(GridError::DuplicateJobId(id));
        }
        state.passive.insert(id, worker);
        state.dirty = true;
        Ok(())
    }

    /// Moves a job from passive to active.
    pub fn activate(&self, id: &JobId) -> bool {
        let mut state = self.lock();
        match state.passive.remove(id) {
            Some(worker) => {
                state.active.insert(*id, worker);
                true
            }
            None => false,
        }
    }

    /// Moves a passive or active job to cancelled. Returns the worker only on
    /// the call that actually moved it.
    pub fn cancel(&self, id: &JobId) -> Option<Arc<JobWorker>> {
        let mut state = self.lock();
        let worker = state
            .passive
            .remove(id)
            .or_else(|| state.active.remove(id))?;
        state.cancelled.insert(*id, worker.clone());
        state.dirty = true;
        Some(worker)
    }

    /// Drops a finished job from whichever map holds it.
    pub fn remove(&self, id: &JobId) -> Option<Arc<JobWorker>> {
        let mut state = self.lock();
        let worker = state
            .passive
            .remove(id)
            .or_else(|| state.active.remove(id))
            .or_else(|| state.cancelled.remove(id));
        if worker.is_some() {
            state.dirty = true;
        }
        worker
    }

    pub fn mark_dirty(&self) {
        self.lock().dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Returns `(passive, active)` and clears the dirty flag, or `None` when
    /// nothing changed since the last snapshot. Passive jobs come oldest first.
    pub fn take_snapshot(&self) -> Option<(Vec<Arc<JobWorker>>, Vec<Arc<JobWorker>>)> {
        let mut state = self.lock();
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        let mut passive: Vec<Arc<JobWorker>> = state.passive.values().cloned().collect();
        let active: Vec<Arc<JobWorker>> = state.active.values().cloned().collect();
        drop(state);

        passive.sort_by_key(|w| std::cmp::Reverse(w.queued_time()));
        Some((passive, active))
    }

    pub fn census(&self) -> JobCensus {
        let state = self.lock();
        JobCensus {
            passive: state.passive.len(),
            active: state.active.len(),
            cancelled: state.cancelled.len(),
            max_wait: state
                .passive
                .values()
                .map(|w| w.queued_time())
                .max()
                .unwrap_or_default(),
            max_execution: state
                .active
                .values()
                .map(|w| w.execution_time())
                .max()
                .unwrap_or_default(),
        }
    }

    pub fn get(&self, id: &JobId) -> Option<Arc<JobWorker>> {
        let state = self.lock();
        state
            .passive
            .get(id)
            .or_else(|| state.active.get(id))
            .or_else(|| state.cancelled.get(id))
            .cloned()
    }

    pub fn placement(&self, id: &JobId) -> Option<Placement> {
        let state = self.lock();
        if state.passive.contains_key(id) {
            Some(Placement::Passive)
        } else if state.active.contains_key(id) {
            Some(Placement::Active)
        } else if state.cancelled.contains_key(id) {
            Some(Placement::Cancelled)
        } else {
            None
        }
    }

    /// Passive and active jobs submitted by `origin`.
    pub fn jobs_from(&self, origin: &NodeId) -> Vec<Arc<JobWorker>> {
        let state = self.lock();
        state
            .passive
            .values()
            .chain(state.active.values())
            .filter(|w| w.origin() == *origin)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<JobWorker>> {
        let state = self.lock();
        state
            .passive
            .values()
            .chain(state.active.values())
            .chain(state.cancelled.values())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        state.passive.len() + state.active.len() + state.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry guard for handlers that mutate the store. `None` while stopping.
    pub fn enter(&self) -> Option<GateGuard> {
        self.gate.enter()
    }

    pub fn is_stopping(&self) -> bool {
        self.gate.is_stopping()
    }

    /// Refuses new handlers and waits for running ones to finish.
    pub async fn stop(&self) {
        self.gate.stop().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
