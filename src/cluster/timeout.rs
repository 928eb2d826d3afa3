use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Identifier of a registered timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(pub Uuid);

impl TimeoutId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TimeoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct TimeoutObject {
    pub id: TimeoutId,
    pub deadline: Instant,
    pub on_timeout: Box<dyn FnOnce() + Send + 'static>,
}

impl TimeoutObject {
    pub fn new(id: TimeoutId, deadline: Instant, on_timeout: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            deadline,
            on_timeout: Box::new(on_timeout),
        }
    }
}

/// Fires callbacks at absolute deadlines.
pub trait TimeoutAuthority: Send + Sync {
    /// Registers `object`. A second registration with the same id replaces the first.
    fn add_timeout(&self, object: TimeoutObject);

    /// Unregisters the timeout. Returns false if it already fired or was never added.
    fn remove_timeout(&self, id: TimeoutId) -> bool;
}

/// Timeout authority backed by one Tokio timer task per registered object.
pub struct TimeoutProcessor {
    pending: Arc<Mutex<HashMap<TimeoutId, AbortHandle>>>,
    runtime: Handle,
}

impl TimeoutProcessor {
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            runtime: Handle::current(),
        })
    }

    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl TimeoutAuthority for TimeoutProcessor {
    fn add_timeout(&self, object: TimeoutObject) {
        let TimeoutObject {
            id,
            deadline,
            on_timeout,
        } = object;
        let pending: Weak<Mutex<HashMap<TimeoutId, AbortHandle>>> = Arc::downgrade(&self.pending);

        // Hold the map lock across spawn so the timer cannot fire before its
        // abort handle is recorded.
        let mut map = lock(&self.pending);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fired = match pending.upgrade() {
                Some(pending) => lock(&pending).remove(&id).is_some(),
                None => false,
            };
            if fired {
                on_timeout();
            }
        });
        if let Some(previous) = map.insert(id, task.abort_handle()) {
            previous.abort();
        }
    }

    fn remove_timeout(&self, id: TimeoutId) -> bool {
        match lock(&self.pending).remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
