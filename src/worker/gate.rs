//! Admission gate.
//!
//! Enforces the worker-wide concurrency policy: any number of plan
//! operations, at most one implement operation, and never two operations on
//! the same resolved thread. All bookkeeping is in-process; release happens
//! exactly once through a permit guard dropped on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::id::generate_thread_id;
use crate::protocol::{AdmissionError, TaskMode, ThreadStatus};

/// One active operation.
#[derive(Debug, Clone)]
struct ActiveOp {
    request_id: String,
    mode: TaskMode,
    thread_id: String,
    logical_thread_id: Option<String>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct GateState {
    /// request id → operation
    active: HashMap<String, ActiveOp>,
    /// resolved thread id → request id holding it
    busy_threads: HashMap<String, String>,
    /// logical thread id → resolved provider thread id
    aliases: HashMap<String, String>,
    /// request id holding the single implement slot
    implement_active: Option<String>,
}

/// Worker-wide admission control.
#[derive(Clone, Default)]
pub struct AdmissionGate {
    state: Arc<Mutex<GateState>>,
}

impl AdmissionGate {
    /// Create an empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a submission, applying the checks in order; the first
    /// violation wins.
    pub fn admit(
        &self,
        request_id: &str,
        mode: TaskMode,
        logical_thread_id: Option<&str>,
    ) -> Result<AdmissionPermit, AdmissionError> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        // 1. duplicate request id
        if state.active.contains_key(request_id) {
            return Err(AdmissionError::AlreadyActive(request_id.to_string()));
        }

        // 2. single implement slot, worker-wide
        if mode == TaskMode::Implement && state.implement_active.is_some() {
            return Err(AdmissionError::ImplementationInFlight);
        }

        // 3. thread reservation, on the resolved alias. A known alias
        // resumes the existing thread context; otherwise a fresh provider
        // thread is started.
        let (thread_id, resumed) = match logical_thread_id {
            Some(logical) => match state.aliases.get(logical) {
                Some(provider) => (provider.clone(), true),
                None => (generate_thread_id(), false),
            },
            None => (generate_thread_id(), false),
        };
        if let Some(holder) = state.busy_threads.get(&thread_id) {
            debug!("thread {} busy with request {}", thread_id, holder);
            return Err(AdmissionError::ThreadBusy(thread_id));
        }

        if let Some(logical) = logical_thread_id {
            state.aliases.insert(logical.to_string(), thread_id.clone());
        }
        state.busy_threads.insert(thread_id.clone(), request_id.to_string());
        if mode == TaskMode::Implement {
            state.implement_active = Some(request_id.to_string());
        }

        let cancel = CancellationToken::new();
        state.active.insert(
            request_id.to_string(),
            ActiveOp {
                request_id: request_id.to_string(),
                mode,
                thread_id: thread_id.clone(),
                logical_thread_id: logical_thread_id.map(str::to_string),
                cancel: cancel.clone(),
            },
        );

        debug!(
            "admitted {:?} request {} on thread {} (resumed: {})",
            mode, request_id, thread_id, resumed
        );

        Ok(AdmissionPermit {
            state: Arc::clone(&self.state),
            request_id: request_id.to_string(),
            thread_id,
            resumed,
            cancel,
        })
    }

    /// Signal cooperative cancellation of one operation. Unknown or
    /// already-finished request ids are a silent no-op.
    pub fn cancel(&self, request_id: &str) -> bool {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.active.get(request_id) {
            Some(op) => {
                op.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal cancellation of every active operation.
    pub fn cancel_all(&self) {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        for op in state.active.values() {
            op.cancel.cancel();
        }
    }

    /// Report active operations, optionally scoped to one thread (matched
    /// by logical or resolved id).
    pub fn status(&self, thread_id: Option<&str>) -> Vec<ThreadStatus> {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .active
            .values()
            .filter(|op| match thread_id {
                Some(wanted) => {
                    op.thread_id == wanted || op.logical_thread_id.as_deref() == Some(wanted)
                }
                None => true,
            })
            .map(|op| ThreadStatus {
                thread_id: op.thread_id.clone(),
                logical_thread_id: op.logical_thread_id.clone(),
                request_id: op.request_id.clone(),
                mode: op.mode,
            })
            .collect()
    }

    /// Number of active operations.
    pub fn active_count(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.active.len(),
            Err(poisoned) => poisoned.into_inner().active.len(),
        }
    }
}

/// Reservation held while one admitted operation runs.
///
/// Dropping the permit removes all bookkeeping for the request id (the
/// active entry, the thread reservation, and the implement slot) exactly
/// once, whatever path execution exits through.
#[derive(Debug)]
pub struct AdmissionPermit {
    state: Arc<Mutex<GateState>>,
    request_id: String,
    thread_id: String,
    resumed: bool,
    cancel: CancellationToken,
}

impl AdmissionPermit {
    /// Request id this permit belongs to.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Resolved provider thread id.
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// True if the operation resumed an existing thread context.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Token signalled when cancellation is requested.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.active.remove(&self.request_id).is_none() {
            warn!("permit for {} released twice", self.request_id);
            return;
        }
        state.busy_threads.remove(&self.thread_id);
        if state.implement_active.as_deref() == Some(self.request_id.as_str()) {
            state.implement_active = None;
        }
        debug!("released request {} from thread {}", self.request_id, self.thread_id);
        // The alias survives: the thread context can be resumed later
    }
}
