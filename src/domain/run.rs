//! Loop run record and related types
//!
//! A LoopRun is the persisted, resumable record of one project's ticket
//! queue being driven through primary execution and the cleanup pipeline.
//! Its snapshot is rewritten at every phase boundary, so reloading it after
//! a crash lands on a well-defined resume point.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::id::{generate_run_id, now_ms};

use super::ticket::Ticket;

/// One step of the post-processing pipeline run after a ticket's primary
/// execution succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CleanupStep {
    name: String,
}

impl CleanupStep {
    /// Create a cleanup step from its kebab-case name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The step's kebab-case name, used in idempotency keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The phase label recorded on failure, e.g.
    /// `cleanup.verifyCleanWorktree` for `verify-clean-worktree`.
    pub fn phase_label(&self) -> String {
        let mut label = String::from("cleanup.");
        let mut upper_next = false;
        for ch in self.name.chars() {
            if ch == '-' {
                upper_next = true;
            } else if upper_next {
                label.extend(ch.to_uppercase());
                upper_next = false;
            } else {
                label.push(ch);
            }
        }
        label
    }

    /// The default six-step pipeline, in order.
    pub fn default_pipeline() -> Vec<CleanupStep> {
        [
            "commit-implementation",
            "request-refactor",
            "apply-refactor",
            "commit-refactor",
            "verify-clean-worktree",
            "run-unit-tests",
        ]
        .into_iter()
        .map(CleanupStep::new)
        .collect()
    }
}

/// Where within one ticket's processing the run currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TicketPhase {
    /// Submitting the primary task
    SendingPrimary,
    /// Primary task accepted, awaiting its terminal event
    AwaitingPrimaryResult,
    /// Executing cleanup step `step_index` of `total_steps`
    RunningCleanup {
        step: String,
        step_index: usize,
        total_steps: usize,
    },
    /// All steps done, recording completion
    Finalizing,
}

/// Queue-level progress, embedded in the non-terminal states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Queue length
    pub total: usize,
    /// Index of the ticket currently being processed
    pub index: usize,
    /// Id of that ticket, if the queue is not exhausted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_ticket_id: Option<String>,
    /// Phase within the current ticket, once known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<TicketPhase>,
}

/// Recorded context for a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub ticket_id: String,
    /// `"primary"` or `cleanup.<step>` label
    pub phase: String,
    pub message: String,
}

/// Summary attached to a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub cancelled: bool,
}

/// Loop state machine, exactly one per project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LoopState {
    /// No run in progress
    Idle,
    /// Queue accepted, first snapshot being written
    PreparingQueue,
    /// Actively processing tickets
    Running { progress: Progress },
    /// Paused at a step boundary, resumable
    Paused { reason: String, progress: Progress },
    /// Stopped on a step failure; explicit resume required
    Failed {
        context: FailureContext,
        progress: Progress,
    },
    /// Terminal: all tickets done, or cancellation finalized
    Completed { summary: RunSummary },
    /// Cancel requested, waiting for the in-flight step to return
    Cancelling { progress: Progress },
}

impl LoopState {
    /// Returns true for the single terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Completed { .. })
    }

    /// Returns true if `resume` may continue this run.
    pub fn is_resumable(&self) -> bool {
        matches!(self, LoopState::Paused { .. } | LoopState::Failed { .. })
    }

    /// The embedded progress, for states that carry one.
    pub fn progress(&self) -> Option<&Progress> {
        match self {
            LoopState::Running { progress }
            | LoopState::Paused { progress, .. }
            | LoopState::Failed { progress, .. }
            | LoopState::Cancelling { progress } => Some(progress),
            LoopState::Idle | LoopState::PreparingQueue | LoopState::Completed { .. } => None,
        }
    }
}

/// The persisted record of one project's loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopRun {
    /// Unique run identifier, part of every idempotency key
    pub run_id: String,
    /// Project this run belongs to; snapshot file key
    pub project_id: String,
    /// Worktree the worker operates in
    pub working_directory: PathBuf,
    /// Ordered ticket queue, fixed at start
    pub queue: Vec<Ticket>,
    /// Ids of tickets fully processed, in completion order
    pub completed_ticket_ids: Vec<String>,
    /// Index of the next unprocessed queue item
    pub next_index: usize,
    /// Ticket active at failure, set iff state is failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_ticket_id: Option<String>,
    pub state: LoopState,
    pub updated_at: u64,
}

impl LoopRun {
    /// Create a fresh run in `preparingQueue` state.
    pub fn new(project_id: impl Into<String>, working_directory: PathBuf, queue: Vec<Ticket>) -> Self {
        Self {
            run_id: generate_run_id(),
            project_id: project_id.into(),
            working_directory,
            queue,
            completed_ticket_ids: Vec::new(),
            next_index: 0,
            failed_ticket_id: None,
            state: LoopState::PreparingQueue,
            updated_at: now_ms(),
        }
    }

    /// The ticket at `next_index`, if the queue is not exhausted.
    pub fn current_ticket(&self) -> Option<&Ticket> {
        self.queue.get(self.next_index)
    }

    /// Build a progress record for the current queue position.
    pub fn progress(&self, phase: Option<TicketPhase>) -> Progress {
        Progress {
            total: self.queue.len(),
            index: self.next_index,
            current_ticket_id: self.current_ticket().map(|t| t.id.clone()),
            phase,
        }
    }

    /// Update the timestamp.
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}
