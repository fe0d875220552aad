//! Sequential loop engine.
//!
//! One engine task per project drives the ticket queue: primary step, then
//! the cleanup pipeline, strictly in order. The snapshot is rewritten at
//! every phase transition so a crash at any boundary reloads into a
//! well-defined resume point. Pause is honored only between steps; cancel is
//! sampled mid-step but the engine never fabricates a cancelled result while
//! a remote call is still pending.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::{CleanupStep, FailureContext, LoopRun, LoopState, Progress, RunSummary, Ticket, TicketPhase};
use crate::error::{ForemanError, Result};
use crate::id::{PRIMARY_STEP, idempotency_key};
use crate::orchestrator::snapshot::SnapshotStore;
use crate::protocol::{SubmitKind, TaskMode};
use crate::session::{ControlSession, PendingStep, StepResult, StepSubmission};

/// The engine's seam to the control plane. Implemented by
/// [`ControlSession`]; tests script it.
#[async_trait]
pub trait WorkerChannel: Send + Sync + 'static {
    /// Submit one step, returning a handle on its terminal event.
    async fn submit(&self, submission: StepSubmission) -> Result<PendingStep>;
    /// Forward a cooperative cancel for an in-flight step.
    async fn cancel(&self, request_id: &str) -> Result<()>;
}

#[async_trait]
impl WorkerChannel for ControlSession {
    async fn submit(&self, submission: StepSubmission) -> Result<PendingStep> {
        self.submit_step(submission).await
    }

    async fn cancel(&self, request_id: &str) -> Result<()> {
        self.cancel_task(request_id).await
    }
}

/// Commands accepted by a running engine.
#[derive(Debug)]
pub enum LoopCommand {
    /// Stop at the next step boundary, resumable.
    Pause { reason: String },
    /// Continue a paused loop (or clear a not-yet-honored pause).
    Resume,
    /// Cooperatively cancel the run.
    Cancel,
}

/// Handle on a spawned engine task.
pub struct LoopHandle {
    commands: mpsc::Sender<LoopCommand>,
    state: watch::Receiver<LoopState>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    /// Request a pause at the next step boundary.
    pub async fn pause(&self, reason: impl Into<String>) -> Result<()> {
        self.send(LoopCommand::Pause { reason: reason.into() }).await
    }

    /// Resume a paused loop.
    pub async fn resume(&self) -> Result<()> {
        self.send(LoopCommand::Resume).await
    }

    /// Cooperatively cancel the loop.
    pub async fn cancel(&self) -> Result<()> {
        self.send(LoopCommand::Cancel).await
    }

    async fn send(&self, command: LoopCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ForemanError::InvalidState("loop is no longer running".into()))
    }

    /// Current state.
    pub fn state(&self) -> LoopState {
        self.state.borrow().clone()
    }

    /// A watcher over state transitions.
    pub fn state_changes(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// True once the engine task has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the engine task to return and yield the final state.
    pub async fn join(self) -> LoopState {
        let _ = self.task.await;
        self.state.borrow().clone()
    }
}

/// Spawn an engine task driving `run`.
pub fn spawn<C: WorkerChannel>(
    channel: Arc<C>,
    store: SnapshotStore,
    pipeline: Vec<CleanupStep>,
    run: LoopRun,
) -> LoopHandle {
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(run.state.clone());
    let engine = LoopEngine {
        channel,
        store,
        pipeline,
        commands: commands_rx,
        state_tx,
        run,
        pause_requested: None,
        cancel_requested: false,
    };
    let task = tokio::spawn(engine.run());
    LoopHandle {
        commands: commands_tx,
        state: state_rx,
        task,
    }
}

enum ResumePoint {
    Primary,
    Cleanup(usize),
    Finalize,
}

enum Boundary {
    Continue,
    Cancelled,
    /// Every handle is gone; park with the persisted state as-is.
    Abandoned,
}

enum StepVerdict {
    Success,
    Failure(String),
    Cancelled,
}

enum TicketOutcome {
    Completed,
    Failed(FailureContext),
    Cancelled,
    Abandoned,
}

struct LoopEngine<C: WorkerChannel> {
    channel: Arc<C>,
    store: SnapshotStore,
    pipeline: Vec<CleanupStep>,
    commands: mpsc::Receiver<LoopCommand>,
    state_tx: watch::Sender<LoopState>,
    run: LoopRun,
    pause_requested: Option<String>,
    cancel_requested: bool,
}

impl<C: WorkerChannel> LoopEngine<C> {
    async fn run(mut self) {
        if let Err(e) = self.drive().await {
            warn!("loop {} for project {} stopped: {}", self.run.run_id, self.run.project_id, e);
        }
    }

    async fn drive(&mut self) -> Result<()> {
        info!(
            "loop {} driving project {} from ticket {}/{}",
            self.run.run_id,
            self.run.project_id,
            self.run.next_index + 1,
            self.run.queue.len()
        );

        // A reloaded snapshot resumes inside the current ticket
        let mut resume = resume_point(&self.run.state);
        self.run.failed_ticket_id = None;

        while self.run.next_index < self.run.queue.len() {
            match self.boundary_control().await? {
                Boundary::Continue => {}
                Boundary::Cancelled => return self.finalize_cancelled(),
                Boundary::Abandoned => return Ok(()),
            }

            let ticket = match self.run.current_ticket() {
                Some(ticket) => ticket.clone(),
                None => break,
            };
            let start = resume.take().unwrap_or(ResumePoint::Primary);
            info!(
                "ticket {} started ({}/{})",
                ticket.id,
                self.run.next_index + 1,
                self.run.queue.len()
            );

            match self.process_ticket(&ticket, start).await? {
                TicketOutcome::Completed => {
                    self.run.completed_ticket_ids.push(ticket.id.clone());
                    self.run.next_index += 1;
                    let progress = self.run.progress(None);
                    self.set_state(LoopState::Running { progress });
                    self.persist()?;
                    info!("ticket {} completed", ticket.id);
                }
                TicketOutcome::Failed(context) => {
                    warn!(
                        "ticket {} failed in {}: {}",
                        context.ticket_id, context.phase, context.message
                    );
                    let progress = self.current_progress();
                    self.run.failed_ticket_id = Some(ticket.id.clone());
                    self.set_state(LoopState::Failed { context, progress });
                    self.persist()?;
                    return Ok(());
                }
                TicketOutcome::Cancelled => return self.finalize_cancelled(),
                TicketOutcome::Abandoned => return Ok(()),
            }
        }

        let summary = RunSummary {
            total: self.run.queue.len(),
            completed: self.run.completed_ticket_ids.len(),
            cancelled: false,
        };
        self.set_state(LoopState::Completed { summary });
        self.store.remove(&self.run.project_id)?;
        info!("loop {} completed", self.run.run_id);
        Ok(())
    }

    async fn process_ticket(&mut self, ticket: &Ticket, start: ResumePoint) -> Result<TicketOutcome> {
        let total_steps = self.pipeline.len();

        let cleanup_from = match start {
            ResumePoint::Primary => {
                self.persist_phase(TicketPhase::SendingPrimary)?;
                let submission = StepSubmission {
                    request_id: idempotency_key(&self.run.run_id, &ticket.id, PRIMARY_STEP),
                    kind: SubmitKind::Primary,
                    mode: TaskMode::Implement,
                    prompt: ticket.prompt(),
                    logical_thread_id: Some(ticket.id.clone()),
                    project_id: Some(self.run.project_id.clone()),
                };
                match self
                    .run_step(submission, Some(TicketPhase::AwaitingPrimaryResult))
                    .await?
                {
                    StepVerdict::Success => 0,
                    StepVerdict::Failure(message) => {
                        return Ok(TicketOutcome::Failed(FailureContext {
                            ticket_id: ticket.id.clone(),
                            phase: "primary".into(),
                            message,
                        }));
                    }
                    StepVerdict::Cancelled => return Ok(TicketOutcome::Cancelled),
                }
            }
            ResumePoint::Cleanup(index) => index.min(total_steps),
            ResumePoint::Finalize => total_steps,
        };

        for index in cleanup_from..total_steps {
            // Pause and cancel are sampled here, never mid-step
            match self.boundary_control().await? {
                Boundary::Continue => {}
                Boundary::Cancelled => return Ok(TicketOutcome::Cancelled),
                Boundary::Abandoned => return Ok(TicketOutcome::Abandoned),
            }

            let step = self.pipeline[index].clone();
            self.persist_phase(TicketPhase::RunningCleanup {
                step: step.name().to_string(),
                step_index: index,
                total_steps,
            })?;

            let submission = StepSubmission {
                request_id: idempotency_key(&self.run.run_id, &ticket.id, step.name()),
                kind: SubmitKind::Cleanup,
                mode: TaskMode::Implement,
                prompt: format!("Run cleanup step {} for ticket {}", step.name(), ticket.id),
                logical_thread_id: Some(ticket.id.clone()),
                project_id: Some(self.run.project_id.clone()),
            };
            match self.run_step(submission, None).await? {
                StepVerdict::Success => {}
                StepVerdict::Failure(message) => {
                    return Ok(TicketOutcome::Failed(FailureContext {
                        ticket_id: ticket.id.clone(),
                        phase: step.phase_label(),
                        message,
                    }));
                }
                StepVerdict::Cancelled => return Ok(TicketOutcome::Cancelled),
            }
        }

        self.persist_phase(TicketPhase::Finalizing)?;
        Ok(TicketOutcome::Completed)
    }

    /// Submit one step and await its terminal event, servicing commands
    /// while the remote call is pending.
    async fn run_step(
        &mut self,
        submission: StepSubmission,
        accepted_phase: Option<TicketPhase>,
    ) -> Result<StepVerdict> {
        let request_id = submission.request_id.clone();
        debug!("submitting step {}", request_id);

        let pending = match self.channel.submit(submission).await {
            Ok(pending) => pending,
            // Remote, transport, and protocol failures stop the loop the
            // same way; only the recorded message differs
            Err(e) => return Ok(StepVerdict::Failure(e.to_string())),
        };
        if pending.reattached {
            info!("step {} was already in flight; awaiting its result", request_id);
        }
        if let Some(phase) = accepted_phase {
            self.persist_phase(phase)?;
        }

        let mut wait = Box::pin(pending.wait());
        let mut commands_open = true;
        loop {
            tokio::select! {
                result = &mut wait => {
                    let verdict = match result {
                        _ if self.cancel_requested => StepVerdict::Cancelled,
                        Ok(StepResult::Success { .. }) => StepVerdict::Success,
                        Ok(StepResult::Failure { message }) => StepVerdict::Failure(message),
                        Err(e) => StepVerdict::Failure(e.to_string()),
                    };
                    return Ok(verdict);
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(LoopCommand::Cancel) => {
                        if !self.cancel_requested {
                            self.cancel_requested = true;
                            let progress = self.current_progress();
                            self.set_state(LoopState::Cancelling { progress });
                            self.persist()?;
                            // Forward the cancel; finalization waits for the
                            // in-flight step to actually return
                            if let Err(e) = self.channel.cancel(&request_id).await {
                                warn!("cancel request for {} failed: {}", request_id, e);
                            }
                        }
                    }
                    Some(LoopCommand::Pause { reason }) => {
                        // Honored at the next step boundary
                        self.pause_requested = Some(reason);
                    }
                    Some(LoopCommand::Resume) => {
                        self.pause_requested = None;
                    }
                    None => commands_open = false,
                }
            }
        }
    }

    /// Sample pause/cancel at a step boundary; blocks while paused.
    async fn boundary_control(&mut self) -> Result<Boundary> {
        loop {
            match self.commands.try_recv() {
                Ok(LoopCommand::Cancel) => self.cancel_requested = true,
                Ok(LoopCommand::Pause { reason }) => self.pause_requested = Some(reason),
                Ok(LoopCommand::Resume) => self.pause_requested = None,
                Err(mpsc::error::TryRecvError::Empty) | Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        if self.cancel_requested {
            let progress = self.current_progress();
            self.set_state(LoopState::Cancelling { progress });
            self.persist()?;
            return Ok(Boundary::Cancelled);
        }

        if let Some(reason) = self.pause_requested.take() {
            let progress = self.current_progress();
            info!("loop {} paused: {}", self.run.run_id, reason);
            self.set_state(LoopState::Paused {
                reason,
                progress: progress.clone(),
            });
            self.persist()?;

            loop {
                match self.commands.recv().await {
                    Some(LoopCommand::Resume) => {
                        info!("loop {} resumed", self.run.run_id);
                        self.set_state(LoopState::Running { progress });
                        self.persist()?;
                        return Ok(Boundary::Continue);
                    }
                    Some(LoopCommand::Cancel) => {
                        self.cancel_requested = true;
                        let progress = self.current_progress();
                        self.set_state(LoopState::Cancelling { progress });
                        self.persist()?;
                        return Ok(Boundary::Cancelled);
                    }
                    Some(LoopCommand::Pause { .. }) => {}
                    None => return Ok(Boundary::Abandoned),
                }
            }
        }

        Ok(Boundary::Continue)
    }

    fn finalize_cancelled(&mut self) -> Result<()> {
        let summary = RunSummary {
            total: self.run.queue.len(),
            completed: self.run.completed_ticket_ids.len(),
            cancelled: true,
        };
        self.set_state(LoopState::Completed { summary });
        self.store.remove(&self.run.project_id)?;
        info!("loop {} cancelled", self.run.run_id);
        Ok(())
    }

    fn current_progress(&self) -> Progress {
        self.run
            .state
            .progress()
            .cloned()
            .unwrap_or_else(|| self.run.progress(None))
    }

    fn set_state(&mut self, state: LoopState) {
        self.run.state = state.clone();
        self.run.touch();
        let _ = self.state_tx.send(state);
    }

    fn persist(&self) -> Result<()> {
        self.store.save(&self.run)
    }

    fn persist_phase(&mut self, phase: TicketPhase) -> Result<()> {
        let progress = self.run.progress(Some(phase));
        self.set_state(LoopState::Running { progress });
        self.persist()
    }
}

fn resume_point(state: &LoopState) -> Option<ResumePoint> {
    let phase = state.progress()?.phase.clone()?;
    Some(match phase {
        TicketPhase::SendingPrimary | TicketPhase::AwaitingPrimaryResult => ResumePoint::Primary,
        TicketPhase::RunningCleanup { step_index, .. } => ResumePoint::Cleanup(step_index),
        TicketPhase::Finalizing => ResumePoint::Finalize,
    })
}
