//! Worker-control socket server.
//!
//! The long-lived worker process side: accepts control connections, performs
//! the hello handshake, routes requests through the admission gate, runs
//! accepted tasks on a pluggable executor, and broadcasts events to
//! subscribed clients. Publishes its session record on startup and removes
//! it on shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{ForemanError, Result};
use crate::protocol::{
    ClientBound, EventEnvelope, LineCodec, PROTOCOL_VERSION, RequestBody, RequestEnvelope, ResponseBody,
    ResponseEnvelope, SubmitKind, TaskMode,
};
use crate::session::SessionRecord;
use crate::worker::gate::{AdmissionGate, AdmissionPermit};

/// One accepted task, as handed to the executor.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub request_id: String,
    pub kind: SubmitKind,
    pub mode: TaskMode,
    pub prompt: String,
    /// Resolved provider thread id.
    pub thread_id: String,
    pub logical_thread_id: Option<String>,
    pub project_id: Option<String>,
    /// True when the assignment resumed an existing thread context.
    pub resumed_thread: bool,
}

/// Terminal result of an executed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub success: bool,
    pub summary: Option<String>,
}

impl TaskOutcome {
    /// A successful outcome with an optional summary.
    pub fn success(summary: Option<String>) -> Self {
        Self {
            success: true,
            summary,
        }
    }

    /// A completed-but-unsuccessful outcome.
    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: Some(summary.into()),
        }
    }
}

/// The execution engine behind the gate. The real engine drives an AI
/// coding session; tests script it.
///
/// Implementations stream progress through `output`, honor `cancel` at their
/// own yield points, and return the terminal outcome. Returning an error
/// produces a `ticket.error` event; a cancelled execution conventionally
/// returns an error mentioning cancellation.
pub trait TaskExecutor: Send + Sync {
    fn execute(
        &self,
        task: TaskAssignment,
        output: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<TaskOutcome>> + Send;
}

/// Configuration for the worker server.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Control socket path.
    pub socket_path: PathBuf,
    /// Where the session record is published.
    pub record_path: PathBuf,
    /// Identity token expected in hello handshakes.
    pub instance_token: String,
    /// Protocol version spoken.
    pub protocol_version: u32,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::paths::default_socket_path(),
            record_path: crate::paths::default_record_path(),
            instance_token: format!("tok-{:08x}", rand::rng().random::<u32>()),
            protocol_version: PROTOCOL_VERSION,
            event_capacity: 256,
        }
    }
}

impl WorkerConfig {
    /// Config rooted in one directory (socket and record side by side).
    pub fn rooted_at(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            socket_path: dir.join("control.sock"),
            record_path: dir.join("worker.json"),
            ..Default::default()
        }
    }
}

/// Outcome kept for completed idempotency keys, replayed on resubmission.
#[derive(Debug, Clone)]
struct CompletedEntry {
    outcome: TaskOutcome,
    thread_id: String,
}

/// Shared server state handed to per-client tasks.
struct ClientCtx<E: TaskExecutor> {
    instance_token: String,
    protocol_version: u32,
    gate: AdmissionGate,
    executor: Arc<E>,
    events: broadcast::Sender<EventEnvelope>,
    completed: Mutex<HashMap<String, CompletedEntry>>,
    shutdown: CancellationToken,
}

impl<E: TaskExecutor> ClientCtx<E> {
    fn broadcast(&self, event: EventEnvelope) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

/// What to do after a response has been written.
enum Post {
    Nothing,
    Stop,
}

/// The worker-control socket server.
pub struct WorkerServer<E: TaskExecutor> {
    config: WorkerConfig,
    ctx: Arc<ClientCtx<E>>,
}

impl<E: TaskExecutor + 'static> WorkerServer<E> {
    /// Create a server around an executor.
    pub fn new(config: WorkerConfig, executor: Arc<E>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let ctx = Arc::new(ClientCtx {
            instance_token: config.instance_token.clone(),
            protocol_version: config.protocol_version,
            gate: AdmissionGate::new(),
            executor,
            events,
            completed: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        Self { config, ctx }
    }

    /// The configured control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// The admission gate, exposed for inspection.
    pub fn gate(&self) -> &AdmissionGate {
        &self.ctx.gate
    }

    /// Subscribe an in-process listener to the event stream.
    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.ctx.events.subscribe()
    }

    /// Signal the server to stop: cancels active operations and ends the
    /// accept loop.
    pub fn stop(&self) {
        initiate_shutdown(&self.ctx);
    }

    /// Run the accept loop until stopped.
    pub async fn run(&self) -> Result<()> {
        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }
        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .map_err(|e| ForemanError::Unavailable(format!("failed to bind socket: {}", e)))?;

        let process_id = std::process::id();
        let record = SessionRecord::new(
            process_id,
            self.config.protocol_version,
            self.config.socket_path.clone(),
            self.config.instance_token.clone(),
        );
        record.store(&self.config.record_path)?;

        self.ctx.broadcast(EventEnvelope::WorkerStarted {
            process_id,
            protocol_version: self.config.protocol_version,
        });
        info!(
            "worker listening on {} (pid {})",
            self.config.socket_path.display(),
            process_id
        );

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let ctx = Arc::clone(&self.ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(ctx, stream).await {
                                debug!("client connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("accept error: {}", e),
                }
            }
        }

        self.ctx.gate.cancel_all();
        SessionRecord::remove(&self.config.record_path)?;
        let _ = std::fs::remove_file(&self.config.socket_path);
        info!("worker stopped");
        Ok(())
    }
}

fn initiate_shutdown<E: TaskExecutor>(ctx: &Arc<ClientCtx<E>>) {
    if !ctx.shutdown.is_cancelled() {
        ctx.broadcast(EventEnvelope::WorkerExited);
        ctx.shutdown.cancel();
    }
}

/// Handle one client connection: request routing plus event forwarding.
async fn handle_client<E: TaskExecutor + 'static>(ctx: Arc<ClientCtx<E>>, stream: UnixStream) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LineCodec::<RequestEnvelope>::new());
    let mut writer = FramedWrite::new(write_half, LineCodec::<ClientBound>::new());
    let mut events_rx = ctx.events.subscribe();
    let mut subscribed = false;

    loop {
        tokio::select! {
            // Events first so a final worker.exited reaches subscribers
            // before the shutdown branch ends the loop
            biased;

            event = events_rx.recv() => match event {
                Ok(event) => {
                    if subscribed && writer.send(ClientBound::Event(event)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("client event stream lagged by {}", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            frame = reader.next() => match frame {
                Some(Ok(request)) => {
                    let (response, post) = handle_request(&ctx, request, &mut subscribed);
                    if writer.send(ClientBound::Response(response)).await.is_err() {
                        break;
                    }
                    if let Post::Stop = post {
                        initiate_shutdown(&ctx);
                    }
                }
                Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    // Malformed frame: scoped to that line, connection stays usable
                    let response = ResponseEnvelope::error(0, format!("parse error: {}", e));
                    if writer.send(ClientBound::Response(response)).await.is_err() {
                        break;
                    }
                }
                Some(Err(_)) | None => break,
            },

            _ = ctx.shutdown.cancelled() => break,
        }
    }

    Ok(())
}

fn handle_request<E: TaskExecutor + 'static>(
    ctx: &Arc<ClientCtx<E>>,
    request: RequestEnvelope,
    subscribed: &mut bool,
) -> (ResponseEnvelope, Post) {
    let id = request.id;
    match request.body {
        RequestBody::Hello {
            min_protocol_version,
            instance_token,
        } => (handle_hello(ctx, id, min_protocol_version, instance_token), Post::Nothing),
        RequestBody::SubmitTask {
            request_id,
            kind,
            mode,
            prompt,
            thread_id,
            project_id,
        } => (
            handle_submit(ctx, id, request_id, kind, mode, prompt, thread_id, project_id),
            Post::Nothing,
        ),
        RequestBody::Subscribe => {
            *subscribed = true;
            (ResponseEnvelope::new(id, ResponseBody::SubscribeOk), Post::Nothing)
        }
        RequestBody::WorkerStatus { thread_id } => {
            let threads = ctx.gate.status(thread_id.as_deref());
            (
                ResponseEnvelope::new(id, ResponseBody::WorkerStatusOk { threads }),
                Post::Nothing,
            )
        }
        RequestBody::CancelTask { request_id } => {
            // Unknown or finished ids are a silent no-op
            let known = ctx.gate.cancel(&request_id);
            debug!("cancelTask {} (known: {})", request_id, known);
            (ResponseEnvelope::new(id, ResponseBody::CancelTaskOk), Post::Nothing)
        }
        RequestBody::StopWorker => (ResponseEnvelope::new(id, ResponseBody::StopWorkerOk), Post::Stop),
    }
}

fn handle_hello<E: TaskExecutor>(
    ctx: &Arc<ClientCtx<E>>,
    id: u64,
    min_protocol_version: u32,
    instance_token: Option<String>,
) -> ResponseEnvelope {
    if min_protocol_version > ctx.protocol_version {
        return ResponseEnvelope::error(
            id,
            format!(
                "unsupported protocol version: client requires {} but worker speaks {}",
                min_protocol_version, ctx.protocol_version
            ),
        );
    }
    if let Some(token) = instance_token
        && token != ctx.instance_token
    {
        return ResponseEnvelope::error(id, "identity token mismatch");
    }
    ResponseEnvelope::new(
        id,
        ResponseBody::HelloOk {
            process_id: std::process::id(),
            protocol_version: ctx.protocol_version,
        },
    )
}

#[allow(clippy::too_many_arguments)]
fn handle_submit<E: TaskExecutor + 'static>(
    ctx: &Arc<ClientCtx<E>>,
    id: u64,
    request_id: String,
    kind: SubmitKind,
    mode: TaskMode,
    prompt: String,
    thread_id: Option<String>,
    project_id: Option<String>,
) -> ResponseEnvelope {
    // A completed key replays its outcome instead of executing again
    let replay = {
        let completed = match ctx.completed.lock() {
            Ok(completed) => completed,
            Err(poisoned) => poisoned.into_inner(),
        };
        completed.get(&request_id).cloned()
    };
    if let Some(entry) = replay {
        info!("replaying completed step {}", request_id);
        ctx.broadcast(EventEnvelope::TicketStarted {
            request_id: request_id.clone(),
            thread_id: entry.thread_id.clone(),
            project_id,
        });
        ctx.broadcast(EventEnvelope::TicketCompleted {
            request_id: request_id.clone(),
            success: entry.outcome.success,
            summary: entry.outcome.summary.clone(),
        });
        return ResponseEnvelope::new(
            id,
            ResponseBody::SubmitTaskOk {
                request_id,
                thread_id: entry.thread_id,
            },
        );
    }

    match ctx.gate.admit(&request_id, mode, thread_id.as_deref()) {
        Err(admission) => ResponseEnvelope::error(id, admission.to_string()),
        Ok(permit) => {
            let resolved = permit.thread_id().to_string();
            let assignment = TaskAssignment {
                request_id: request_id.clone(),
                kind,
                mode,
                prompt,
                thread_id: resolved.clone(),
                logical_thread_id: thread_id,
                project_id,
                resumed_thread: permit.resumed(),
            };
            tokio::spawn(run_task(Arc::clone(ctx), permit, assignment));
            ResponseEnvelope::new(
                id,
                ResponseBody::SubmitTaskOk {
                    request_id,
                    thread_id: resolved,
                },
            )
        }
    }
}

/// Execute one admitted task: emit started, pipe output, always emit exactly
/// one terminal event, and release the permit on every path.
async fn run_task<E: TaskExecutor + 'static>(ctx: Arc<ClientCtx<E>>, permit: AdmissionPermit, assignment: TaskAssignment) {
    let request_id = assignment.request_id.clone();
    let thread_id = assignment.thread_id.clone();
    let cancel = permit.cancellation_token();

    ctx.broadcast(EventEnvelope::TicketStarted {
        request_id: request_id.clone(),
        thread_id: thread_id.clone(),
        project_id: assignment.project_id.clone(),
    });

    let (output_tx, mut output_rx) = mpsc::channel::<String>(64);
    let forwarder = {
        let ctx = Arc::clone(&ctx);
        let request_id = request_id.clone();
        let thread_id = thread_id.clone();
        tokio::spawn(async move {
            while let Some(text) = output_rx.recv().await {
                ctx.broadcast(EventEnvelope::TicketOutput {
                    request_id: request_id.clone(),
                    text,
                    thread_id: Some(thread_id.clone()),
                });
            }
        })
    };

    // Cooperative: the executor observes the token itself; nothing here
    // forcibly terminates its work
    let result = ctx.executor.execute(assignment, output_tx, cancel).await;

    // Flush remaining output before the terminal event
    let _ = forwarder.await;

    let terminal = match result {
        Ok(outcome) => {
            if outcome.success {
                let mut completed = match ctx.completed.lock() {
                    Ok(completed) => completed,
                    Err(poisoned) => poisoned.into_inner(),
                };
                completed.insert(
                    request_id.clone(),
                    CompletedEntry {
                        outcome: outcome.clone(),
                        thread_id: thread_id.clone(),
                    },
                );
            }
            EventEnvelope::TicketCompleted {
                request_id: request_id.clone(),
                success: outcome.success,
                summary: outcome.summary,
            }
        }
        Err(e) => EventEnvelope::TicketError {
            request_id: request_id.clone(),
            message: e.to_string(),
        },
    };
    // Release bookkeeping before announcing the terminal event so a
    // follow-up submission on the same thread is admitted immediately
    drop(permit);
    ctx.broadcast(terminal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Executor that succeeds immediately, echoing one output line.
    struct EchoExecutor;

    impl TaskExecutor for EchoExecutor {
        fn execute(
            &self,
            task: TaskAssignment,
            output: mpsc::Sender<String>,
            _cancel: CancellationToken,
        ) -> impl Future<Output = Result<TaskOutcome>> + Send {
            async move {
                let _ = output.send(format!("echo: {}", task.prompt)).await;
                Ok(TaskOutcome::success(Some(format!("ran {}", task.request_id))))
            }
        }
    }

    /// Executor that waits for cancellation.
    struct HangingExecutor;

    impl TaskExecutor for HangingExecutor {
        fn execute(
            &self,
            _task: TaskAssignment,
            _output: mpsc::Sender<String>,
            cancel: CancellationToken,
        ) -> impl Future<Output = Result<TaskOutcome>> + Send {
            async move {
                cancel.cancelled().await;
                Err(ForemanError::Remote("cancelled".into()))
            }
        }
    }

    fn test_server<E: TaskExecutor + 'static>(executor: E) -> (WorkerServer<E>, TempDir) {
        let temp = TempDir::new().unwrap();
        let config = WorkerConfig::rooted_at(temp.path());
        (WorkerServer::new(config, Arc::new(executor)), temp)
    }

    async fn drain_until_terminal(
        rx: &mut broadcast::Receiver<EventEnvelope>,
        request_id: &str,
    ) -> EventEnvelope {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for terminal event")
                .expect("event channel closed");
            if event.request_id() == Some(request_id) && event.is_terminal() {
                return event;
            }
        }
    }

    #[test]
    fn test_worker_config_rooted_at() {
        let config = WorkerConfig::rooted_at("/tmp/foreman-test");
        assert_eq!(config.socket_path, PathBuf::from("/tmp/foreman-test/control.sock"));
        assert_eq!(config.record_path, PathBuf::from("/tmp/foreman-test/worker.json"));
        assert!(config.instance_token.starts_with("tok-"));
    }

    #[test]
    fn test_task_outcome_constructors() {
        let ok = TaskOutcome::success(Some("all good".into()));
        assert!(ok.success);
        let bad = TaskOutcome::failure("tests failed");
        assert!(!bad.success);
        assert_eq!(bad.summary.as_deref(), Some("tests failed"));
    }

    #[tokio::test]
    async fn test_hello_accepts_matching_token() {
        let (server, _temp) = test_server(EchoExecutor);
        let token = server.config.instance_token.clone();
        let response = handle_hello(&server.ctx, 1, 1, Some(token));
        assert!(matches!(response.body, ResponseBody::HelloOk { .. }));
    }

    #[tokio::test]
    async fn test_hello_rejects_wrong_token() {
        let (server, _temp) = test_server(EchoExecutor);
        let response = handle_hello(&server.ctx, 1, 1, Some("wrong".into()));
        match response.body {
            ResponseBody::Error { message } => assert!(message.contains("identity token mismatch")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hello_rejects_newer_protocol_requirement() {
        let (server, _temp) = test_server(EchoExecutor);
        let response = handle_hello(&server.ctx, 1, PROTOCOL_VERSION + 1, None);
        match response.body {
            ResponseBody::Error { message } => {
                assert!(message.contains("unsupported protocol version"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_runs_and_completes() {
        let (server, _temp) = test_server(EchoExecutor);
        let mut events = server.events();

        let response = handle_submit(
            &server.ctx,
            1,
            "key-1".into(),
            SubmitKind::Primary,
            TaskMode::Implement,
            "do it".into(),
            Some("T-1".into()),
            Some("proj".into()),
        );
        let thread_id = match response.body {
            ResponseBody::SubmitTaskOk { ref thread_id, .. } => thread_id.clone(),
            ref other => panic!("expected submitTask.ok, got {:?}", other),
        };

        let terminal = drain_until_terminal(&mut events, "key-1").await;
        match terminal {
            EventEnvelope::TicketCompleted { success, summary, .. } => {
                assert!(success);
                assert_eq!(summary.as_deref(), Some("ran key-1"));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(thread_id.starts_with("wt-"));
        assert_eq!(server.gate().active_count(), 0);
    }

    #[tokio::test]
    async fn test_completed_key_replays_without_second_execution() {
        let (server, _temp) = test_server(EchoExecutor);
        let mut events = server.events();

        let first = handle_submit(
            &server.ctx,
            1,
            "key-1".into(),
            SubmitKind::Cleanup,
            TaskMode::Implement,
            "step".into(),
            Some("T-1".into()),
            None,
        );
        assert!(matches!(first.body, ResponseBody::SubmitTaskOk { .. }));
        drain_until_terminal(&mut events, "key-1").await;

        // Resubmission replays: accepted, terminal event, no new admission
        let mut events = server.events();
        let replayed = handle_submit(
            &server.ctx,
            2,
            "key-1".into(),
            SubmitKind::Cleanup,
            TaskMode::Implement,
            "step".into(),
            Some("T-1".into()),
            None,
        );
        assert!(matches!(replayed.body, ResponseBody::SubmitTaskOk { .. }));
        assert_eq!(server.gate().active_count(), 0);

        let terminal = drain_until_terminal(&mut events, "key-1").await;
        match terminal {
            EventEnvelope::TicketCompleted { success, summary, .. } => {
                assert!(success);
                assert_eq!(summary.as_deref(), Some("ran key-1"));
            }
            other => panic!("expected replayed completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_active_key_rejected_already_active() {
        let (server, _temp) = test_server(HangingExecutor);

        let first = handle_submit(
            &server.ctx,
            1,
            "key-1".into(),
            SubmitKind::Primary,
            TaskMode::Plan,
            "p".into(),
            Some("T-1".into()),
            None,
        );
        assert!(matches!(first.body, ResponseBody::SubmitTaskOk { .. }));

        let second = handle_submit(
            &server.ctx,
            2,
            "key-1".into(),
            SubmitKind::Primary,
            TaskMode::Plan,
            "p".into(),
            Some("T-1".into()),
            None,
        );
        match second.body {
            ResponseBody::Error { message } => assert!(message.starts_with("already_active")),
            other => panic!("expected rejection, got {:?}", other),
        }

        // Let the hanging task finish
        server.gate().cancel("key-1");
    }

    #[tokio::test]
    async fn test_cancel_produces_error_terminal() {
        let (server, _temp) = test_server(HangingExecutor);
        let mut events = server.events();

        handle_submit(
            &server.ctx,
            1,
            "key-1".into(),
            SubmitKind::Primary,
            TaskMode::Implement,
            "p".into(),
            Some("T-1".into()),
            None,
        );

        let (response, _) = handle_request(
            &server.ctx,
            RequestEnvelope::new(
                2,
                RequestBody::CancelTask {
                    request_id: "key-1".into(),
                },
            ),
            &mut false,
        );
        assert!(matches!(response.body, ResponseBody::CancelTaskOk));

        let terminal = drain_until_terminal(&mut events, "key-1").await;
        match terminal {
            EventEnvelope::TicketError { message, .. } => assert!(message.contains("cancelled")),
            other => panic!("expected error terminal, got {:?}", other),
        }
        // Failed/cancelled keys are not recorded for replay
        let completed = server.ctx.completed.lock().unwrap();
        assert!(!completed.contains_key("key-1"));
    }

    #[tokio::test]
    async fn test_worker_status_reports_in_flight() {
        let (server, _temp) = test_server(HangingExecutor);

        handle_submit(
            &server.ctx,
            1,
            "key-1".into(),
            SubmitKind::Primary,
            TaskMode::Implement,
            "p".into(),
            Some("T-1".into()),
            None,
        );

        let (response, _) = handle_request(
            &server.ctx,
            RequestEnvelope::new(
                2,
                RequestBody::WorkerStatus {
                    thread_id: Some("T-1".into()),
                },
            ),
            &mut false,
        );
        match response.body {
            ResponseBody::WorkerStatusOk { threads } => {
                assert_eq!(threads.len(), 1);
                assert_eq!(threads[0].request_id, "key-1");
                assert_eq!(threads[0].logical_thread_id.as_deref(), Some("T-1"));
            }
            other => panic!("expected status, got {:?}", other),
        }

        server.gate().cancel("key-1");
    }

    #[tokio::test]
    async fn test_stop_request_broadcasts_exit() {
        let (server, _temp) = test_server(EchoExecutor);
        let mut events = server.events();

        let (response, post) =
            handle_request(&server.ctx, RequestEnvelope::new(1, RequestBody::StopWorker), &mut false);
        assert!(matches!(response.body, ResponseBody::StopWorkerOk));
        assert!(matches!(post, Post::Stop));

        initiate_shutdown(&server.ctx);
        assert!(server.ctx.shutdown.is_cancelled());
        let event = events.recv().await.unwrap();
        assert_eq!(event, EventEnvelope::WorkerExited);
    }
}
