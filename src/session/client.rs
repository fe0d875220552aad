//! Control-plane session.
//!
//! Owns one connection to the worker-control process and multiplexes
//! request/response calls and the server-pushed event feed over it:
//! - outbound writes are serialized through one framed writer, whole-frame;
//! - a reader task correlates responses to pending calls and re-broadcasts
//!   events to local listeners;
//! - a supervisor task reconnects with exponential backoff after connection
//!   loss, re-running the handshake and re-subscribing the feed.
//!
//! Missed events are never synthesized; callers whose feed-derived state may
//! be stale reconcile with an explicit `worker_status` call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify, broadcast, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{ForemanError, Result};
use crate::protocol::{
    AdmissionError, ClientBound, EventEnvelope, LineCodec, PROTOCOL_VERSION, RequestBody, RequestEnvelope,
    ResponseBody, ResponseEnvelope, SubmitKind, TaskMode, ThreadStatus,
};
use crate::session::record::SessionRecord;

/// Configuration for the control-plane session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path to the worker's control socket.
    pub endpoint: PathBuf,
    /// Minimum protocol version this client accepts.
    pub min_protocol_version: u32,
    /// Identity token presented in the hello handshake.
    pub expected_token: Option<String>,
    /// Bounded wait for one correlated response.
    pub call_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
    /// Bounded retries when a submit conflicts with an in-flight operation
    /// that turns out not to be ours.
    pub reattach_attempts: u32,
    /// Delay between those retries.
    pub reattach_delay: Duration,
    /// Capacity of the local event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: crate::paths::default_socket_path(),
            min_protocol_version: PROTOCOL_VERSION,
            expected_token: None,
            call_timeout: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(10),
            reattach_attempts: 3,
            reattach_delay: Duration::from_millis(250),
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Create config with a custom socket path.
    pub fn with_endpoint(path: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: path.into(),
            ..Default::default()
        }
    }

    /// Create config from a loaded session record: endpoint and expected
    /// identity token come from the record.
    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            endpoint: record.control_endpoint.clone(),
            expected_token: Some(record.instance_token.clone()),
            ..Default::default()
        }
    }
}

/// A submitted step to round-trip through the worker.
#[derive(Debug, Clone)]
pub struct StepSubmission {
    /// Deterministic idempotency key, used as the wire request id.
    pub request_id: String,
    pub kind: SubmitKind,
    pub mode: TaskMode,
    pub prompt: String,
    /// Caller-chosen logical thread id (the ticket id).
    pub logical_thread_id: Option<String>,
    pub project_id: Option<String>,
}

/// Terminal outcome of one submitted step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Success { summary: Option<String> },
    Failure { message: String },
}

/// An accepted submission, waiting for its terminal event.
#[derive(Debug)]
pub struct PendingStep {
    /// Request id the terminal event will carry.
    pub request_id: String,
    /// Resolved provider thread id.
    pub thread_id: String,
    /// True when the submission attached to an operation already in flight
    /// instead of starting a new one.
    pub reattached: bool,
    events: broadcast::Receiver<EventEnvelope>,
}

impl PendingStep {
    /// Assemble a pending step around an event listener. Used by the
    /// session itself and by scripted channels in tests.
    pub(crate) fn attach(
        request_id: String,
        thread_id: String,
        reattached: bool,
        events: broadcast::Receiver<EventEnvelope>,
    ) -> Self {
        Self {
            request_id,
            thread_id,
            reattached,
            events,
        }
    }

    /// Block until the step's terminal event arrives.
    pub async fn wait(mut self) -> Result<StepResult> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if event.request_id() != Some(self.request_id.as_str()) {
                        continue;
                    }
                    match event {
                        EventEnvelope::TicketCompleted { success, summary, .. } => {
                            return Ok(if success {
                                StepResult::Success { summary }
                            } else {
                                StepResult::Failure {
                                    message: summary.unwrap_or_else(|| "step reported failure".into()),
                                }
                            });
                        }
                        EventEnvelope::TicketError { message, .. } => {
                            return Ok(StepResult::Failure { message });
                        }
                        _ => continue,
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event feed lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ForemanError::Unavailable("event feed closed".into()));
                }
            }
        }
    }
}

type FrameWriter = FramedWrite<OwnedWriteHalf, LineCodec<RequestEnvelope>>;

struct SessionShared {
    config: SessionConfig,
    writer: Mutex<Option<FrameWriter>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponseEnvelope>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    subscribed: AtomicBool,
    conn_epoch: AtomicU64,
    events: broadcast::Sender<EventEnvelope>,
    aliases: Mutex<HashMap<String, String>>,
    disconnected: Notify,
    shutdown: CancellationToken,
}

/// Client session over the worker's control socket.
pub struct ControlSession {
    shared: Arc<SessionShared>,
}

impl ControlSession {
    /// Create a session with the given config. No connection is made until
    /// [`connect`](Self::connect) or [`start`](Self::start).
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            shared: Arc::new(SessionShared {
                config,
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                conn_epoch: AtomicU64::new(0),
                events,
                aliases: Mutex::new(HashMap::new()),
                disconnected: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Connect and spawn the reconnect supervisor.
    pub async fn start(&self) -> Result<()> {
        self.connect().await?;
        self.spawn_supervisor();
        Ok(())
    }

    /// Open the transport and run the hello handshake. Fails closed on
    /// version or identity rejection.
    pub async fn connect(&self) -> Result<()> {
        Self::establish(&self.shared).await
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Get the configured socket path.
    pub fn endpoint(&self) -> &Path {
        &self.shared.config.endpoint
    }

    /// Tear the session down. Pending calls fail and no reconnects follow.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.connected.store(false, Ordering::SeqCst);
        *self.shared.writer.lock().await = None;
        self.shared.pending.lock().await.clear();
    }

    /// Subscribe a local listener to the event feed.
    ///
    /// Events only flow once [`subscribe`](Self::subscribe) has upgraded the
    /// connection.
    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.shared.events.subscribe()
    }

    /// Upgrade the connection into a standing event feed and return a local
    /// listener. The upgrade survives reconnects.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<EventEnvelope>> {
        match self.call(RequestBody::Subscribe).await? {
            ResponseBody::SubscribeOk => {
                self.shared.subscribed.store(true, Ordering::SeqCst);
                Ok(self.shared.events.subscribe())
            }
            other => Err(ForemanError::Protocol(format!(
                "unexpected response to subscribe: {:?}",
                other
            ))),
        }
    }

    /// Send one request and wait for its correlated response.
    pub async fn call(&self, body: RequestBody) -> Result<ResponseBody> {
        Self::call_on(&self.shared, body).await
    }

    /// Query the worker's active operations. This is the reconciliation
    /// entry point for callers whose feed-derived state may be stale.
    pub async fn worker_status(&self, thread_id: Option<String>) -> Result<Vec<ThreadStatus>> {
        match self.call(RequestBody::WorkerStatus { thread_id }).await? {
            ResponseBody::WorkerStatusOk { threads } => Ok(threads),
            other => Err(ForemanError::Protocol(format!(
                "unexpected response to workerStatus: {:?}",
                other
            ))),
        }
    }

    /// Request cooperative cancellation of one submitted operation.
    pub async fn cancel_task(&self, request_id: &str) -> Result<()> {
        match self
            .call(RequestBody::CancelTask {
                request_id: request_id.to_string(),
            })
            .await?
        {
            ResponseBody::CancelTaskOk => Ok(()),
            other => Err(ForemanError::Protocol(format!(
                "unexpected response to cancelTask: {:?}",
                other
            ))),
        }
    }

    /// Ask the worker process to stop.
    pub async fn stop_worker(&self) -> Result<()> {
        match self.call(RequestBody::StopWorker).await? {
            ResponseBody::StopWorkerOk => Ok(()),
            other => Err(ForemanError::Protocol(format!(
                "unexpected response to stopWorker: {:?}",
                other
            ))),
        }
    }

    /// The provider thread id a logical thread currently aliases to.
    pub async fn resolved_thread(&self, logical: &str) -> Option<String> {
        self.shared.aliases.lock().await.get(logical).cloned()
    }

    /// Submit one step and return a handle awaiting its terminal event.
    ///
    /// A rejection reporting the operation already in flight is treated as
    /// indeterminate, not failed: a submit may have been accepted just
    /// before a transient disconnect ate the response. The authoritative
    /// worker state is queried; if the active operation's request id matches
    /// this submission's idempotency key the submission is adopted as
    /// accepted. Otherwise the submit is retried a bounded number of times.
    pub async fn submit_step(&self, submission: StepSubmission) -> Result<PendingStep> {
        // Listen before submitting so the terminal event cannot be missed
        let events = self.shared.events.subscribe();

        let mut attempt = 0;
        loop {
            let result = self
                .call(RequestBody::SubmitTask {
                    request_id: submission.request_id.clone(),
                    kind: submission.kind,
                    mode: submission.mode,
                    prompt: submission.prompt.clone(),
                    thread_id: submission.logical_thread_id.clone(),
                    project_id: submission.project_id.clone(),
                })
                .await;

            match result {
                Ok(ResponseBody::SubmitTaskOk { request_id, thread_id }) => {
                    self.record_alias(&submission, &thread_id).await;
                    return Ok(PendingStep {
                        request_id,
                        thread_id,
                        reattached: false,
                        events,
                    });
                }
                Ok(other) => {
                    return Err(ForemanError::Protocol(format!(
                        "unexpected response to submitTask: {:?}",
                        other
                    )));
                }
                Err(ForemanError::Remote(message)) if AdmissionError::is_in_flight_conflict(&message) => {
                    let threads = self.worker_status(submission.logical_thread_id.clone()).await?;
                    if let Some(active) = threads.iter().find(|t| t.request_id == submission.request_id) {
                        info!(
                            "reattached to in-flight step {} on thread {}",
                            submission.request_id, active.thread_id
                        );
                        self.record_alias(&submission, &active.thread_id).await;
                        return Ok(PendingStep {
                            request_id: submission.request_id.clone(),
                            thread_id: active.thread_id.clone(),
                            reattached: true,
                            events,
                        });
                    }

                    attempt += 1;
                    if attempt >= self.shared.config.reattach_attempts {
                        return Err(ForemanError::Remote(message));
                    }
                    debug!(
                        "submit {} conflicted with a foreign operation, retrying ({}/{})",
                        submission.request_id, attempt, self.shared.config.reattach_attempts
                    );
                    tokio::time::sleep(self.shared.config.reattach_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_alias(&self, submission: &StepSubmission, thread_id: &str) {
        if let Some(logical) = &submission.logical_thread_id {
            self.shared
                .aliases
                .lock()
                .await
                .insert(logical.clone(), thread_id.to_string());
        }
    }

    fn spawn_supervisor(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    _ = shared.disconnected.notified() => {}
                }

                let mut backoff = shared.config.reconnect_initial;
                loop {
                    tokio::select! {
                        _ = shared.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    match Self::establish(&shared).await {
                        Ok(()) => {
                            info!("reconnected to worker control socket");
                            break;
                        }
                        Err(e) => {
                            debug!("reconnect attempt failed: {}", e);
                            backoff = (backoff * 2).min(shared.config.reconnect_max);
                        }
                    }
                }
            }
        });
    }

    async fn establish(shared: &Arc<SessionShared>) -> Result<()> {
        let stream = UnixStream::connect(&shared.config.endpoint)
            .await
            .map_err(|e| ForemanError::Unavailable(format!("failed to connect: {}", e)))?;
        let (read_half, write_half) = stream.into_split();

        let epoch = shared.conn_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *shared.writer.lock().await = Some(FramedWrite::new(write_half, LineCodec::new()));
        shared.connected.store(true, Ordering::SeqCst);
        Self::spawn_reader(Arc::clone(shared), read_half, epoch);

        if let Err(e) = Self::handshake(shared).await {
            shared.connected.store(false, Ordering::SeqCst);
            *shared.writer.lock().await = None;
            return Err(e);
        }

        // A standing subscription survives reconnects
        if shared.subscribed.load(Ordering::SeqCst) {
            match Self::call_on(shared, RequestBody::Subscribe).await {
                Ok(ResponseBody::SubscribeOk) => debug!("re-subscribed event feed"),
                Ok(other) => {
                    return Err(ForemanError::Protocol(format!(
                        "unexpected response to subscribe: {:?}",
                        other
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn handshake(shared: &Arc<SessionShared>) -> Result<(u32, u32)> {
        let body = RequestBody::Hello {
            min_protocol_version: shared.config.min_protocol_version,
            instance_token: shared.config.expected_token.clone(),
        };
        match Self::call_on(shared, body).await {
            Ok(ResponseBody::HelloOk {
                process_id,
                protocol_version,
            }) => {
                if protocol_version < shared.config.min_protocol_version {
                    return Err(ForemanError::Handshake(format!(
                        "worker speaks protocol {} but {} is required",
                        protocol_version, shared.config.min_protocol_version
                    )));
                }
                debug!(
                    "handshake ok: worker pid {} protocol {}",
                    process_id, protocol_version
                );
                Ok((process_id, protocol_version))
            }
            Ok(other) => Err(ForemanError::Protocol(format!(
                "unexpected response to hello: {:?}",
                other
            ))),
            // The worker rejects version/identity via an error envelope
            Err(ForemanError::Remote(message)) => Err(ForemanError::Handshake(message)),
            Err(e) => Err(e),
        }
    }

    async fn call_on(shared: &Arc<SessionShared>, body: RequestBody) -> Result<ResponseBody> {
        if !shared.connected.load(Ordering::SeqCst) {
            return Err(ForemanError::Unavailable("not connected".into()));
        }

        let label = request_label(&body);
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().await.insert(id, tx);

        // One writer at a time, whole-frame, non-interleaved
        let write_result = {
            let mut writer = shared.writer.lock().await;
            match writer.as_mut() {
                Some(w) => w
                    .send(RequestEnvelope::new(id, body))
                    .await
                    .map_err(|e| ForemanError::Unavailable(format!("write failed: {}", e))),
                None => Err(ForemanError::Unavailable("writer not available".into())),
            }
        };
        if let Err(e) = write_result {
            shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(shared.config.call_timeout, rx).await {
            Ok(Ok(response)) => match response.body {
                ResponseBody::Error { message } => Err(ForemanError::Remote(message)),
                other => Ok(other),
            },
            Ok(Err(_)) => Err(ForemanError::Unavailable(
                "connection lost while awaiting response".into(),
            )),
            Err(_) => {
                shared.pending.lock().await.remove(&id);
                Err(ForemanError::Timeout(label.to_string()))
            }
        }
    }

    fn spawn_reader(shared: Arc<SessionShared>, read_half: OwnedReadHalf, epoch: u64) {
        tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, LineCodec::<ClientBound>::new());

            loop {
                let item = tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    item = frames.next() => item,
                };

                match item {
                    Some(Ok(ClientBound::Response(response))) => {
                        let sender = shared.pending.lock().await.remove(&response.id);
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => debug!("dropping uncorrelated response id {}", response.id),
                        }
                    }
                    Some(Ok(ClientBound::Event(event))) => {
                        let _ = shared.events.send(event);
                    }
                    Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                        // Bad frame: scoped to that line, the feed survives
                        debug!("dropping unparseable line: {}", e);
                    }
                    Some(Err(e)) => {
                        warn!("control socket read error: {}", e);
                        break;
                    }
                    None => break,
                }
            }

            // Only tear down if a newer connection has not replaced this one
            if shared.conn_epoch.load(Ordering::SeqCst) == epoch {
                shared.connected.store(false, Ordering::SeqCst);
                *shared.writer.lock().await = None;
                // Dropping pending senders fails their calls as unavailable
                shared.pending.lock().await.clear();
                // The alias table is connection-scoped
                shared.aliases.lock().await.clear();
                shared.disconnected.notify_one();
                debug!("control socket disconnected");
            }
        });
    }
}

fn request_label(body: &RequestBody) -> &'static str {
    match body {
        RequestBody::Hello { .. } => "hello",
        RequestBody::SubmitTask { .. } => "submitTask",
        RequestBody::Subscribe => "subscribe",
        RequestBody::WorkerStatus { .. } => "workerStatus",
        RequestBody::CancelTask { .. } => "cancelTask",
        RequestBody::StopWorker => "stopWorker",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SessionConfig::default();
        assert!(config.endpoint.ends_with("foreman/control.sock"));
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect_initial, Duration::from_secs(1));
        assert_eq!(config.reconnect_max, Duration::from_secs(10));
        assert_eq!(config.reattach_attempts, 3);
    }

    #[test]
    fn test_config_with_endpoint() {
        let config = SessionConfig::with_endpoint("/custom/control.sock");
        assert_eq!(config.endpoint, PathBuf::from("/custom/control.sock"));
    }

    #[test]
    fn test_config_from_record() {
        let record = SessionRecord::new(42, 1, "/run/foreman/control.sock", "tok-xyz");
        let config = SessionConfig::from_record(&record);
        assert_eq!(config.endpoint, PathBuf::from("/run/foreman/control.sock"));
        assert_eq!(config.expected_token.as_deref(), Some("tok-xyz"));
    }

    #[test]
    fn test_session_new_not_connected() {
        let session = ControlSession::new(SessionConfig::with_endpoint("/nonexistent.sock"));
        assert!(!session.is_connected());
        assert_eq!(session.endpoint(), Path::new("/nonexistent.sock"));
    }

    #[test]
    fn test_request_label() {
        assert_eq!(request_label(&RequestBody::Subscribe), "subscribe");
        assert_eq!(request_label(&RequestBody::StopWorker), "stopWorker");
        assert_eq!(
            request_label(&RequestBody::CancelTask {
                request_id: "k".into()
            }),
            "cancelTask"
        );
    }

    #[tokio::test]
    async fn test_call_when_not_connected() {
        let session = ControlSession::new(SessionConfig::with_endpoint("/nonexistent.sock"));
        let err = session.call(RequestBody::Subscribe).await.unwrap_err();
        assert!(matches!(err, ForemanError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_connect_nonexistent_socket() {
        let session = ControlSession::new(SessionConfig::with_endpoint("/nonexistent/path.sock"));
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, ForemanError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_convenience_calls_require_connection() {
        let session = ControlSession::new(SessionConfig::with_endpoint("/nonexistent.sock"));
        assert!(session.worker_status(None).await.is_err());
        assert!(session.cancel_task("k").await.is_err());
        assert!(session.stop_worker().await.is_err());
        assert!(session.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn test_events_listener_without_subscription_is_empty() {
        let session = ControlSession::new(SessionConfig::with_endpoint("/nonexistent.sock"));
        let mut rx = session.events();
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_pending_step_wait_resolves_on_completed() {
        let (tx, rx) = broadcast::channel(8);
        let pending = PendingStep {
            request_id: "key-1".into(),
            thread_id: "wt-1".into(),
            reattached: false,
            events: rx,
        };

        tx.send(EventEnvelope::TicketOutput {
            request_id: "key-1".into(),
            text: "working".into(),
            thread_id: None,
        })
        .unwrap();
        // Events for other requests are ignored
        tx.send(EventEnvelope::TicketCompleted {
            request_id: "other".into(),
            success: false,
            summary: None,
        })
        .unwrap();
        tx.send(EventEnvelope::TicketCompleted {
            request_id: "key-1".into(),
            success: true,
            summary: Some("done".into()),
        })
        .unwrap();

        let result = pending.wait().await.unwrap();
        assert_eq!(
            result,
            StepResult::Success {
                summary: Some("done".into())
            }
        );
    }

    #[tokio::test]
    async fn test_pending_step_wait_resolves_on_error() {
        let (tx, rx) = broadcast::channel(8);
        let pending = PendingStep {
            request_id: "key-1".into(),
            thread_id: "wt-1".into(),
            reattached: false,
            events: rx,
        };

        tx.send(EventEnvelope::TicketError {
            request_id: "key-1".into(),
            message: "exploded".into(),
        })
        .unwrap();

        let result = pending.wait().await.unwrap();
        assert_eq!(
            result,
            StepResult::Failure {
                message: "exploded".into()
            }
        );
    }

    #[tokio::test]
    async fn test_pending_step_unsuccessful_completion_is_failure() {
        let (tx, rx) = broadcast::channel(8);
        let pending = PendingStep {
            request_id: "key-1".into(),
            thread_id: "wt-1".into(),
            reattached: false,
            events: rx,
        };

        tx.send(EventEnvelope::TicketCompleted {
            request_id: "key-1".into(),
            success: false,
            summary: None,
        })
        .unwrap();

        let result = pending.wait().await.unwrap();
        assert!(matches!(result, StepResult::Failure { .. }));
    }
}
