//! Control-socket message types.
//!
//! Uses JSON Lines over a Unix stream socket. Requests and responses carry a
//! per-connection correlation `id`; server-pushed events carry none. Wire
//! field names are camelCase.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Execution mode of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Plan,
    Implement,
}

/// Discriminator for the generic submit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitKind {
    Primary,
    Cleanup,
}

/// Request sent from client to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id, unique per connection.
    pub id: u64,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl RequestEnvelope {
    /// Create a new request with the given correlation id and body.
    pub fn new(id: u64, body: RequestBody) -> Self {
        Self { id, body }
    }
}

/// Request payloads, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RequestBody {
    /// Handshake; fails closed on version or identity mismatch.
    Hello {
        min_protocol_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_token: Option<String>,
    },
    /// Submit a task. `request_id` is the deterministic idempotency key.
    SubmitTask {
        request_id: String,
        kind: SubmitKind,
        mode: TaskMode,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
    /// Upgrade this connection into a standing event feed.
    Subscribe,
    /// Query active operations, optionally scoped to one logical thread.
    WorkerStatus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    /// Cooperative cancel for one request id.
    CancelTask { request_id: String },
    /// Stop the worker process.
    StopWorker,
}

/// Response sent from worker to client; exactly one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation id of the request this answers.
    pub id: u64,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    /// Create a response with the given body.
    pub fn new(id: u64, body: ResponseBody) -> Self {
        Self { id, body }
    }

    /// Create an error response.
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            body: ResponseBody::Error {
                message: message.into(),
            },
        }
    }
}

/// Response payloads, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ResponseBody {
    #[serde(rename = "hello.ok")]
    HelloOk { process_id: u32, protocol_version: u32 },
    #[serde(rename = "submitTask.ok")]
    SubmitTaskOk { request_id: String, thread_id: String },
    #[serde(rename = "subscribe.ok")]
    SubscribeOk,
    #[serde(rename = "workerStatus.ok")]
    WorkerStatusOk { threads: Vec<ThreadStatus> },
    #[serde(rename = "cancelTask.ok")]
    CancelTaskOk,
    #[serde(rename = "stopWorker.ok")]
    StopWorkerOk,
    #[serde(rename = "error")]
    Error { message: String },
}

/// One active operation, as reported by `workerStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStatus {
    /// Resolved provider thread id.
    pub thread_id: String,
    /// Caller-chosen alias, if the thread was addressed by one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_thread_id: Option<String>,
    /// Request id of the operation holding the thread.
    pub request_id: String,
    pub mode: TaskMode,
}

/// Push event sent from worker to subscribed clients (no correlation id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum EventEnvelope {
    #[serde(rename = "worker.started")]
    WorkerStarted { process_id: u32, protocol_version: u32 },
    #[serde(rename = "worker.exited")]
    WorkerExited,
    #[serde(rename = "ticket.started")]
    TicketStarted {
        request_id: String,
        thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
    #[serde(rename = "ticket.output")]
    TicketOutput {
        request_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    #[serde(rename = "ticket.error")]
    TicketError { request_id: String, message: String },
    #[serde(rename = "ticket.completed")]
    TicketCompleted {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl EventEnvelope {
    /// The request id this event correlates to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            EventEnvelope::TicketStarted { request_id, .. }
            | EventEnvelope::TicketOutput { request_id, .. }
            | EventEnvelope::TicketError { request_id, .. }
            | EventEnvelope::TicketCompleted { request_id, .. } => Some(request_id),
            EventEnvelope::WorkerStarted { .. } | EventEnvelope::WorkerExited => None,
        }
    }

    /// True for the two terminal ticket event types.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventEnvelope::TicketError { .. } | EventEnvelope::TicketCompleted { .. }
        )
    }
}

/// Anything the worker may push down a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientBound {
    Response(ResponseEnvelope),
    Event(EventEnvelope),
}

/// Admission rejections, surfaced verbatim in error envelopes.
///
/// The message prefixes are a wire contract: the session's reattachment
/// logic matches on them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Duplicate request id is still active
    #[error("already_active: request {0} is already active")]
    AlreadyActive(String),
    /// Another implement-mode operation is running worker-wide
    #[error("implementation_in_flight")]
    ImplementationInFlight,
    /// The resolved thread already has an active operation
    #[error("thread_busy: thread {0} has an active operation")]
    ThreadBusy(String),
}

impl AdmissionError {
    /// True if an error message indicates the submitted operation may
    /// already be ours: indeterminate, worth a reattachment check.
    pub fn is_in_flight_conflict(message: &str) -> bool {
        message.starts_with("already_active") || message.starts_with("thread_busy")
    }
}
