//! Liveness probe.
//!
//! Answers "is the control process healthy" on a short-lived connection,
//! without disturbing the long-lived session. A record's presence is not
//! proof of health, and a live-process signal is not either (PID reuse, a
//! wedged process). Only a successful authenticated handshake counts.

use std::path::PathBuf;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::protocol::{ClientBound, LineCodec, PROTOCOL_VERSION, RequestBody, RequestEnvelope, ResponseBody};
use crate::session::SessionRecord;

/// Health classification of the worker-control process.
///
/// Six cases, rendered differently by callers; the taxonomy is part of the
/// probe's contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerHealth {
    /// Authenticated handshake succeeded and matched the record
    Healthy { process_id: u32, protocol_version: u32 },
    /// No session record exists
    NotRunning,
    /// Record present, process dead, socket unreachable
    StaleRecord { process_id: u32 },
    /// Record present and process alive, but the socket cannot be reached
    Unreachable { process_id: u32 },
    /// Connected, but the worker rejected identity/version (or replied
    /// nonsense)
    HandshakeFailed { message: String },
    /// Record file unparseable or missing required fields
    InvalidRecord { message: String },
}

/// Configuration for the liveness probe.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Location of the session record file.
    pub record_path: PathBuf,
    /// Bound on the whole connect + hello exchange.
    pub handshake_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            record_path: crate::paths::default_record_path(),
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

impl ProbeConfig {
    /// Create config with a custom record path.
    pub fn with_record_path(path: impl Into<PathBuf>) -> Self {
        Self {
            record_path: path.into(),
            ..Default::default()
        }
    }
}

enum HandshakeFailure {
    /// Could not reach the socket at all
    Connect(String),
    /// Reached it, but the handshake was rejected or made no sense
    Rejected(String),
}

/// Probe for worker-process health.
#[derive(Debug, Clone)]
pub struct LivenessProbe {
    config: ProbeConfig,
}

impl LivenessProbe {
    /// Create a probe with the given config.
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Create a probe reading the record at `path`.
    pub fn with_record_path(path: impl Into<PathBuf>) -> Self {
        Self::new(ProbeConfig::with_record_path(path))
    }

    /// Classify the worker's health.
    pub async fn check(&self) -> WorkerHealth {
        let record = match SessionRecord::load(&self.config.record_path) {
            Ok(Some(record)) => record,
            Ok(None) => return WorkerHealth::NotRunning,
            Err(e) => {
                return WorkerHealth::InvalidRecord { message: e.to_string() };
            }
        };

        // Checked up front: the signal result breaks the tie when the
        // handshake cannot connect at all
        let alive = process_alive(record.process_id);

        match self.handshake(&record).await {
            Ok((process_id, protocol_version)) => {
                if process_id != record.process_id {
                    WorkerHealth::HandshakeFailed {
                        message: format!(
                            "worker reports pid {} but record says {}",
                            process_id, record.process_id
                        ),
                    }
                } else {
                    WorkerHealth::Healthy {
                        process_id,
                        protocol_version,
                    }
                }
            }
            Err(HandshakeFailure::Connect(reason)) => {
                debug!("probe could not connect: {}", reason);
                if alive {
                    WorkerHealth::Unreachable {
                        process_id: record.process_id,
                    }
                } else {
                    WorkerHealth::StaleRecord {
                        process_id: record.process_id,
                    }
                }
            }
            Err(HandshakeFailure::Rejected(message)) => WorkerHealth::HandshakeFailed { message },
        }
    }

    async fn handshake(&self, record: &SessionRecord) -> Result<(u32, u32), HandshakeFailure> {
        let connect = tokio::time::timeout(
            self.config.handshake_timeout,
            UnixStream::connect(&record.control_endpoint),
        );
        let stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(HandshakeFailure::Connect(e.to_string())),
            Err(_) => return Err(HandshakeFailure::Connect("connect timed out".into())),
        };

        let (read_half, write_half) = stream.into_split();
        let mut writer = FramedWrite::new(write_half, LineCodec::<RequestEnvelope>::new());
        let mut reader = FramedRead::new(read_half, LineCodec::<ClientBound>::new());

        let hello = RequestEnvelope::new(
            1,
            RequestBody::Hello {
                min_protocol_version: PROTOCOL_VERSION,
                instance_token: Some(record.instance_token.clone()),
            },
        );
        if let Err(e) = writer.send(hello).await {
            return Err(HandshakeFailure::Connect(format!("write failed: {}", e)));
        }

        match tokio::time::timeout(self.config.handshake_timeout, reader.next()).await {
            Ok(Some(Ok(ClientBound::Response(response)))) => match response.body {
                ResponseBody::HelloOk {
                    process_id,
                    protocol_version,
                } => Ok((process_id, protocol_version)),
                ResponseBody::Error { message } => Err(HandshakeFailure::Rejected(message)),
                other => Err(HandshakeFailure::Rejected(format!(
                    "unexpected handshake reply: {:?}",
                    other
                ))),
            },
            Ok(Some(Ok(ClientBound::Event(event)))) => Err(HandshakeFailure::Rejected(format!(
                "unexpected event during handshake: {:?}",
                event
            ))),
            Ok(Some(Err(e))) => Err(HandshakeFailure::Rejected(format!("unparseable handshake reply: {}", e))),
            Ok(None) => Err(HandshakeFailure::Rejected("connection closed during handshake".into())),
            Err(_) => Err(HandshakeFailure::Rejected("handshake timed out".into())),
        }
    }
}

/// Check process liveness with a non-destructive signal.
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signal 0 checks existence without affecting the process
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
