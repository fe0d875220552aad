//! ID generation utilities for Foreman
//!
//! Provides millisecond timestamps, generated identifiers for runs and
//! worker threads, and the deterministic idempotency key used to address one
//! logical step of one ticket.

use rand::Rng;

/// Step name used for a ticket's primary execution in idempotency keys.
pub const PRIMARY_STEP: &str = "codex";

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a unique run ID
///
/// Format: `run-{timestamp_ms}-{random_hex}`
pub fn generate_run_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("run-{}-{:04x}", timestamp, random)
}

/// Generate a provider thread ID for a worker-created thread context
///
/// Format: `wt-{timestamp_ms}-{random_hex}`
pub fn generate_thread_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("wt-{}-{:04x}", timestamp, random)
}

/// Build the deterministic idempotency key for one logical step.
///
/// Format: `run:{runID}:ticket:{ticketID}:step:{stepName}`. The key doubles
/// as the wire request id, so a retried submission for the same logical step
/// reuses it exactly.
pub fn idempotency_key(run_id: &str, ticket_id: &str, step_name: &str) -> String {
    format!("run:{}:ticket:{}:step:{}", run_id, ticket_id, step_name)
}
