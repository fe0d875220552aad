//! Session record: the worker's published identity.
//!
//! A JSON file at a well-known location describing the running
//! worker-control process. The client core only reads it; the worker server
//! writes it on startup and removes it on clean shutdown. A record's
//! presence is never taken as proof of health; the probe insists on an
//! authenticated handshake.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{ForemanError, Result};

/// Identity of a running worker-control process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// PID of the worker process
    pub process_id: u32,
    /// Protocol version the worker speaks
    pub protocol_version: u32,
    /// Path of the control socket
    pub control_endpoint: PathBuf,
    /// Token the worker expects in hello handshakes
    pub instance_token: String,
}

impl SessionRecord {
    /// Create a record for the current process.
    pub fn new(
        process_id: u32,
        protocol_version: u32,
        control_endpoint: impl Into<PathBuf>,
        instance_token: impl Into<String>,
    ) -> Self {
        Self {
            process_id,
            protocol_version,
            control_endpoint: control_endpoint.into(),
            instance_token: instance_token.into(),
        }
    }

    /// Check required fields.
    fn validate(&self) -> Result<()> {
        if self.process_id == 0 {
            return Err(ForemanError::Record("processId is zero".into()));
        }
        if self.control_endpoint.as_os_str().is_empty() {
            return Err(ForemanError::Record("controlEndpoint is empty".into()));
        }
        if self.instance_token.is_empty() {
            return Err(ForemanError::Record("instanceToken is empty".into()));
        }
        Ok(())
    }

    /// Load a record from `path`.
    ///
    /// Returns `Ok(None)` when the file does not exist; an unparseable file
    /// or one with missing/invalid fields is a `Record` error so callers can
    /// distinguish "not running" from "invalid record".
    pub fn load(path: &Path) -> Result<Option<SessionRecord>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)?;
        let record: SessionRecord = serde_json::from_str(&contents)
            .map_err(|e| ForemanError::Record(format!("unparseable record: {}", e)))?;
        record.validate()?;

        Ok(Some(record))
    }

    /// Write the record to `path` with replace-whole-file semantics.
    pub fn store(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let parent = path
            .parent()
            .ok_or_else(|| ForemanError::Record(format!("record path has no parent: {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path)
            .map_err(|e| ForemanError::Storage(format!("failed to persist record: {}", e)))?;

        debug!("wrote session record to {}", path.display());
        Ok(())
    }

    /// Remove the record file if present.
    pub fn remove(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)?;
            debug!("removed session record at {}", path.display());
        }
        Ok(())
    }
}
