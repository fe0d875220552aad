//! Default on-disk locations for the session record and loop snapshots.

use std::path::PathBuf;

fn base_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("foreman")
}

/// Well-known location of the worker's session record file.
pub fn default_record_path() -> PathBuf {
    base_dir().join("worker.json")
}

/// Default location of the persisted loop-run snapshot file.
pub fn default_snapshot_path() -> PathBuf {
    base_dir().join("loops.json")
}

/// Default control socket endpoint.
pub fn default_socket_path() -> PathBuf {
    base_dir().join("control.sock")
}
