//! Status snapshot file.
//!
//! The daemon periodically dumps a [`StatusSnapshot`] as JSON so that
//! `gangctl` can read group status without opening the redb file, which
//! is held exclusively by the daemon.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::StatusSnapshot;

/// Write the snapshot to `path`, replacing any previous one atomically.
pub fn write_snapshot(path: &Path, snapshot: &StatusSnapshot) -> StateResult<()> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(|e| StateError::Serialize(e.to_string()))?;
    let tmp = temp_path(path);
    std::fs::write(&tmp, json).map_err(|e| StateError::Io(format!("{}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| StateError::Io(format!("{}: {e}", path.display())))?;
    debug!(path = %path.display(), groups = snapshot.groups.len(), "status snapshot written");
    Ok(())
}

pub fn read_snapshot(path: &Path) -> StateResult<StatusSnapshot> {
    let bytes =
        std::fs::read(path).map_err(|e| StateError::Io(format!("{}: {e}", path.display())))?;
    serde_json::from_slice(&bytes).map_err(|e| StateError::Deserialize(e.to_string()))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
