pub mod describe;
pub mod list;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use thiserror::Error;
use tracing::debug;

use gangway_state::StatusSnapshot;
use gangway_state::snapshot::read_snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Failures with a dedicated exit code.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("group {0} not found")]
    NotFound(String),

    #[error("status snapshot unavailable at {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        source: gangway_state::StateError,
    },
}

pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<StatusError>() {
        Some(StatusError::NotFound(_)) => 1,
        Some(StatusError::Unavailable { .. }) | None => 2,
    }
}

pub fn load(path: &Path) -> Result<StatusSnapshot, StatusError> {
    let snapshot = read_snapshot(path).map_err(|source| StatusError::Unavailable {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(
        path = %path.display(),
        groups = snapshot.groups.len(),
        generated_at_ms = snapshot.generated_at_ms,
        "status snapshot loaded"
    );
    Ok(snapshot)
}

/// "42s", "3m07s", "2h05m".
pub fn format_duration_ms(ms: u64) -> String {
    let secs = ms / 1000;
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}

pub fn format_timestamp_ms(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}
