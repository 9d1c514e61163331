//! Cooperative wave cancellation.
//!
//! A wave is cancelled either in-process through its `CancellationToken` or
//! from another process by the `cancel` marker file in the wave directory.
//! Both are only polled between batches and between attempts.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::{rlog, Result};

#[derive(Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    marker: PathBuf,
}

impl CancelSignal {
    pub fn new(token: CancellationToken, marker: &Path) -> Self {
        Self {
            token,
            marker: marker.to_path_buf(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether cancellation was requested. Seeing the marker also trips the
    /// token so later checks skip the filesystem.
    pub fn is_cancelled(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        if self.marker.exists() {
            rlog!("Cancel marker observed at {}", self.marker.display());
            self.token.cancel();
            return true;
        }
        false
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Write the cancel marker for a wave directory.
pub fn request_cancel(marker: &Path) -> Result<()> {
    if let Some(parent) = marker.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(marker, chrono::Utc::now().to_rfc3339())?;
    Ok(())
}

/// Remove the cancel marker if present.
pub fn clear_cancel(marker: &Path) -> Result<()> {
    match std::fs::remove_file(marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
