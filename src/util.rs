//! Shared utility functions.

use std::fs;
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run blocking work (libgit2, filesystem) off the async executor.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Write `content` to `path` via a sibling temp file and rename, so readers
/// never observe a partially written file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state"),
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Reduce an identifier to characters safe for paths and git ref names.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '-');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Path- and ref-safe name for a task id, distinct for distinct ids.
///
/// Ids that are already safe are used as is. Anything else gets a short
/// digest of the raw id appended, so `a/b` and `a-b` never share a name.
pub fn task_slug(raw: &str) -> String {
    let cleaned = sanitize_component(raw);
    if cleaned == raw {
        return cleaned;
    }
    let digest = Sha256::digest(raw.as_bytes());
    let hash = digest[..6]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("{cleaned}-{hash}")
}
