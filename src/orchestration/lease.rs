//! Per-attempt exclusivity leases.
//!
//! A lease is a small JSON file under `<wave dir>/leases/`. The body is
//! written to a staging file first and then hard-linked into place, so the
//! lease name only ever appears with complete content and two acquirers can
//! never both succeed. A lease whose holder process is gone is moved aside
//! and reclaimed on the next acquire (or on resume).

use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::TaskId;
use crate::util::task_slug;
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

/// How long an unreadable lease file is treated as held before it may be
/// reclaimed.
const UNREADABLE_GRACE: Duration = Duration::from_secs(30);

/// Proof of exclusive ownership of one task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: TaskId,
    pub attempt: u32,
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
    /// Distinguishes acquisitions made by the same process.
    #[serde(default)]
    pub token: String,
}

/// What currently sits at a lease path.
enum Holder {
    Vacant,
    Live(u32),
    /// Unreadable and too recent to judge.
    Unsettled,
    /// Dead holder, or unreadable past the grace period.
    Stale(Option<Lease>),
}

pub struct LeaseManager {
    dir: PathBuf,
    pid: u32,
}

impl LeaseManager {
    pub fn new(dir: &Path) -> Self {
        Self::with_pid(dir, std::process::id())
    }

    /// Build a manager that acquires on behalf of `pid`.
    pub fn with_pid(dir: &Path, pid: u32) -> Self {
        Self {
            dir: dir.to_path_buf(),
            pid,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lease_path(&self, task_id: &TaskId, attempt: u32) -> PathBuf {
        self.dir
            .join(format!("{}-a{}.lease", task_slug(task_id.as_str()), attempt))
    }

    /// A sibling of `path` that no other acquirer will pick.
    fn scratch_path(path: &Path, tag: &str) -> PathBuf {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("lease");
        path.with_file_name(format!(
            ".{}.{}-{}",
            name,
            tag,
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Acquire the lease for `(task_id, attempt)` without waiting.
    ///
    /// # Errors
    /// `LeaseContention` when a live process already holds it, or when the
    /// lease file cannot be read yet.
    pub fn acquire(&self, task_id: &TaskId, attempt: u32) -> Result<Lease> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lease_path(task_id, attempt);
        let lease = Lease {
            task_id: task_id.clone(),
            attempt,
            holder_pid: self.pid,
            acquired_at: Utc::now(),
            token: uuid::Uuid::new_v4().simple().to_string(),
        };

        let staged = Self::scratch_path(&path, "staged");
        {
            let mut file = fs::File::create(&staged)?;
            file.write_all(&serde_json::to_vec(&lease)?)?;
            file.sync_all()?;
        }
        let installed = self.install(&staged, &path, &lease);
        let _ = fs::remove_file(&staged);
        installed
    }

    fn install(&self, staged: &Path, path: &Path, lease: &Lease) -> Result<Lease> {
        let contention = |holder_pid: u32| Error::LeaseContention {
            task: lease.task_id.to_string(),
            attempt: lease.attempt,
            holder_pid,
        };

        // One reclaim retry: a stale lease is moved aside and the link re-attempted.
        for _ in 0..2 {
            match fs::hard_link(staged, path) {
                Ok(()) => {
                    rlog_debug!(
                        "Lease acquired {} attempt {} pid {}",
                        lease.task_id,
                        lease.attempt,
                        self.pid
                    );
                    return Ok(lease.clone());
                }
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => match inspect(path)? {
                    Holder::Vacant => continue,
                    Holder::Live(pid) => return Err(contention(pid)),
                    Holder::Unsettled => return Err(contention(0)),
                    Holder::Stale(expected) => {
                        match &expected {
                            Some(held) => rlog!(
                                "Reclaiming stale lease {} attempt {} (pid {} not alive)",
                                lease.task_id,
                                lease.attempt,
                                held.holder_pid
                            ),
                            None => rlog_warn!("Reclaiming unreadable lease {}", path.display()),
                        }
                        if !set_aside(path, expected.as_ref())? {
                            return Err(contention(holder_pid_at(path)?));
                        }
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(contention(holder_pid_at(path)?))
    }

    /// Release a lease. Releasing twice, or releasing a lease that has since
    /// been reclaimed by another holder, is a no-op.
    pub fn release(&self, lease: &Lease) -> Result<()> {
        let path = self.lease_path(&lease.task_id, lease.attempt);
        match read_lease(&path)? {
            Some(held) if held.token == lease.token && held.holder_pid == lease.holder_pid => {
                remove_if_present(&path)?;
                rlog_debug!("Lease released {} attempt {}", lease.task_id, lease.attempt);
            }
            Some(held) => {
                rlog_warn!(
                    "Lease {} attempt {} now held by pid {}, not releasing",
                    lease.task_id,
                    lease.attempt,
                    held.holder_pid
                );
            }
            None => {}
        }
        Ok(())
    }

    /// Reclaim every lease whose holder is no longer alive and clear out
    /// scratch files left by crashed acquirers. Returns how many leases were
    /// reclaimed.
    pub fn reclaim_stale(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut reclaimed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !is_lease_file(&path) {
                if older_than(&path, UNREADABLE_GRACE)? {
                    remove_if_present(&path)?;
                }
                continue;
            }
            if let Holder::Stale(expected) = inspect(&path)? {
                if set_aside(&path, expected.as_ref())? {
                    rlog!("Reclaimed stale lease {}", path.display());
                    reclaimed += 1;
                }
            }
        }
        Ok(reclaimed)
    }

    /// Leases currently on disk.
    pub fn active(&self) -> Result<Vec<Lease>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut leases = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !is_lease_file(&path) {
                continue;
            }
            if let Some(lease) = read_lease(&path)? {
                leases.push(lease);
            }
        }
        leases.sort_by(|a, b| (&a.task_id, a.attempt).cmp(&(&b.task_id, b.attempt)));
        Ok(leases)
    }
}

fn is_lease_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true);
    !hidden && path.extension().and_then(|e| e.to_str()) == Some("lease")
}

fn older_than(path: &Path, age: Duration) -> Result<bool> {
    let modified = match fs::metadata(path) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(SystemTime::now()
        .duration_since(modified)
        .map(|elapsed| elapsed >= age)
        .unwrap_or(false))
}

fn inspect(path: &Path) -> Result<Holder> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Holder::Vacant),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice::<Lease>(&bytes) {
        Ok(held) if is_process_alive(held.holder_pid) => Ok(Holder::Live(held.holder_pid)),
        Ok(held) => Ok(Holder::Stale(Some(held))),
        Err(_) if older_than(path, UNREADABLE_GRACE)? => Ok(Holder::Stale(None)),
        Err(_) => Ok(Holder::Unsettled),
    }
}

/// Move the lease at `path` aside if it is still the one judged stale.
///
/// Returns `false` when another acquirer replaced it in the meantime; the
/// replacement is put back.
fn set_aside(path: &Path, expected: Option<&Lease>) -> Result<bool> {
    let aside = LeaseManager::scratch_path(path, "stale");
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }

    let moved = fs::read(&aside)?;
    let still_stale = match serde_json::from_slice::<Lease>(&moved) {
        Ok(held) => expected == Some(&held),
        Err(_) => expected.is_none(),
    };
    if !still_stale {
        match fs::hard_link(&aside, path) {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    remove_if_present(&aside)?;
    Ok(still_stale)
}

fn holder_pid_at(path: &Path) -> Result<u32> {
    Ok(read_lease(path)?.map(|l| l.holder_pid).unwrap_or(0))
}

fn read_lease(path: &Path) -> Result<Option<Lease>> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether a process with `pid` exists.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        let Ok(raw) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // Signal 0 performs the existence and permission checks only.
        let rc = unsafe { libc::kill(raw, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        pid == std::process::id()
    }
}
