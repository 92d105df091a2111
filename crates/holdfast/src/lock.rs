//! Lock file mechanism to prevent concurrent reconciliation or provisioning runs.
//!
//! Each [`LockScope`] gets its own lock file under the state directory
//! (`lock.reconcile`, `lock.provision`) so a `reconcile` run and a
//! `provision` run never contend with each other, while two runs of the
//! *same* scope still mutually exclude. Each lock file is JSON metadata
//! about its holder (PID, hostname, timestamp, run_id), written via the
//! usual create-temp-then-rename atomic pattern.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;

pub use holdfast_types::{LockInfo, LockScope};

fn file_name(scope: LockScope) -> &'static str {
    match scope {
        LockScope::Reconcile => "lock.reconcile",
        LockScope::Provision => "lock.provision",
    }
}

/// Lock file handle that automatically releases on Drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire a lock file of the given scope in the specified state directory.
    ///
    /// This will fail if a lock of the same scope already exists and is not
    /// stale. Use `is_locked` first to check, or use `acquire_with_timeout`
    /// for automatic stale lock handling.
    pub fn acquire(state_dir: &Path, scope: LockScope) -> Result<Self> {
        let lock_path = lock_path(state_dir, scope);

        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

        if lock_path.exists() {
            let existing = read_lock_info_from_path(&lock_path)?;
            bail!(
                "{:?} lock already held by pid {} on {} since {} (run_id: {:?})",
                existing.scope,
                existing.pid,
                existing.hostname,
                existing.acquired_at,
                existing.run_id
            );
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            scope,
            run_id: None,
        };

        write_lock_info(&lock_path, &info)?;

        Ok(Self { path: lock_path })
    }

    /// Acquire a lock, automatically removing stale same-scope locks: either
    /// older than `timeout`, or whose owning process is no longer alive on
    /// the same host (so a long-running but legitimately alive holder past
    /// `timeout` is NOT stolen from — see [`is_stale`]).
    pub fn acquire_with_timeout(state_dir: &Path, scope: LockScope, timeout: Duration) -> Result<Self> {
        let lock_path = lock_path(state_dir, scope);

        if lock_path.exists() {
            match read_lock_info_from_path(&lock_path) {
                Ok(info) => {
                    if is_stale(&info, timeout) {
                        fs::remove_file(&lock_path).with_context(|| {
                            format!("failed to remove stale lock file {}", lock_path.display())
                        })?;
                    } else {
                        let age = Utc::now() - info.acquired_at;
                        bail!(
                            "{:?} lock already held by pid {} on {} since {} (age: {:?})",
                            info.scope,
                            info.pid,
                            info.hostname,
                            info.acquired_at,
                            age
                        );
                    }
                }
                Err(_) => {
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove corrupt lock file {}", lock_path.display())
                    })?;
                }
            }
        }

        Self::acquire(state_dir, scope)
    }

    /// Release the lock file.
    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock file {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Stamp the owning run's id onto the lock file.
    pub fn set_run_id(&self, run_id: &str) -> Result<()> {
        if !self.path.exists() {
            bail!("lock file does not exist at {}", self.path.display());
        }
        let mut info = read_lock_info_from_path(&self.path)?;
        info.run_id = Some(run_id.to_string());
        write_lock_info(&self.path, &info)
    }

    /// Check if a lock of `scope` exists in `state_dir`.
    pub fn is_locked(state_dir: &Path, scope: LockScope) -> Result<bool> {
        Ok(lock_path(state_dir, scope).exists())
    }

    /// Read the lock file information for `scope`.
    pub fn read_lock_info(state_dir: &Path, scope: LockScope) -> Result<LockInfo> {
        read_lock_info_from_path(&lock_path(state_dir, scope))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_info(lock_path: &Path, info: &LockInfo) -> Result<()> {
    let tmp_path = lock_path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create lock tmp file {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock tmp file {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }
    fs::rename(&tmp_path, lock_path)
        .with_context(|| format!("failed to rename lock file to {}", lock_path.display()))
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

/// The lock file path for a given state directory and scope.
pub fn lock_path(state_dir: &Path, scope: LockScope) -> PathBuf {
    state_dir.join(file_name(scope))
}

/// A lock is stale if it has aged past `timeout`, or if its owning process
/// is on this host and is no longer alive. A lock owned by a different host
/// is never declared stale on liveness grounds alone, since its pid has no
/// meaning here.
fn is_stale(info: &LockInfo, timeout: Duration) -> bool {
    let age = Utc::now() - info.acquired_at;
    if age.num_seconds().unsigned_abs() > timeout.as_secs() {
        return true;
    }
    let local_hostname = gethostname::gethostname().to_string_lossy().to_string();
    info.hostname == local_hostname && !is_process_alive(info.pid)
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Owned by another user but still alive; only ESRCH means gone.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn lock_path_separates_scopes() {
        let base = PathBuf::from("x");
        assert_ne!(
            lock_path(&base, LockScope::Reconcile),
            lock_path(&base, LockScope::Provision)
        );
    }

    #[test]
    fn acquire_creates_lock_file() {
        let td = tempdir().expect("tempdir");
        let mut lock = LockFile::acquire(td.path(), LockScope::Reconcile).expect("acquire");
        assert!(lock_path(td.path(), LockScope::Reconcile).exists());
        lock.release().expect("release");
        assert!(!lock_path(td.path(), LockScope::Reconcile).exists());
    }

    #[test]
    fn acquire_fails_when_same_scope_locked() {
        let td = tempdir().expect("tempdir");
        let _lock1 = LockFile::acquire(td.path(), LockScope::Reconcile).expect("first acquire");

        let result = LockFile::acquire(td.path(), LockScope::Reconcile);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("lock already held"));
    }

    #[test]
    fn reconcile_and_provision_locks_do_not_collide() {
        let td = tempdir().expect("tempdir");
        let _reconcile = LockFile::acquire(td.path(), LockScope::Reconcile).expect("reconcile lock");
        let _provision = LockFile::acquire(td.path(), LockScope::Provision).expect("provision lock");
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().expect("tempdir");
        {
            let _lock = LockFile::acquire(td.path(), LockScope::Reconcile).expect("acquire");
            assert!(lock_path(td.path(), LockScope::Reconcile).exists());
        }
        assert!(!lock_path(td.path(), LockScope::Reconcile).exists());
    }

    #[test]
    fn read_lock_info_returns_correct_info() {
        let td = tempdir().expect("tempdir");
        let _lock = LockFile::acquire(td.path(), LockScope::Reconcile).expect("acquire");

        let info = LockFile::read_lock_info(td.path(), LockScope::Reconcile).expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert!(!info.hostname.is_empty());
        assert!(info.run_id.is_none());
    }

    #[test]
    fn set_run_id_updates_lock() {
        let td = tempdir().expect("tempdir");
        let lock = LockFile::acquire(td.path(), LockScope::Reconcile).expect("acquire");

        lock.set_run_id("run-123").expect("set run id");

        let info = LockFile::read_lock_info(td.path(), LockScope::Reconcile).expect("read info");
        assert_eq!(info.run_id, Some("run-123".to_string()));
    }

    #[test]
    fn is_locked_returns_correct_status() {
        let td = tempdir().expect("tempdir");
        assert!(!LockFile::is_locked(td.path(), LockScope::Reconcile).expect("is_locked"));

        let _lock = LockFile::acquire(td.path(), LockScope::Reconcile).expect("acquire");
        assert!(LockFile::is_locked(td.path(), LockScope::Reconcile).expect("is_locked"));
    }

    #[test]
    fn acquire_with_timeout_removes_stale_locks() {
        let td = tempdir().expect("tempdir");

        let path = lock_path(td.path(), LockScope::Reconcile);
        let old_info = LockInfo {
            pid: 12345,
            hostname: "test-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            scope: LockScope::Reconcile,
            run_id: None,
        };
        fs::write(&path, serde_json::to_string(&old_info).expect("serialize")).expect("write stale lock");

        let _lock = LockFile::acquire_with_timeout(td.path(), LockScope::Reconcile, Duration::from_secs(3600))
            .expect("acquire with timeout");

        let info = LockFile::read_lock_info(td.path(), LockScope::Reconcile).expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert_ne!(info.pid, 12345);
    }

    #[test]
    fn acquire_with_timeout_fails_on_fresh_lock() {
        let td = tempdir().expect("tempdir");

        let _lock1 = LockFile::acquire(td.path(), LockScope::Reconcile).expect("first acquire");

        let result = LockFile::acquire_with_timeout(td.path(), LockScope::Reconcile, Duration::from_secs(3600));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("lock already held"));
    }
}
