//! Exclusive run lease and item-level exclusion helpers.
//!
//! Only one orchestrator process may mutate a state directory at a time. The
//! lease is a JSON lockfile created with `O_EXCL`; a stale lease left behind
//! by a dead process is reclaimed after a liveness check on its pid.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::item::ItemIdentity;
use crate::error::{Result, VolleyError};
use crate::registry::RegistryStore;

const LEASE_FILE: &str = "run.lock";

#[derive(Debug, Serialize, Deserialize)]
struct LeaseInfo {
    pid: u32,
    started_at: DateTime<Utc>,
}

/// Exclusive run lease on a state directory.
///
/// Dropping the lease releases it, including on panic unwind, so a crashed
/// run does not wedge the directory.
#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
}

impl RunLease {
    /// Acquire the lease for `state_dir`, reclaiming at most one stale lease.
    ///
    /// Fails with [`VolleyError::AlreadyRunning`] if a live process holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LEASE_FILE);

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let info = LeaseInfo {
                        pid: std::process::id(),
                        started_at: Utc::now(),
                    };
                    file.write_all(&serde_json::to_vec_pretty(&info)?)?;
                    file.sync_all()?;
                    tracing::debug!(path = %path.display(), pid = info.pid, "run lease acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = read_lease(&path);
                    match holder {
                        Some(info) if process_alive(info.pid) => {
                            return Err(VolleyError::AlreadyRunning {
                                path,
                                pid: info.pid,
                            });
                        }
                        Some(info) => {
                            tracing::warn!(
                                path = %path.display(),
                                pid = info.pid,
                                "reclaiming stale run lease from dead process"
                            );
                        }
                        None => {
                            tracing::warn!(
                                path = %path.display(),
                                "reclaiming unreadable run lease"
                            );
                        }
                    }
                    if attempt == 0 {
                        fs::remove_file(&path)?;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        // Lost the reclaim race to another process.
        let pid = read_lease(&path).map(|i| i.pid).unwrap_or(0);
        Err(VolleyError::AlreadyRunning { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release run lease");
            }
        }
    }
}

fn read_lease(path: &Path) -> Option<LeaseInfo> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

// Without a portable liveness check, treat the holder as alive and refuse
// the lease rather than risk two concurrent writers.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// True if the identity is owned by an active batch.
pub fn is_owned_by_active_batch(store: &RegistryStore, identity: &ItemIdentity) -> Result<bool> {
    Ok(store.load()?.is_owned(identity))
}

/// Drop candidates already owned by an active batch, logging how many were
/// excluded.
pub fn filter_unowned(
    store: &RegistryStore,
    candidates: Vec<ItemIdentity>,
) -> Result<Vec<ItemIdentity>> {
    let registry = store.load()?;
    let before = candidates.len();
    let unowned: Vec<ItemIdentity> = candidates
        .into_iter()
        .filter(|c| !registry.is_owned(c))
        .collect();
    let skipped = before - unowned.len();
    if skipped > 0 {
        tracing::info!(skipped, "candidates already owned by active batches");
    }
    Ok(unowned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::item::{ItemEntry, ItemKind};
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_while_lease_held() {
        let dir = tempdir().unwrap();
        let _lease = RunLease::acquire(dir.path()).unwrap();

        let err = RunLease::acquire(dir.path()).unwrap_err();
        match err {
            VolleyError::AlreadyRunning { pid, .. } => assert_eq!(pid, std::process::id()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lease_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = {
            let lease = RunLease::acquire(dir.path()).unwrap();
            lease.path().to_path_buf()
        };
        assert!(!path.exists());
        RunLease::acquire(dir.path()).unwrap();
    }

    #[test]
    fn stale_lease_from_dead_pid_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LEASE_FILE);
        // Pid 0 never corresponds to a live userspace process in /proc.
        fs::write(
            &path,
            serde_json::to_vec(&LeaseInfo {
                pid: 0,
                started_at: Utc::now(),
            })
            .unwrap(),
        )
        .unwrap();

        let lease = RunLease::acquire(dir.path()).unwrap();
        let info = read_lease(lease.path()).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn unreadable_lease_is_reclaimed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LEASE_FILE), b"garbage").unwrap();
        RunLease::acquire(dir.path()).unwrap();
    }

    #[test]
    fn filter_unowned_excludes_active_items() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let owned = ItemIdentity::new("a.jpg", "h1");
        let free = ItemIdentity::new("b.jpg", "h2");
        store
            .with_lock(|reg| {
                let id = reg.create_batch(ItemKind::Original);
                reg.claim_item(id, ItemEntry::new(owned.clone()))
            })
            .unwrap();

        let remaining = filter_unowned(&store, vec![owned.clone(), free.clone()]).unwrap();
        assert_eq!(remaining, vec![free]);
        assert!(is_owned_by_active_batch(&store, &owned).unwrap());
    }
}
