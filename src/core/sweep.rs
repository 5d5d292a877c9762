// Cross-process retention sweeping for address directories.
//
// Any number of unrelated processes write into one directory; a sentinel file
// lock makes exactly one of them the sweeper at a time, and deletion is
// idempotent so losing a race to another sweeper is never an error.
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use tracing::{debug, trace, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::transport::MESSAGE_EXTENSION;

pub(crate) const DEFAULT_RETENTION: Duration = Duration::from_secs(1);
const IDLE_DIRECTORY_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const LOCK_FILE_NAME: &str = "sweep.lock";

fn active_sweeps() -> &'static Mutex<HashSet<PathBuf>> {
    static ACTIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

fn swept_roots() -> &'static Mutex<HashSet<PathBuf>> {
    static ROOTS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ROOTS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Begin sweeping `dir` from this process if nothing here sweeps it already.
/// The loop re-races the directory lock each cycle, so whichever cooperating
/// process wins carries the pass and everyone else no-ops.
pub(crate) fn schedule(dir: &Path, retention: Duration) {
    let dir = dir.to_path_buf();
    {
        let mut active = active_sweeps()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !active.insert(dir.clone()) {
            return;
        }
    }
    std::thread::spawn(move || {
        sweep_loop(&dir, retention);
        active_sweeps()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&dir);
    });
}

/// One-time startup pass over every channel directory under `root`: sweep
/// each once and drop directories that sat empty for the idle window.
pub(crate) fn schedule_startup(root: &Path, retention: Duration) {
    let root = root.to_path_buf();
    {
        let mut roots = swept_roots()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !roots.insert(root.clone()) {
            return;
        }
    }
    std::thread::spawn(move || sweep_all(&root, retention));
}

fn sweep_loop(dir: &Path, retention: Duration) {
    loop {
        let lock = match try_lock_directory(dir) {
            Ok(Some(lock)) => lock,
            // Another process holds the lock and will carry the pass.
            Ok(None) => {
                trace!(dir = %dir.display(), "sweep lock busy, trusting winner");
                return;
            }
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "sweep lock failed");
                return;
            }
        };
        std::thread::sleep(retention);
        sweep_pass(dir, retention);
        drop(lock);
        if !dir.exists() {
            return;
        }
    }
}

pub(crate) fn sweep_all(root: &Path, retention: Duration) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        sweep_pass(&dir, retention);
        remove_if_long_idle(&dir);
    }
}

/// Delete every message file in `dir` older than the retention window.
/// Vanished files and permission refusals are races with other sweepers or
/// writers, not errors.
pub(crate) fn sweep_pass(dir: &Path, retention: Duration) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let cutoff = SystemTime::now() - retention;
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(MESSAGE_EXTENSION) {
            continue;
        }
        let modified = match entry.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if modified > cutoff {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err)
                if err.kind() == io::ErrorKind::NotFound
                    || err.kind() == io::ErrorKind::PermissionDenied => {}
            Err(err) => {
                trace!(path = %path.display(), error = %err, "sweep delete failed");
            }
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "swept expired messages");
    }
}

fn remove_if_long_idle(dir: &Path) {
    let mut only_sentinel = true;
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                if entry.file_name() != LOCK_FILE_NAME {
                    only_sentinel = false;
                    break;
                }
            }
        }
        Err(_) => return,
    }
    if !only_sentinel {
        return;
    }
    let idle = std::fs::metadata(dir)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
    if idle.is_some_and(|idle| idle > IDLE_DIRECTORY_MAX_AGE) {
        let _ = std::fs::remove_dir_all(dir);
    }
}

pub(crate) struct DirectoryLock {
    file: File,
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Race for the per-directory sweep lock. `Ok(None)` means another process
/// already holds it.
pub(crate) fn try_lock_directory(dir: &Path) -> Result<Option<DirectoryLock>, Error> {
    let lock_path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("failed to open sweep lock")
                .with_path(&lock_path)
                .with_source(err)
        })?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(DirectoryLock { file })),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(Error::new(lock_error_kind(&err))
            .with_message("failed to acquire sweep lock")
            .with_path(&lock_path)
            .with_source(err)),
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
