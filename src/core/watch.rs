//! Purpose: Detect new message files in a channel directory and dispatch them.
//! Exports: `DirWatcher`.
//! Role: Notification primitive behind a pipe's published state.
//! Invariants: Each file produces at most one callback per watcher; files
//! present before the watch began are never replayed.
//! Invariants: Callbacks run on a dedicated worker, never on the scanner, so
//! a slow handler cannot stall detection of later messages.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tracing::trace;

use crate::core::transport::MESSAGE_EXTENSION;

/// A polling watch over one directory. Dropping the handle stops both
/// threads; in-flight callbacks finish, queued paths are discarded.
pub(crate) struct DirWatcher {
    stop: Arc<AtomicBool>,
}

impl DirWatcher {
    pub(crate) fn spawn(
        dir: PathBuf,
        poll_interval: Duration,
        callback: impl Fn(PathBuf) + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<PathBuf>();

        // Snapshot what already exists before returning, so anything written
        // after this call is guaranteed to be treated as a new arrival.
        let mut seen = list_messages(&dir);
        trace!(dir = %dir.display(), existing = seen.len(), "watch started");

        let scanner_stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !scanner_stop.load(Ordering::Relaxed) {
                std::thread::sleep(poll_interval);
                let present = list_messages(&dir);
                for name in &present {
                    if seen.insert(name.clone()) && tx.send(dir.join(name)).is_err() {
                        return;
                    }
                }
                // Swept files will never reappear under the same random name.
                seen.retain(|name| present.contains(name));
            }
        });

        let worker_stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            for path in rx {
                if worker_stop.load(Ordering::Relaxed) {
                    return;
                }
                callback(path);
            }
        });

        Self { stop }
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn list_messages(dir: &std::path::Path) -> HashSet<OsString> {
    let mut names = HashSet::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        // The directory may be mid-recreation; the next scan picks it up.
        return names;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if PathBuf::from(&name).extension().and_then(|e| e.to_str()) == Some(MESSAGE_EXTENSION) {
            names.insert(name);
        }
    }
    names
}
