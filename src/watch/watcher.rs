//! Watcher thread: notify + debounce, send changed PIDs to main.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use notify::{RecursiveMode, Watcher};

use super::pids_for_paths;
use crate::error::{GraphRepoError, Result};
use crate::store::FsObjectStore;

/// Watch the store root and send each changed PID over `tx` once it has been
/// quiet for `debounce_ms`. Returns when the receiver is dropped or the
/// watcher fails.
pub fn run_watcher_thread(store: &FsObjectStore, debounce_ms: u64, tx: mpsc::Sender<String>) -> Result<()> {
    let root: PathBuf = store.root().to_path_buf();
    let debounce = Duration::from_millis(debounce_ms);

    let (event_tx, event_rx) = mpsc::channel::<Vec<PathBuf>>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(ev) => {
                let _ = event_tx.send(ev.paths);
            }
            Err(e) => log::warn!("watch event error: {}", e),
        }
    })
    .map_err(|e| GraphRepoError::Config(e.to_string()))?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| GraphRepoError::Config(e.to_string()))?;

    let mut pending: HashMap<String, Instant> = HashMap::new();

    loop {
        match event_rx.recv_timeout(debounce) {
            Ok(paths) => {
                let now = Instant::now();
                for pid in pids_for_paths(store, &paths) {
                    pending.insert(pid, now);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                let ready: Vec<_> = pending
                    .iter()
                    .filter(|(_, t)| now.duration_since(**t) >= debounce)
                    .map(|(pid, _)| pid.clone())
                    .collect();
                for pid in &ready {
                    pending.remove(pid);
                }
                for pid in ready {
                    if tx.send(pid).is_err() {
                        return Ok(());
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}
