//! Object store watcher: reindex objects whose files change.
//!
//! A notify watcher over `objects_dir` feeds a debounce thread that turns file
//! events into PIDs; each PID is reindexed through the repository, which also
//! clears the records of objects that disappeared.

mod watcher;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::error::{GraphRepoError, Result};
use crate::locks::LockOwner;
use crate::repository::Repository;
use crate::store::FsObjectStore;

/// Distinct PIDs owning the given paths, in sorted order.
pub fn pids_for_paths(store: &FsObjectStore, paths: &[PathBuf]) -> BTreeSet<String> {
    paths
        .iter()
        .filter_map(|p| store.pid_for_path(p))
        .collect()
}

/// Reindex one changed object, logging the outcome.
pub async fn handle_object_change(repo: &Repository, owner: &LockOwner, pid: &str) -> Result<usize> {
    let start = std::time::Instant::now();
    let records = repo.reindex(owner, pid).await?;
    log::info!("watch: {} ({} records) in {:?}", pid, records, start.elapsed());
    Ok(records)
}

/// Run the watcher thread and reindex every PID it reports. Runs until the
/// watcher thread exits.
pub async fn run_watcher(repo: &Repository, objects_dir: &Path, debounce_ms: u64) -> Result<()> {
    let store = FsObjectStore::new(objects_dir);
    let (tx, rx) = mpsc::channel();
    let rx = Arc::new(Mutex::new(rx));

    std::thread::spawn(move || {
        if let Err(e) = watcher::run_watcher_thread(&store, debounce_ms, tx) {
            log::error!("watcher thread error: {}", e);
        }
    });

    let owner = LockOwner::new();
    loop {
        let rx_clone = rx.clone();
        let pid = tokio::task::spawn_blocking(move || {
            rx_clone
                .lock()
                .map_err(|_| GraphRepoError::Config("watcher channel poisoned".to_string()))?
                .recv()
                .map_err(|_| GraphRepoError::Config("watcher stopped".to_string()))
        })
        .await
        .map_err(|e| GraphRepoError::Config(format!("watcher task join: {}", e)))?;

        let pid = match pid {
            Ok(pid) => pid,
            Err(e) => {
                log::info!("{}", e);
                break;
            }
        };

        if let Err(e) = handle_object_change(repo, &owner, &pid).await {
            log::error!("watch reindex {}: {}", pid, e);
        }
    }
    Ok(())
}
