//! Filesystem object store: `<root>/<encoded pid>/<DATASTREAM_ID>`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{ObjectStore, RELS_EXT};
use crate::error::{GraphRepoError, Result};
use crate::pid::validate_pid;

/// Object store keeping each datastream as a plain file.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

/// Directory name for a PID. `%`, `:` and `/` are percent-encoded.
pub fn encode_pid(pid: &str) -> String {
    pid.replace('%', "%25").replace(':', "%3A").replace('/', "%2F")
}

pub fn decode_pid(dir_name: &str) -> String {
    dir_name.replace("%3A", ":").replace("%2F", "/").replace("%25", "%")
}

fn validate_datastream_id(datastream_id: &str) -> Result<()> {
    let ok = !datastream_id.is_empty()
        && datastream_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && datastream_id != "."
        && datastream_id != "..";
    if ok {
        Ok(())
    } else {
        Err(GraphRepoError::InvalidInput(format!(
            "Invalid datastream id: {}",
            datastream_id
        )))
    }
}

impl FsObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the datastreams of `pid`.
    pub fn object_dir(&self, pid: &str) -> PathBuf {
        self.root.join(encode_pid(pid))
    }

    /// PID owning a path inside the store, if any.
    pub fn pid_for_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let first = relative.components().next()?;
        let name = first.as_os_str().to_str()?;
        let pid = decode_pid(name);
        validate_pid(&pid).ok()?;
        Some(pid)
    }

    /// Write an arbitrary datastream, creating the object directory if needed.
    pub fn put_datastream(&self, pid: &str, datastream_id: &str, content: &[u8]) -> Result<()> {
        validate_pid(pid)?;
        validate_datastream_id(datastream_id)?;
        let dir = self.object_dir(pid);
        fs::create_dir_all(&dir)?;
        // Write-then-rename so a concurrent reader never sees a half-written file.
        let tmp = dir.join(format!(".{}.tmp", datastream_id));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, dir.join(datastream_id))?;
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn exists(&self, pid: &str) -> Result<bool> {
        Ok(self.object_dir(pid).is_dir())
    }

    fn datastream_content(&self, pid: &str, datastream_id: &str) -> Result<Option<Vec<u8>>> {
        validate_datastream_id(datastream_id)?;
        match fs::read(self.object_dir(pid).join(datastream_id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GraphRepoError::Io(e)),
        }
    }

    fn datastream_exists(&self, pid: &str, datastream_id: &str) -> Result<bool> {
        validate_datastream_id(datastream_id)?;
        Ok(self.object_dir(pid).join(datastream_id).is_file())
    }

    fn replace_relationship_document(&self, pid: &str, xml: &str) -> Result<()> {
        self.put_datastream(pid, RELS_EXT, xml.as_bytes())
    }

    fn remove(&self, pid: &str) -> Result<bool> {
        match fs::remove_dir_all(self.object_dir(pid)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GraphRepoError::Io(e)),
        }
    }

    fn list_pids(&self) -> Result<Vec<String>> {
        let mut pids = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| GraphRepoError::Io(e.into()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                log::warn!("Skipping non UTF-8 object directory {}", entry.path().display());
                continue;
            };
            let pid = decode_pid(name);
            if validate_pid(&pid).is_ok() {
                pids.push(pid);
            } else {
                log::warn!("Skipping directory that is not an object: {}", entry.path().display());
            }
        }
        Ok(pids)
    }
}
