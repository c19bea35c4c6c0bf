//! Object/datastream store consumed by the index, the traversal engine and the
//! repository facade.
//!
//! The store is an external collaborator: this crate only needs point reads of
//! datastreams and replacement of the relationship document. [`FsObjectStore`]
//! is the bundled filesystem implementation.

mod fs;

pub use fs::{decode_pid, encode_pid, FsObjectStore};

use crate::error::Result;

/// Datastream holding the relationship document.
pub const RELS_EXT: &str = "RELS-EXT";

/// Read/write access to stored objects.
///
/// Implementations must be safe to share between threads; callers serialize
/// access to a single object through the lock manager.
pub trait ObjectStore: Send + Sync {
    /// True if the object exists.
    fn exists(&self, pid: &str) -> Result<bool>;

    /// Raw bytes of a datastream, `None` if the object or datastream is absent.
    fn datastream_content(&self, pid: &str, datastream_id: &str) -> Result<Option<Vec<u8>>>;

    fn datastream_exists(&self, pid: &str, datastream_id: &str) -> Result<bool>;

    /// Overwrite the relationship document, creating the object if needed.
    fn replace_relationship_document(&self, pid: &str, xml: &str) -> Result<()>;

    /// Remove the object and all of its datastreams. Returns false if it did not exist.
    fn remove(&self, pid: &str) -> Result<bool>;

    /// Every stored PID, in no particular order.
    fn list_pids(&self) -> Result<Vec<String>>;

    /// The relationship document as text, `None` if absent.
    fn relationship_document(&self, pid: &str) -> Result<Option<String>> {
        match self.datastream_content(pid, RELS_EXT)? {
            Some(bytes) => String::from_utf8(bytes).map(Some).map_err(|e| {
                crate::error::GraphRepoError::Parse(format!(
                    "{} of {} is not UTF-8: {}",
                    RELS_EXT, pid, e
                ))
            }),
            None => Ok(None),
        }
    }
}
