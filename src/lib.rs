pub mod config;
pub mod error;
pub mod db;
pub mod pid;
pub mod rels;
pub mod store;
pub mod index;
pub mod graph;
pub mod locks;
pub mod repository;
pub mod watch;

pub use config::Config;
pub use error::{GraphRepoError, Result};
pub use index::ProcessingIndex;
pub use locks::{LockManager, LockMode, LockOwner};
pub use repository::{ReindexReport, Repository};
