//! Repository facade: the store, the processing index and the lock manager
//! behind one handle.
//!
//! Every mutation runs as write lock → store mutation → index update →
//! commit → release. A failed index update is logged and does not undo the
//! store mutation; the index stays stale until the object is reindexed.

use std::sync::Arc;

use serde::Serialize;
use tokio::task;

use crate::config::Config;
use crate::db::{migrate::run_migrations, Db};
use crate::error::{GraphRepoError, Result};
use crate::graph;
use crate::index::{IndexBatch, ProcessingIndex, StructureInfo};
use crate::locks::{LockManager, LockOwner};
use crate::pid::validate_pid;
use crate::rels::{Edge, RelationshipDocument};
use crate::store::{FsObjectStore, ObjectStore};

/// Counters returned by [`Repository::reindex_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub objects: usize,
    pub records: usize,
    pub failed: usize,
    pub commits: usize,
}

pub struct Repository {
    store: Arc<dyn ObjectStore>,
    index: ProcessingIndex,
    locks: LockManager,
    viewable_datastream: String,
    batch_size: usize,
}

impl Repository {
    /// Open the filesystem store and the shared database named in `config`,
    /// applying pending migrations.
    pub async fn open(config: &Config) -> Result<Self> {
        if let Some(parent) = config.db_path().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(config.objects_dir())?;

        let db = Db::new(config.db_path());
        let migrations_dir = config.migrations_dir().to_path_buf();
        let applied = db
            .with_connection(move |conn| run_migrations(conn, &migrations_dir))
            .await?;
        if applied > 0 {
            log::info!("Applied {} migrations to {}", applied, config.db_path().display());
        }

        let store = Arc::new(FsObjectStore::new(config.objects_dir()));
        Ok(Self::with_store(config, db, store))
    }

    /// Assemble a repository over an already migrated database and any store.
    pub fn with_store(config: &Config, db: Db, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            index: ProcessingIndex::new(db.clone(), store.clone(), config.index.clone()),
            locks: LockManager::sqlite(db, &config.locks),
            store,
            viewable_datastream: config.traversal.viewable_datastream.clone(),
            batch_size: config.index.batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn index(&self) -> &ProcessingIndex {
        &self.index
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Run a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ObjectStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| {
                GraphRepoError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("store task failed: {}", e),
                ))
            })?
    }

    /// Rebuild and commit index records for `pid`, logging failures.
    async fn refresh_index(&self, pid: &str) {
        let mut batch = IndexBatch::new();
        let result = match self.index.rebuild(&mut batch, pid).await {
            Ok(_) => self.index.commit(batch).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::error!("Index desync for {}: {}", pid, e);
        }
    }

    async fn load_document(&self, pid: &str) -> Result<RelationshipDocument> {
        let owned = pid.to_string();
        let xml = self
            .blocking(move |store| store.relationship_document(&owned))
            .await?
            .ok_or_else(|| GraphRepoError::ObjectNotFound(pid.to_string()))?;
        RelationshipDocument::parse(&xml)
    }

    async fn store_document(&self, pid: &str, xml: String) -> Result<()> {
        let owned = pid.to_string();
        self.blocking(move |store| store.replace_relationship_document(&owned, &xml))
            .await
    }

    /// Replace the relationship document of `pid` and reindex it.
    pub async fn set_relationship_document(&self, owner: &LockOwner, pid: &str, xml: &str) -> Result<()> {
        validate_pid(pid)?;
        let doc = RelationshipDocument::parse(xml)?;
        if doc.subject != pid {
            return Err(GraphRepoError::InvalidInput(format!(
                "Relationship document describes {}, not {}",
                doc.subject, pid
            )));
        }
        self.locks
            .with_write_lock(owner, pid, || async {
                self.store_document(pid, xml.to_string()).await?;
                self.refresh_index(pid).await;
                log::info!("Replaced relationship document of {}", pid);
                Ok(())
            })
            .await
    }

    /// Add `pid -relation-> target` unless present. Returns true if added.
    pub async fn add_relation(
        &self,
        owner: &LockOwner,
        pid: &str,
        namespace: &str,
        relation: &str,
        target: &str,
    ) -> Result<bool> {
        validate_pid(pid)?;
        validate_pid(target)?;
        self.locks
            .with_write_lock(owner, pid, || async {
                let mut doc = self.load_document(pid).await?;
                if !doc.add_edge(Edge::resource(namespace, relation, target)) {
                    return Ok(false);
                }
                self.store_document(pid, doc.to_xml()?).await?;
                self.refresh_index(pid).await;
                log::info!("Added {} -{}-> {}", pid, relation, target);
                Ok(true)
            })
            .await
    }

    /// Remove every `pid -relation-> target` edge. Returns how many were removed.
    pub async fn remove_relation(
        &self,
        owner: &LockOwner,
        pid: &str,
        relation: &str,
        target: &str,
    ) -> Result<usize> {
        validate_pid(pid)?;
        self.locks
            .with_write_lock(owner, pid, || async {
                let mut doc = self.load_document(pid).await?;
                let removed = doc.remove_edges(relation, target);
                if removed == 0 {
                    return Ok(0);
                }
                self.store_document(pid, doc.to_xml()?).await?;
                self.refresh_index(pid).await;
                log::info!("Removed {} x {} -{}-> {}", removed, pid, relation, target);
                Ok(removed)
            })
            .await
    }

    /// Remove `pid` from the store and its records from the index. Incoming
    /// relation records are dropped too unless `keep_incoming`.
    pub async fn delete_object(&self, owner: &LockOwner, pid: &str, keep_incoming: bool) -> Result<bool> {
        validate_pid(pid)?;
        self.locks
            .with_write_lock(owner, pid, || async {
                let owned = pid.to_string();
                let existed = self.blocking(move |store| store.remove(&owned)).await?;
                let mut batch = IndexBatch::new();
                batch.delete_by_pid(pid);
                if !keep_incoming {
                    batch.delete_by_target_pid(pid);
                }
                if let Err(e) = self.index.commit(batch).await {
                    log::error!("Index desync after deleting {}: {}", pid, e);
                }
                log::info!("Deleted {} (existed: {})", pid, existed);
                Ok(existed)
            })
            .await
    }

    /// Rebuild and commit the index records of `pid`. Returns the number of records.
    pub async fn reindex(&self, owner: &LockOwner, pid: &str) -> Result<usize> {
        validate_pid(pid)?;
        self.locks
            .with_read_lock(owner, pid, || async {
                let mut batch = IndexBatch::new();
                let records = self.index.rebuild(&mut batch, pid).await?;
                self.index.commit(batch).await?;
                Ok(records)
            })
            .await
    }

    /// Rebuild every stored object, committing once per `index.batch_size` objects.
    pub async fn reindex_all(&self, owner: &LockOwner) -> Result<ReindexReport> {
        let mut pids = self.blocking(|store| store.list_pids()).await?;
        pids.sort();
        log::info!("Reindexing {} objects", pids.len());

        let mut report = ReindexReport::default();
        let mut batch = IndexBatch::new();
        let mut in_batch = 0;
        for pid in &pids {
            let rebuilt = self
                .locks
                .with_read_lock(owner, pid, || async {
                    let mut rebuilt = IndexBatch::new();
                    let records = self.index.rebuild(&mut rebuilt, pid).await?;
                    Ok((records, rebuilt))
                })
                .await;
            match rebuilt {
                Ok((records, rebuilt)) => {
                    batch.append(rebuilt);
                    report.objects += 1;
                    report.records += records;
                    in_batch += 1;
                }
                Err(e) => {
                    log::warn!("Skipping {}: {}", pid, e);
                    report.failed += 1;
                }
            }
            if in_batch >= self.batch_size {
                self.index.commit(std::mem::take(&mut batch)).await?;
                report.commits += 1;
                in_batch = 0;
            }
        }
        if !batch.is_empty() {
            self.index.commit(batch).await?;
            report.commits += 1;
        }

        log::info!(
            "Reindexed {} objects ({} records, {} failed, {} commits)",
            report.objects,
            report.records,
            report.failed,
            report.commits
        );
        Ok(report)
    }

    pub async fn relationship_document(&self, owner: &LockOwner, pid: &str) -> Result<Option<String>> {
        validate_pid(pid)?;
        self.locks
            .with_read_lock(owner, pid, || async {
                let owned = pid.to_string();
                self.blocking(move |store| store.relationship_document(&owned)).await
            })
            .await
    }

    pub async fn structure_info(&self, owner: &LockOwner, pid: &str) -> Result<StructureInfo> {
        validate_pid(pid)?;
        self.locks
            .with_read_lock(owner, pid, || async { self.index.extract_structure_info(pid).await })
            .await
    }

    pub async fn first_viewable_descendant(&self, owner: &LockOwner, pid: &str) -> Result<Option<String>> {
        validate_pid(pid)?;
        self.locks
            .with_read_lock(owner, pid, || async {
                let (owned, datastream) = (pid.to_string(), self.viewable_datastream.clone());
                self.blocking(move |store| graph::first_viewable_descendant(store, &owned, &datastream))
                    .await
            })
            .await
    }

    pub async fn subtree_pids(&self, owner: &LockOwner, pid: &str) -> Result<Vec<String>> {
        validate_pid(pid)?;
        self.locks
            .with_read_lock(owner, pid, || async {
                let owned = pid.to_string();
                self.blocking(move |store| graph::subtree_pids(store, &owned)).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, LockConfig, RepositoryConfig, TraversalConfig};
    use crate::locks::LockMode;
    use crate::rels::{HAS_MODEL, MODEL_NS, RELS_NS};
    use crate::store::RELS_EXT;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> Config {
        Config {
            repository: RepositoryConfig {
                objects_dir: dir.join("objects"),
                db_path: dir.join("data").join("repo.db"),
                migrations_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
                log_level: "debug".to_string(),
            },
            locks: LockConfig {
                timeout_ms: 200,
                poll_interval_ms: 10,
                lease_secs: 300,
            },
            index: IndexConfig {
                batch_size: 2,
                ..IndexConfig::default()
            },
            traversal: TraversalConfig::default(),
        }
    }

    fn document(pid: &str, model: &str, edges: &[(&str, &str)]) -> String {
        let mut doc = RelationshipDocument::new(pid);
        doc.add_edge(Edge::resource(MODEL_NS, HAS_MODEL, &format!("model:{}", model)));
        for (relation, target) in edges {
            doc.add_edge(Edge::resource(RELS_NS, relation, target));
        }
        doc.to_xml().unwrap()
    }

    async fn open(dir: &TempDir) -> Repository {
        Repository::open(&test_config(dir.path())).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_document_updates_index() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).await;
        let owner = LockOwner::new();

        repo.set_relationship_document(&owner, "uuid:A", &document("uuid:A", "monograph", &[("hasPage", "uuid:B")]))
            .await
            .unwrap();
        repo.set_relationship_document(&owner, "uuid:B", &document("uuid:B", "page", &[]))
            .await
            .unwrap();

        let info = repo.structure_info(&owner, "uuid:A").await.unwrap();
        assert_eq!(info.model.as_deref(), Some("monograph"));
        assert_eq!(info.children.own.len(), 1);
        assert_eq!(info.children.own[0].pid, "uuid:B");

        let parents = repo.index().get_owned_and_fostered_parents("uuid:B").await.unwrap();
        assert_eq!(parents.own.unwrap().pid, "uuid:A");
    }

    #[tokio::test]
    async fn test_set_document_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).await;
        let owner = LockOwner::new();

        let err = repo
            .set_relationship_document(&owner, "uuid:A", &document("uuid:OTHER", "page", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphRepoError::InvalidInput(_)));

        let err = repo
            .set_relationship_document(&owner, "uuid:A", "<rdf:RDF")
            .await
            .unwrap_err();
        assert!(matches!(err, GraphRepoError::Parse(_)));

        let err = repo.reindex(&owner, "no-colon").await.unwrap_err();
        assert!(matches!(err, GraphRepoError::InvalidPid(_)));
    }

    #[tokio::test]
    async fn test_add_and_remove_relation() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).await;
        let owner = LockOwner::new();
        repo.set_relationship_document(&owner, "uuid:A", &document("uuid:A", "monograph", &[]))
            .await
            .unwrap();

        assert!(repo.add_relation(&owner, "uuid:A", RELS_NS, "hasPage", "uuid:P1").await.unwrap());
        assert!(!repo.add_relation(&owner, "uuid:A", RELS_NS, "hasPage", "uuid:P1").await.unwrap());
        assert!(repo.add_relation(&owner, "uuid:A", RELS_NS, "hasPage", "uuid:P2").await.unwrap());

        let children = repo.index().get_children("hasPage", "uuid:A").await.unwrap();
        assert_eq!(children.len(), 2);
        let xml = repo.relationship_document(&owner, "uuid:A").await.unwrap().unwrap();
        assert!(xml.contains("info:fedora/uuid:P2"));

        assert_eq!(repo.remove_relation(&owner, "uuid:A", "hasPage", "uuid:P1").await.unwrap(), 1);
        assert_eq!(repo.remove_relation(&owner, "uuid:A", "hasPage", "uuid:P1").await.unwrap(), 0);
        let children = repo.index().get_children("hasPage", "uuid:A").await.unwrap();
        assert_eq!(children.len(), 1);

        let err = repo
            .add_relation(&owner, "uuid:MISSING", RELS_NS, "hasPage", "uuid:P1")
            .await
            .unwrap_err();
        assert!(matches!(err, GraphRepoError::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_object_with_and_without_incoming() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).await;
        let owner = LockOwner::new();
        repo.set_relationship_document(&owner, "uuid:A", &document("uuid:A", "monograph", &[("hasPage", "uuid:B"), ("hasPage", "uuid:C")]))
            .await
            .unwrap();
        repo.set_relationship_document(&owner, "uuid:B", &document("uuid:B", "page", &[]))
            .await
            .unwrap();
        repo.set_relationship_document(&owner, "uuid:C", &document("uuid:C", "page", &[]))
            .await
            .unwrap();

        assert!(repo.delete_object(&owner, "uuid:B", true).await.unwrap());
        assert_eq!(repo.index().get_model("uuid:B").await.unwrap(), None);
        assert_eq!(repo.index().get_parents("uuid:B").await.unwrap().len(), 1);

        assert!(repo.delete_object(&owner, "uuid:C", false).await.unwrap());
        assert!(repo.index().get_parents("uuid:C").await.unwrap().is_empty());
        assert!(!repo.store().exists("uuid:C").unwrap());

        assert!(!repo.delete_object(&owner, "uuid:C", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_reindex_all_commits_in_batches() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let repo = Repository::open(&config).await.unwrap();
        let store = FsObjectStore::new(config.objects_dir());
        for (pid, edges) in [
            ("uuid:A", vec![("hasPage", "uuid:B")]),
            ("uuid:B", vec![]),
            ("uuid:C", vec![]),
        ] {
            store
                .put_datastream(pid, RELS_EXT, document(pid, "page", &edges).as_bytes())
                .unwrap();
        }
        // An object directory with a broken document still gets its old records dropped.
        store.put_datastream("uuid:D", RELS_EXT, b"<broken").unwrap();

        let owner = LockOwner::new();
        let report = repo.reindex_all(&owner).await.unwrap();
        assert_eq!(report.objects, 4);
        assert_eq!(report.records, 4);
        assert_eq!(report.failed, 0);
        assert_eq!(report.commits, 2);
        assert_eq!(repo.index().get_parents("uuid:B").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reindex_all_counts_locked_objects_as_failed() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let repo = Repository::open(&config).await.unwrap();
        let store = FsObjectStore::new(config.objects_dir());
        store.put_datastream("uuid:A", RELS_EXT, document("uuid:A", "page", &[]).as_bytes()).unwrap();
        store.put_datastream("uuid:B", RELS_EXT, document("uuid:B", "page", &[]).as_bytes()).unwrap();

        let writer = LockOwner::new();
        let held = repo.locks().acquire(&writer, "uuid:A", LockMode::Write).await.unwrap();
        let report = repo.reindex_all(&LockOwner::new()).await.unwrap();
        repo.locks().release(held).await.unwrap();

        assert_eq!(report.objects, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(repo.index().get_model("uuid:A").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mutation_times_out_while_object_is_locked() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).await;
        let holder = LockOwner::new();
        let held = repo.locks().acquire(&holder, "uuid:A", LockMode::Read).await.unwrap();

        let err = repo
            .set_relationship_document(&LockOwner::new(), "uuid:A", &document("uuid:A", "page", &[]))
            .await
            .unwrap_err();
        assert!(err.is_lock_timeout());

        // The holder itself can still write: locks are reentrant per owner.
        repo.set_relationship_document(&holder, "uuid:A", &document("uuid:A", "page", &[]))
            .await
            .unwrap();
        repo.locks().release(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_traversal_operations() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let repo = Repository::open(&config).await.unwrap();
        let owner = LockOwner::new();
        repo.set_relationship_document(&owner, "uuid:R", &document("uuid:R", "monograph", &[("hasPage", "uuid:P1"), ("hasPage", "uuid:P2")]))
            .await
            .unwrap();
        repo.set_relationship_document(&owner, "uuid:P1", &document("uuid:P1", "page", &[]))
            .await
            .unwrap();
        FsObjectStore::new(config.objects_dir())
            .put_datastream("uuid:P1", "IMG_FULL", b"jpeg")
            .unwrap();

        assert_eq!(
            repo.first_viewable_descendant(&owner, "uuid:R").await.unwrap().as_deref(),
            Some("uuid:P1")
        );
        assert_eq!(
            repo.subtree_pids(&owner, "uuid:R").await.unwrap(),
            vec!["uuid:R", "uuid:P1", "uuid:P2"]
        );
    }
}
