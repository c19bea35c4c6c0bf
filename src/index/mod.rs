//! Processing index: a derived, queryable projection of the relation graph.
//!
//! Every object contributes one description record (model and display title)
//! and one relation record per outgoing resource edge. Mutations are collected
//! in a caller-owned [`IndexBatch`] and only become visible after
//! [`ProcessingIndex::commit`].

mod item;
mod query;
mod structure;

pub use item::{format_date, parse_date, IndexField, ItemKind, ProcessingIndexItem};
pub use query::{
    FilterClause, IndexFilter, IndexQuery, IterationControl, IterationOutcome, PageRequest,
    CURSOR_START,
};
pub use structure::{
    order_by_document, partition_children, partition_parents, OwnedAndFosteredChildren,
    OwnedAndFosteredParents, RelationRef, StructureInfo,
};

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, params_from_iter, Transaction};
use tokio::task;

use crate::config::IndexConfig;
use crate::db::Db;
use crate::error::{GraphRepoError, Result};
use crate::graph::read_relationship_document;
use crate::pid::{is_valid_pid, validate_pid};
use crate::rels::{
    extract_triples, fold_resource_edges, mine_title, model_name, RelationshipDocument,
    TitleScan, HAS_MODEL,
};
use crate::store::ObjectStore;
use query::CursorMark;

#[derive(Debug, Clone)]
enum PendingOp {
    Upsert(ProcessingIndexItem),
    DeleteWhere(IndexFilter),
}

/// Uncommitted index mutations of one caller, applied in order by
/// [`ProcessingIndex::commit`].
#[derive(Debug, Default)]
#[must_use = "an index batch does nothing until committed"]
pub struct IndexBatch {
    ops: Vec<PendingOp>,
}

impl IndexBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Move every operation of `other` to the end of this batch.
    pub fn append(&mut self, mut other: IndexBatch) {
        self.ops.append(&mut other.ops);
    }

    /// Queue an upsert of an externally built record.
    pub fn feed(&mut self, item: ProcessingIndexItem) {
        self.ops.push(PendingOp::Upsert(item));
    }

    fn delete_where(&mut self, filter: IndexFilter) {
        log::debug!("Queue delete: {}", filter);
        self.ops.push(PendingOp::DeleteWhere(filter));
    }

    /// Every record whose source is `pid`.
    pub fn delete_by_pid(&mut self, pid: &str) {
        self.delete_where(IndexFilter::all().eq(IndexField::Source, pid));
    }

    /// Every relation record pointing at `pid`.
    pub fn delete_by_target_pid(&mut self, pid: &str) {
        self.delete_where(
            IndexFilter::all()
                .kind(ItemKind::Relation)
                .eq(IndexField::TargetPid, pid),
        );
    }

    pub fn delete_description_by_pid(&mut self, pid: &str) {
        self.delete_where(
            IndexFilter::all()
                .kind(ItemKind::Description)
                .eq(IndexField::Source, pid),
        );
    }

    /// Relation records whose source is `pid`; the description survives.
    pub fn delete_by_relations_for_pid(&mut self, pid: &str) {
        self.delete_where(
            IndexFilter::all()
                .kind(ItemKind::Relation)
                .eq(IndexField::Source, pid),
        );
    }
}

/// One fetched page plus the position after its last record.
struct Page {
    items: Vec<(ProcessingIndexItem, CursorMark)>,
    has_more: bool,
}

pub struct ProcessingIndex {
    db: Db,
    store: Arc<dyn ObjectStore>,
    config: IndexConfig,
}

fn mine_title_for(store: &dyn ObjectStore, pid: &str, datastream: &str) -> String {
    match store.datastream_content(pid, datastream) {
        Ok(Some(bytes)) => match mine_title(&String::from_utf8_lossy(&bytes)) {
            TitleScan::Malformed(e) => {
                log::warn!("Cannot read title of {} from {}: {}", pid, datastream, e);
                String::new()
            }
            scan => scan.into_title(),
        },
        Ok(None) => String::new(),
        Err(e) => {
            log::warn!("Cannot read {} of {}: {}", datastream, pid, e);
            String::new()
        }
    }
}

/// Records derived from the current relationship document of `pid`; none
/// when the document is missing or unparseable.
fn derive_items(store: &dyn ObjectStore, pid: &str, title_datastream: &str) -> Vec<ProcessingIndexItem> {
    let Some(mut doc) = read_relationship_document(store, pid) else {
        return Vec::new();
    };
    if doc.subject != pid {
        log::warn!("Relationship document of {} describes {}", pid, doc.subject);
        doc.subject = pid.to_string();
    }

    let now = Utc::now();
    let mut model: Option<String> = None;
    let triples = extract_triples(&doc, &mut |target: &str, relation: &str| -> Option<String> {
        if relation == HAS_MODEL {
            model = Some(model_name(target).to_string());
        }
        None
    });

    let mut items = Vec::new();
    if let Some(model) = model {
        let title = mine_title_for(store, pid, title_datastream);
        items.push(ProcessingIndexItem::description(pid, &model, &title, now));
    }
    for edge in fold_resource_edges(&triples) {
        if edge.relation == HAS_MODEL {
            continue;
        }
        items.push(ProcessingIndexItem::relation(pid, &edge.relation, &edge.target, now));
    }
    items
}

impl ProcessingIndex {
    pub fn new(db: Db, store: Arc<dyn ObjectStore>, config: IndexConfig) -> Self {
        Self { db, store, config }
    }

    /// Run a store read on the blocking pool.
    async fn read_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ObjectStore) -> T + Send + 'static,
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
            })
    }

    /// Queue into `batch` the replacement of every record sourced at `pid`
    /// with records derived from its current relationship document.
    ///
    /// A missing or unparseable document counts as "no edges". Returns the
    /// number of queued upserts.
    pub async fn rebuild(&self, batch: &mut IndexBatch, pid: &str) -> Result<usize> {
        validate_pid(pid)?;
        let owned = pid.to_string();
        let title_datastream = self.config.title_datastream.clone();
        let items = self
            .read_store(move |store| derive_items(store, &owned, &title_datastream))
            .await?;

        let count = items.len();
        batch.delete_by_pid(pid);
        batch.ops.extend(items.into_iter().map(PendingOp::Upsert));
        log::debug!("Queued {} index records for {}", count, pid);
        Ok(count)
    }

    /// Apply `batch` in one transaction. Returns the number of applied
    /// operations; on failure nothing of the batch is applied.
    pub async fn commit(&self, batch: IndexBatch) -> Result<usize> {
        let ops = batch.ops;
        if ops.is_empty() {
            return Ok(0);
        }
        let count = ops.len();
        let result = self
            .db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                for op in &ops {
                    match op {
                        PendingOp::Upsert(item) => upsert(&tx, item)?,
                        PendingOp::DeleteWhere(filter) => {
                            let (where_sql, params) = filter.to_sql();
                            tx.execute(
                                &format!("DELETE FROM processing_index WHERE {}", where_sql),
                                params_from_iter(params),
                            )?;
                        }
                    }
                }
                tx.commit()?;
                Ok(count)
            })
            .await;
        match &result {
            Ok(n) => log::debug!("Committed {} index operations", n),
            Err(e) => log::error!("Index commit of {} operations failed: {}", count, e),
        }
        result
    }

    async fn fetch_page(
        &self,
        query: &IndexQuery,
        after: Option<CursorMark>,
        offset: usize,
    ) -> Result<Page> {
        let query = query.clone();
        self.db
            .with_connection(move |conn| {
                let (sql, params) = query.page_sql(after.as_ref(), query.rows.saturating_add(1), offset);
                let mut stmt = conn.prepare(&sql)?;
                let mut items = stmt
                    .query_map(params_from_iter(params), |row| query.read_row(row))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let has_more = items.len() > query.rows;
                items.truncate(query.rows);
                Ok(Page { items, has_more })
            })
            .await
    }

    /// Run `query`, feeding every record to `callback` until it returns
    /// [`IterationControl::Stop`].
    ///
    /// Offset mode reads one page. Cursor mode keeps paging until the next
    /// cursor equals the current one, or after one page when
    /// `stop_after_cursor` is set.
    pub async fn iterate<F>(&self, query: &IndexQuery, mut callback: F) -> Result<IterationOutcome>
    where
        F: FnMut(&ProcessingIndexItem) -> IterationControl,
    {
        if query.rows == 0 {
            return Err(GraphRepoError::InvalidInput("rows must be positive".to_string()));
        }
        log::debug!("Index query: {}", query.filter);

        match &query.page {
            PageRequest::Offset(page_index) => {
                let offset = query.rows.saturating_mul(*page_index);
                let page = self.fetch_page(query, None, offset).await?;
                let mut visited = 0;
                for (item, _) in &page.items {
                    visited += 1;
                    if callback(item) == IterationControl::Stop {
                        return Ok(IterationOutcome {
                            visited,
                            next_cursor: None,
                            exhausted: false,
                        });
                    }
                }
                Ok(IterationOutcome {
                    visited,
                    next_cursor: None,
                    exhausted: !page.has_more,
                })
            }
            PageRequest::Cursor(mark) => {
                let mut current = mark.clone();
                let mut visited = 0;
                loop {
                    let page = self.fetch_page(query, CursorMark::decode(&current)?, 0).await?;
                    for (item, position) in &page.items {
                        visited += 1;
                        if callback(item) == IterationControl::Stop {
                            return Ok(IterationOutcome {
                                visited,
                                next_cursor: Some(position.encode()),
                                exhausted: false,
                            });
                        }
                    }
                    let next = match page.items.last() {
                        Some((_, position)) if page.has_more => position.encode(),
                        _ => current.clone(),
                    };
                    let exhausted = next == current;
                    if exhausted || query.stop_after_cursor {
                        return Ok(IterationOutcome {
                            visited,
                            next_cursor: Some(next),
                            exhausted,
                        });
                    }
                    current = next;
                }
            }
        }
    }

    /// Every record matching `filter`, sorted by `sort` then key.
    async fn collect(&self, filter: IndexFilter, sort: IndexField) -> Result<Vec<ProcessingIndexItem>> {
        let query = IndexQuery::new(filter)
            .sort(sort, true)
            .rows(self.config.default_rows)
            .cursor(CURSOR_START);
        let mut items = Vec::new();
        self.iterate(&query, |item| {
            items.push(item.clone());
            IterationControl::Continue
        })
        .await?;
        Ok(items)
    }

    /// Relation records pointing at `pid`.
    pub async fn get_parents(&self, pid: &str) -> Result<Vec<ProcessingIndexItem>> {
        self.collect(
            IndexFilter::all()
                .kind(ItemKind::Relation)
                .eq(IndexField::TargetPid, pid),
            IndexField::Key,
        )
        .await
    }

    pub async fn get_parents_by_relation(
        &self,
        relation: &str,
        pid: &str,
    ) -> Result<Vec<ProcessingIndexItem>> {
        self.collect(
            IndexFilter::all()
                .kind(ItemKind::Relation)
                .eq(IndexField::Relation, relation)
                .eq(IndexField::TargetPid, pid),
            IndexField::Key,
        )
        .await
    }

    /// Fails with `InvalidGraphState` on more than one own parent or an unknown relation.
    pub async fn get_owned_and_fostered_parents(&self, pid: &str) -> Result<OwnedAndFosteredParents> {
        let items = self.get_parents(pid).await?;
        partition_parents(pid, &items)
    }

    /// Relation records `pid -relation-> *` whose target is a valid PID.
    pub async fn get_children(&self, relation: &str, pid: &str) -> Result<Vec<ProcessingIndexItem>> {
        let items = self
            .collect(
                IndexFilter::all()
                    .kind(ItemKind::Relation)
                    .eq(IndexField::Source, pid)
                    .eq(IndexField::Relation, relation),
                IndexField::Key,
            )
            .await?;
        Ok(valid_targets(items))
    }

    pub async fn get_owned_and_fostered_children(&self, pid: &str) -> Result<OwnedAndFosteredChildren> {
        let items = self
            .collect(
                IndexFilter::all()
                    .kind(ItemKind::Relation)
                    .eq(IndexField::Source, pid),
                IndexField::Key,
            )
            .await?;
        partition_children(&valid_targets(items))
    }

    pub async fn get_model(&self, pid: &str) -> Result<Option<String>> {
        let query = IndexQuery::new(
            IndexFilter::all()
                .kind(ItemKind::Description)
                .eq(IndexField::Source, pid),
        )
        .rows(1)
        .fields(vec![IndexField::Model]);
        let mut model = None;
        self.iterate(&query, |item| {
            model = item.model.clone();
            IterationControl::Stop
        })
        .await?;
        Ok(model)
    }

    fn by_model_query(&self, model: &str, title_prefix: Option<&str>, rows: usize) -> IndexQuery {
        let mut filter = IndexFilter::all()
            .kind(ItemKind::Description)
            .eq(IndexField::Model, model);
        if let Some(prefix) = title_prefix.filter(|p| !p.is_empty()) {
            filter = filter.prefix(IndexField::Title, prefix);
        }
        IndexQuery::new(filter)
            .sort(IndexField::Title, true)
            .rows(rows)
    }

    /// Description records of `model` sorted by title, one offset page.
    pub async fn get_by_model(
        &self,
        model: &str,
        title_prefix: Option<&str>,
        rows: usize,
        page_index: usize,
    ) -> Result<Vec<ProcessingIndexItem>> {
        let query = self
            .by_model_query(model, title_prefix, rows)
            .page_index(page_index);
        let mut items = Vec::new();
        self.iterate(&query, |item| {
            items.push(item.clone());
            IterationControl::Continue
        })
        .await?;
        Ok(items)
    }

    /// One cursor page of description records of `model`; returns the next cursor.
    pub async fn get_by_model_with_cursor(
        &self,
        model: &str,
        title_prefix: Option<&str>,
        rows: usize,
        cursor: &str,
    ) -> Result<(Vec<ProcessingIndexItem>, String)> {
        let query = self
            .by_model_query(model, title_prefix, rows)
            .cursor(cursor)
            .stop_after_cursor(true);
        let mut items = Vec::new();
        let outcome = self
            .iterate(&query, |item| {
                items.push(item.clone());
                IterationControl::Continue
            })
            .await?;
        let next = outcome.next_cursor.unwrap_or_else(|| cursor.to_string());
        Ok((items, next))
    }

    /// Model, parents and children of `pid` in one summary. Children follow
    /// the order of the live relationship document when it is readable.
    pub async fn extract_structure_info(&self, pid: &str) -> Result<StructureInfo> {
        validate_pid(pid)?;
        let model = self.get_model(pid).await?;
        let parents = self.get_owned_and_fostered_parents(pid).await?;
        let mut children = self.get_owned_and_fostered_children(pid).await?;
        let owned = pid.to_string();
        let live = self
            .read_store(move |store| read_relationship_document(store, &owned))
            .await?;
        match live {
            Some(doc) => order_by_document(pid, &mut children, &doc),
            None => log::warn!("Keeping index order for children of {}", pid),
        }
        Ok(StructureInfo {
            pid: pid.to_string(),
            model,
            parents,
            children,
        })
    }
}

fn valid_targets(items: Vec<ProcessingIndexItem>) -> Vec<ProcessingIndexItem> {
    items
        .into_iter()
        .filter(|item| item.target_pid.as_deref().map(is_valid_pid).unwrap_or(false))
        .collect()
}

fn upsert(tx: &Transaction<'_>, item: &ProcessingIndexItem) -> Result<()> {
    let date = format_date(&item.date.unwrap_or_else(Utc::now));
    tx.execute(
        r#"
        INSERT INTO processing_index (
            item_key, item_type, source, relation, target_pid, model, title, ref, date
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(item_key) DO UPDATE SET
            item_type = excluded.item_type,
            source = excluded.source,
            relation = excluded.relation,
            target_pid = excluded.target_pid,
            model = excluded.model,
            title = excluded.title,
            ref = excluded.ref,
            date = excluded.date
        "#,
        params![
            item.key(),
            item.kind.as_str(),
            item.source,
            item.relation,
            item.target_pid,
            item.model,
            item.title,
            item.ref_,
            date,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::run_migrations;
    use crate::rels::{Edge, MODEL_NS, RELS_NS};
    use crate::store::{FsObjectStore, RELS_EXT};
    use std::path::Path;
    use tempfile::TempDir;

    const DC_BOOK: &str = r#"<oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title xml:lang="cze">Babička</dc:title></oai_dc:dc>"#;

    struct Fixture {
        _dir: TempDir,
        store: Arc<FsObjectStore>,
        index: ProcessingIndex,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Db::new(dir.path().join("index.db"));
        let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        db.with_connection(move |conn| run_migrations(conn, &migrations))
            .await
            .unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path().join("objects")));
        let index = ProcessingIndex::new(db, store.clone(), IndexConfig::default());
        Fixture { _dir: dir, store, index }
    }

    fn put_doc(store: &FsObjectStore, pid: &str, model: &str, edges: &[(&str, &str)]) {
        let mut doc = RelationshipDocument::new(pid);
        doc.add_edge(Edge::resource(MODEL_NS, HAS_MODEL, &format!("model:{}", model)));
        for (relation, target) in edges {
            doc.add_edge(Edge::resource(RELS_NS, relation, target));
        }
        store
            .put_datastream(pid, RELS_EXT, doc.to_xml().unwrap().as_bytes())
            .unwrap();
    }

    async fn count_rows(index: &ProcessingIndex) -> usize {
        let mut n = 0;
        index
            .iterate(&IndexQuery::new(IndexFilter::all()).cursor(CURSOR_START), |_| {
                n += 1;
                IterationControl::Continue
            })
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn test_end_to_end_monograph() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B")]);
        f.store.put_datastream("uuid:A", "DC", DC_BOOK.as_bytes()).unwrap();
        put_doc(&f.store, "uuid:B", "page", &[]);

        assert_eq!(f.index.rebuild(&mut batch, "uuid:A").await.unwrap(), 2);
        f.index.rebuild(&mut batch, "uuid:B").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        assert_eq!(f.index.get_model("uuid:A").await.unwrap().as_deref(), Some("monograph"));

        let children = f.index.get_owned_and_fostered_children("uuid:A").await.unwrap();
        assert_eq!(
            children.own,
            vec![RelationRef { pid: "uuid:B".to_string(), relation: "hasPage".to_string() }]
        );
        assert!(children.foster.is_empty());

        let parents = f.index.get_owned_and_fostered_parents("uuid:B").await.unwrap();
        assert_eq!(parents.own.as_ref().map(|p| p.pid.as_str()), Some("uuid:A"));

        let books = f.index.get_by_model("monograph", None, 10, 0).await.unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].title.as_deref(), Some("Babička"));
        assert_eq!(books[0].ref_.as_deref(), Some("info:fedora/uuid:A"));
    }

    #[tokio::test]
    async fn test_uncommitted_batch_is_invisible() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(f.index.get_model("uuid:A").await.unwrap(), None);

        assert_eq!(f.index.commit(std::mem::take(&mut batch)).await.unwrap(), 3);
        assert_eq!(batch.len(), 0);
        assert_eq!(f.index.commit(std::mem::take(&mut batch)).await.unwrap(), 0);
        assert!(f.index.get_model("uuid:A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_other_batches_intact() {
        let f = fixture().await;
        f.index
            .db
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_bad BEFORE INSERT ON processing_index
                     WHEN NEW.source = 'uuid:BAD'
                     BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B")]);

        let mut good = IndexBatch::new();
        f.index.rebuild(&mut good, "uuid:A").await.unwrap();
        let mut bad = IndexBatch::new();
        bad.feed(ProcessingIndexItem::relation("uuid:BAD", "hasPage", "uuid:C", Utc::now()));

        assert!(f.index.commit(bad).await.is_err());
        assert_eq!(f.index.commit(good).await.unwrap(), 3);
        assert_eq!(f.index.get_model("uuid:A").await.unwrap().as_deref(), Some("monograph"));
        assert!(f.index.get_parents("uuid:C").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_rows_and_page_do_not_overflow() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(batch).await.unwrap();

        let mut n = 0;
        let outcome = f
            .index
            .iterate(&IndexQuery::new(IndexFilter::all()).rows(usize::MAX), |_| {
                n += 1;
                IterationControl::Continue
            })
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert!(outcome.exhausted);

        let far = IndexQuery::new(IndexFilter::all()).rows(usize::MAX).page_index(usize::MAX);
        let outcome = f.index.iterate(&far, |_| IterationControl::Continue).await.unwrap();
        assert_eq!(outcome.visited, 0);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B"), ("hasPage", "uuid:C")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();
        let first = count_rows(&f.index).await;

        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();
        assert_eq!(count_rows(&f.index).await, first);
        assert_eq!(first, 3);
    }

    #[tokio::test]
    async fn test_rebuild_drops_removed_edges_and_missing_documents() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B"), ("hasPage", "uuid:C")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:C")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();
        assert!(f.index.get_parents("uuid:B").await.unwrap().is_empty());
        assert_eq!(f.index.get_parents("uuid:C").await.unwrap().len(), 1);

        f.store.remove("uuid:A").unwrap();
        assert_eq!(f.index.rebuild(&mut batch, "uuid:A").await.unwrap(), 0);
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();
        assert_eq!(count_rows(&f.index).await, 0);
    }

    #[tokio::test]
    async fn test_title_falls_back_to_empty_on_bad_metadata() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[]);
        f.store.put_datastream("uuid:A", "DC", b"<dc><title>broken</dc>").unwrap();
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        let books = f.index.get_by_model("monograph", None, 10, 0).await.unwrap();
        assert_eq!(books[0].title.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_two_own_parents_is_invalid_state() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:P")]);
        put_doc(&f.store, "uuid:B", "monograph", &[("hasPage", "uuid:P")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.rebuild(&mut batch, "uuid:B").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        assert_eq!(f.index.get_parents_by_relation("hasPage", "uuid:P").await.unwrap().len(), 2);
        let err = f.index.get_owned_and_fostered_parents("uuid:P").await.unwrap_err();
        assert!(matches!(err, GraphRepoError::InvalidGraphState(_)));
    }

    #[tokio::test]
    async fn test_children_exclude_invalid_targets() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        batch.feed(ProcessingIndexItem::relation("uuid:A", "hasPage", "not a pid", Utc::now()));
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        let pages = f.index.get_children("hasPage", "uuid:A").await.unwrap();
        assert_eq!(pages.len(), 1);
        let children = f.index.get_owned_and_fostered_children("uuid:A").await.unwrap();
        assert_eq!(children.own.len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_scan_terminates() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        let pages: Vec<String> = (0..7).map(|i| format!("uuid:P{}", i)).collect();
        let edges: Vec<(&str, &str)> = pages.iter().map(|p| ("hasPage", p.as_str())).collect();
        put_doc(&f.store, "uuid:A", "monograph", &edges);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        // 8 records, 3 per page: 3 calls to reach a stable cursor.
        let mut cursor = CURSOR_START.to_string();
        let mut seen = Vec::new();
        let mut calls = 0;
        loop {
            calls += 1;
            let query = IndexQuery::new(IndexFilter::all())
                .rows(3)
                .cursor(cursor.clone())
                .stop_after_cursor(true);
            let outcome = f
                .index
                .iterate(&query, |item| {
                    seen.push(item.key());
                    IterationControl::Continue
                })
                .await
                .unwrap();
            let next = outcome.next_cursor.unwrap();
            if next == cursor {
                assert!(outcome.exhausted);
                break;
            }
            cursor = next;
            assert!(calls < 10);
        }
        assert_eq!(calls, 3);
        assert_eq!(seen.len(), 8);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn test_cursor_iteration_stops_on_request() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B"), ("hasPage", "uuid:C")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        let query = IndexQuery::new(IndexFilter::all()).rows(1).cursor(CURSOR_START);
        let mut first = None;
        let outcome = f
            .index
            .iterate(&query, |item| {
                first = Some(item.key());
                IterationControl::Stop
            })
            .await
            .unwrap();
        assert_eq!(outcome.visited, 1);
        assert!(!outcome.exhausted);

        // Resuming continues after the stopped record.
        let resumed = IndexQuery::new(IndexFilter::all())
            .rows(10)
            .cursor(outcome.next_cursor.unwrap());
        let mut rest = Vec::new();
        f.index
            .iterate(&resumed, |item| {
                rest.push(item.key());
                IterationControl::Continue
            })
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(!rest.contains(&first.unwrap()));
    }

    #[tokio::test]
    async fn test_by_model_title_order_prefix_and_cursor() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        for (pid, title) in [("uuid:1", "Cecil"), ("uuid:2", "Alpha"), ("uuid:3", "Beta"), ("uuid:4", "Alpine")] {
            put_doc(&f.store, pid, "periodical", &[]);
            let dc = format!(
                r#"<oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>{}</dc:title></oai_dc:dc>"#,
                title
            );
            f.store.put_datastream(pid, "DC", dc.as_bytes()).unwrap();
            f.index.rebuild(&mut batch, pid).await.unwrap();
        }
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        let titles = |items: &[ProcessingIndexItem]| -> Vec<String> {
            items.iter().filter_map(|i| i.title.clone()).collect()
        };

        let all = f.index.get_by_model("periodical", None, 10, 0).await.unwrap();
        assert_eq!(titles(&all), vec!["Alpha", "Alpine", "Beta", "Cecil"]);

        let second_page = f.index.get_by_model("periodical", None, 2, 1).await.unwrap();
        assert_eq!(titles(&second_page), vec!["Beta", "Cecil"]);

        let alp = f.index.get_by_model("periodical", Some("Alp"), 10, 0).await.unwrap();
        assert_eq!(titles(&alp), vec!["Alpha", "Alpine"]);

        let (page1, next) = f
            .index
            .get_by_model_with_cursor("periodical", None, 3, CURSOR_START)
            .await
            .unwrap();
        assert_eq!(titles(&page1), vec!["Alpha", "Alpine", "Beta"]);
        let (page2, last) = f
            .index
            .get_by_model_with_cursor("periodical", None, 3, &next)
            .await
            .unwrap();
        assert_eq!(titles(&page2), vec!["Cecil"]);
        assert_eq!(last, next);
    }

    #[tokio::test]
    async fn test_role_scoped_deletes() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B")]);
        put_doc(&f.store, "uuid:B", "page", &[("isOnPage", "uuid:X")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.rebuild(&mut batch, "uuid:B").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();
        assert_eq!(count_rows(&f.index).await, 4);

        batch.delete_by_relations_for_pid("uuid:B");
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();
        assert_eq!(f.index.get_model("uuid:B").await.unwrap().as_deref(), Some("page"));
        assert_eq!(count_rows(&f.index).await, 3);

        batch.delete_by_target_pid("uuid:B");
        batch.delete_description_by_pid("uuid:B");
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();
        assert!(f.index.get_parents("uuid:B").await.unwrap().is_empty());
        assert_eq!(f.index.get_model("uuid:B").await.unwrap(), None);

        batch.delete_by_pid("uuid:A");
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();
        assert_eq!(count_rows(&f.index).await, 0);
    }

    #[tokio::test]
    async fn test_structure_info_follows_live_order() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:P1"), ("hasPage", "uuid:P2")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        // Live document changes without a reindex: order flips, P1 disappears.
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:P3"), ("hasPage", "uuid:P2")]);
        let info = f.index.extract_structure_info("uuid:A").await.unwrap();
        let own: Vec<_> = info.children.own.iter().map(|c| c.pid.as_str()).collect();
        assert_eq!(own, vec!["uuid:P2"]);
        assert_eq!(info.model.as_deref(), Some("monograph"));

        let json = info.to_json().unwrap();
        assert_eq!(json["pid"], "uuid:A");
        assert!(json["parents"]["own"].is_null());
    }

    #[tokio::test]
    async fn test_fields_to_fetch_leaves_others_empty() {
        let f = fixture().await;
        let mut batch = IndexBatch::new();
        put_doc(&f.store, "uuid:A", "monograph", &[("hasPage", "uuid:B")]);
        f.index.rebuild(&mut batch, "uuid:A").await.unwrap();
        f.index.commit(std::mem::take(&mut batch)).await.unwrap();

        let query = IndexQuery::new(IndexFilter::all().kind(ItemKind::Relation))
            .fields(vec![IndexField::TargetPid]);
        let mut items = Vec::new();
        f.index
            .iterate(&query, |item| {
                items.push(item.clone());
                IterationControl::Continue
            })
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].target_pid.as_deref(), Some("uuid:B"));
        assert_eq!(items[0].source, "uuid:A");
        assert_eq!(items[0].relation, None);
        assert_eq!(items[0].date, None);
    }

    #[tokio::test]
    async fn test_zero_rows_rejected() {
        let f = fixture().await;
        let query = IndexQuery::new(IndexFilter::all()).rows(0);
        let err = f
            .index
            .iterate(&query, |_| IterationControl::Continue)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphRepoError::InvalidInput(_)));
    }
}
