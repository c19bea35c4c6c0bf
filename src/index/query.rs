//! Filters, sorting and paging over the processing index.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rusqlite::Row;

use super::item::{parse_date, IndexField, ItemKind, ProcessingIndexItem};
use crate::error::{GraphRepoError, Result};
use crate::pid::escape_query_value;

/// Cursor mark that starts a scan from the beginning.
pub const CURSOR_START: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterClause {
    Equals(IndexField, String),
    Prefix(IndexField, String),
}

/// Conjunction of clauses. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFilter {
    clauses: Vec<FilterClause>,
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl IndexFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: IndexField, value: impl Into<String>) -> Self {
        self.clauses.push(FilterClause::Equals(field, value.into()));
        self
    }

    pub fn prefix(mut self, field: IndexField, value: impl Into<String>) -> Self {
        self.clauses.push(FilterClause::Prefix(field, value.into()));
        self
    }

    pub fn kind(self, kind: ItemKind) -> Self {
        self.eq(IndexField::Type, kind.as_str())
    }

    pub fn clauses(&self) -> &[FilterClause] {
        &self.clauses
    }

    /// WHERE clause body and its positional parameters.
    pub(crate) fn to_sql(&self) -> (String, Vec<String>) {
        if self.clauses.is_empty() {
            return ("1 = 1".to_string(), Vec::new());
        }
        let mut parts = Vec::with_capacity(self.clauses.len());
        let mut params = Vec::with_capacity(self.clauses.len());
        for clause in &self.clauses {
            match clause {
                FilterClause::Equals(field, value) => {
                    parts.push(format!("{} = ?", field.column()));
                    params.push(value.clone());
                }
                FilterClause::Prefix(field, value) => {
                    parts.push(format!("{} LIKE ? ESCAPE '\\'", field.column()));
                    params.push(format!("{}%", escape_like(value)));
                }
            }
        }
        (parts.join(" AND "), params)
    }
}

impl fmt::Display for IndexFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return f.write_str("*:*");
        }
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            match clause {
                FilterClause::Equals(field, value) => {
                    write!(f, "{}:{}", field.name(), escape_query_value(value))?
                }
                FilterClause::Prefix(field, value) => {
                    write!(f, "{}:{}*", field.name(), escape_query_value(value))?
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    /// Zero-based page number; skips `rows * page_index` records.
    Offset(usize),
    /// Cursor mark; [`CURSOR_START`] starts from the beginning.
    Cursor(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    pub filter: IndexFilter,
    pub sort: IndexField,
    pub ascending: bool,
    pub rows: usize,
    pub page: PageRequest,
    /// In cursor mode, return after one page with the next cursor.
    pub stop_after_cursor: bool,
    /// Optional fields to fetch; empty means all.
    pub fields: Vec<IndexField>,
}

impl IndexQuery {
    pub fn new(filter: IndexFilter) -> Self {
        Self {
            filter,
            sort: IndexField::Key,
            ascending: true,
            rows: 100,
            page: PageRequest::Offset(0),
            stop_after_cursor: false,
            fields: Vec::new(),
        }
    }

    pub fn sort(mut self, field: IndexField, ascending: bool) -> Self {
        self.sort = field;
        self.ascending = ascending;
        self
    }

    pub fn rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    pub fn page_index(mut self, page_index: usize) -> Self {
        self.page = PageRequest::Offset(page_index);
        self
    }

    pub fn cursor(mut self, mark: impl Into<String>) -> Self {
        self.page = PageRequest::Cursor(mark.into());
        self
    }

    pub fn stop_after_cursor(mut self, stop: bool) -> Self {
        self.stop_after_cursor = stop;
        self
    }

    pub fn fields(mut self, fields: Vec<IndexField>) -> Self {
        self.fields = fields;
        self
    }

    pub(crate) fn fetches(&self, field: IndexField) -> bool {
        field.always_fetched() || self.fields.is_empty() || self.fields.contains(&field)
    }

    fn direction(&self) -> &'static str {
        if self.ascending {
            "ASC"
        } else {
            "DESC"
        }
    }

    fn select_list(&self) -> String {
        let mut columns = vec![
            "item_key".to_string(),
            "item_type".to_string(),
            "source".to_string(),
        ];
        for field in [
            IndexField::Relation,
            IndexField::TargetPid,
            IndexField::Model,
            IndexField::Title,
            IndexField::Ref,
            IndexField::Date,
        ] {
            if self.fetches(field) {
                columns.push(field.column().to_string());
            }
        }
        columns.push(format!("COALESCE({}, '') AS sort_value", self.sort.column()));
        columns.join(", ")
    }

    /// SQL for one page. `after` positions a cursor scan past a mark.
    pub(crate) fn page_sql(
        &self,
        after: Option<&CursorMark>,
        limit: usize,
        offset: usize,
    ) -> (String, Vec<String>) {
        let (mut where_sql, mut params) = self.filter.to_sql();
        if let Some(mark) = after {
            let sort_col = format!("COALESCE({}, '')", self.sort.column());
            let cmp = if self.ascending { ">" } else { "<" };
            where_sql = format!(
                "({}) AND ({sc} {cmp} ? OR ({sc} = ? AND item_key {cmp} ?))",
                where_sql,
                sc = sort_col,
                cmp = cmp
            );
            params.push(mark.sort_value.clone());
            params.push(mark.sort_value.clone());
            params.push(mark.key.clone());
        }
        let limit = clamp_to_sql(limit);
        let offset = clamp_to_sql(offset);
        let dir = self.direction();
        let mut sql = format!(
            "SELECT {} FROM processing_index WHERE {} ORDER BY COALESCE({}, '') {}, item_key {} LIMIT {}",
            self.select_list(),
            where_sql,
            self.sort.column(),
            dir,
            dir,
            limit
        );
        if offset > 0 {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        (sql, params)
    }

    /// Map one result row; unfetched optional fields come back as `None`.
    pub(crate) fn read_row(&self, row: &Row<'_>) -> rusqlite::Result<(ProcessingIndexItem, CursorMark)> {
        let opt = |field: IndexField| -> rusqlite::Result<Option<String>> {
            if self.fetches(field) {
                row.get(field.column())
            } else {
                Ok(None)
            }
        };
        let kind: String = row.get("item_type")?;
        let kind = ItemKind::parse(&kind).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let date = match opt(IndexField::Date)? {
            Some(value) => Some(parse_date(&value).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })?),
            None => None,
        };
        let item = ProcessingIndexItem {
            kind,
            source: row.get("source")?,
            relation: opt(IndexField::Relation)?,
            target_pid: opt(IndexField::TargetPid)?,
            model: opt(IndexField::Model)?,
            title: opt(IndexField::Title)?,
            ref_: opt(IndexField::Ref)?,
            date,
        };
        let mark = CursorMark {
            sort_value: row.get("sort_value")?,
            key: row.get("item_key")?,
        };
        Ok((item, mark))
    }
}

/// SQLite takes LIMIT and OFFSET as signed 64-bit integers.
fn clamp_to_sql(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX).min(i64::MAX as u64)
}

/// Decoded cursor position: sort value and unique key of the last record seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CursorMark {
    pub sort_value: String,
    pub key: String,
}

impl CursorMark {
    pub fn encode(&self) -> String {
        let json = serde_json::json!([self.sort_value, self.key]).to_string();
        URL_SAFE_NO_PAD.encode(json.as_bytes())
    }

    /// `None` for [`CURSOR_START`].
    pub fn decode(mark: &str) -> Result<Option<Self>> {
        if mark == CURSOR_START {
            return Ok(None);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(mark)
            .map_err(|e| GraphRepoError::InvalidInput(format!("Bad cursor mark {}: {}", mark, e)))?;
        let (sort_value, key): (String, String) = serde_json::from_slice(&bytes)
            .map_err(|e| GraphRepoError::InvalidInput(format!("Bad cursor mark {}: {}", mark, e)))?;
        Ok(Some(Self { sort_value, key }))
    }
}

/// Returned by iteration callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationOutcome {
    pub visited: usize,
    /// Position to resume from (cursor mode only).
    pub next_cursor: Option<String>,
    /// True when no records remain past the returned position.
    pub exhausted: bool,
}
