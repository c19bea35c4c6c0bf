//! Own/foster partitions of parents and children, and the structure summary.

use std::collections::HashMap;

use serde::Serialize;

use super::item::ProcessingIndexItem;
use crate::error::{GraphRepoError, Result};
use crate::rels::{classify_relation, RelationKind, RelationshipDocument};

/// A neighbour reached through one relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationRef {
    pub pid: String,
    pub relation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OwnedAndFosteredParents {
    pub own: Option<RelationRef>,
    pub foster: Vec<RelationRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OwnedAndFosteredChildren {
    pub own: Vec<RelationRef>,
    pub foster: Vec<RelationRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructureInfo {
    pub pid: String,
    pub model: Option<String>,
    pub parents: OwnedAndFosteredParents,
    pub children: OwnedAndFosteredChildren,
}

impl StructureInfo {
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn relation_of(item: &ProcessingIndexItem) -> Result<&str> {
    item.relation.as_deref().ok_or_else(|| {
        GraphRepoError::InvalidGraphState(format!("Relation record without relation: {}", item.key()))
    })
}

/// Split incoming relation records of `pid` into its own parent and foster parents.
pub fn partition_parents(pid: &str, items: &[ProcessingIndexItem]) -> Result<OwnedAndFosteredParents> {
    let mut parents = OwnedAndFosteredParents::default();
    for item in items {
        let relation = relation_of(item)?;
        let parent = RelationRef {
            pid: item.source.clone(),
            relation: relation.to_string(),
        };
        match classify_relation(relation)? {
            RelationKind::Own => {
                if let Some(existing) = &parents.own {
                    return Err(GraphRepoError::InvalidGraphState(format!(
                        "{} has more than one own parent: {} ({}) and {} ({})",
                        pid, existing.pid, existing.relation, parent.pid, parent.relation
                    )));
                }
                parents.own = Some(parent);
            }
            RelationKind::Foster => parents.foster.push(parent),
        }
    }
    Ok(parents)
}

/// Split outgoing relation records into own and foster children.
pub fn partition_children(items: &[ProcessingIndexItem]) -> Result<OwnedAndFosteredChildren> {
    let mut children = OwnedAndFosteredChildren::default();
    for item in items {
        let relation = relation_of(item)?;
        let Some(target) = item.target_pid.as_deref() else {
            continue;
        };
        let child = RelationRef {
            pid: target.to_string(),
            relation: relation.to_string(),
        };
        match classify_relation(relation)? {
            RelationKind::Own => children.own.push(child),
            RelationKind::Foster => children.foster.push(child),
        }
    }
    Ok(children)
}

fn reorder(pid: &str, refs: &mut Vec<RelationRef>, positions: &HashMap<(&str, &str), usize>) {
    refs.retain(|r| {
        let present = positions.contains_key(&(r.relation.as_str(), r.pid.as_str()));
        if !present {
            log::warn!(
                "Index lists {} -{}-> {} but the relationship document does not, dropping",
                pid, r.relation, r.pid
            );
        }
        present
    });
    refs.sort_by_key(|r| positions[&(r.relation.as_str(), r.pid.as_str())]);
}

/// Reorder children to the live document order, dropping stale index entries.
pub fn order_by_document(
    pid: &str,
    children: &mut OwnedAndFosteredChildren,
    doc: &RelationshipDocument,
) {
    let mut positions: HashMap<(&str, &str), usize> = HashMap::new();
    for (i, (relation, target)) in doc.structural_children().into_iter().enumerate() {
        positions.entry((relation, target)).or_insert(i);
    }
    reorder(pid, &mut children.own, &positions);
    reorder(pid, &mut children.foster, &positions);
}
