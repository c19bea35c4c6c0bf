use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Serialize;

use crate::error::{GraphRepoError, Result};

/// Relation pointing at an object's model; never stored as a relation record.
pub const HAS_MODEL: &str = "hasModel";

/// Structural relations: a target has at most one incoming own edge.
pub const OWN_RELATIONS: &[&str] = &[
    "hasPage",
    "hasVolume",
    "hasItem",
    "hasUnit",
    "hasSoundUnit",
    "hasTrack",
    "hasIntCompPart",
    "containsTrack",
];

/// Associative relations: any number of foster parents.
pub const FOSTER_RELATIONS: &[&str] = &["isOnPage", "contains"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Own,
    Foster,
}

fn relation_table() -> &'static HashMap<&'static str, RelationKind> {
    static TABLE: OnceLock<HashMap<&'static str, RelationKind>> = OnceLock::new();
    TABLE.get_or_init(|| {
        OWN_RELATIONS
            .iter()
            .map(|r| (*r, RelationKind::Own))
            .chain(FOSTER_RELATIONS.iter().map(|r| (*r, RelationKind::Foster)))
            .collect()
    })
}

/// Own/foster classification of a relation name.
///
/// Unknown names are an error: guessing would corrupt subtree ownership.
pub fn classify_relation(relation: &str) -> Result<RelationKind> {
    relation_table().get(relation).copied().ok_or_else(|| {
        GraphRepoError::InvalidGraphState(format!("Unknown relation: {}", relation))
    })
}

/// Relations whose sibling order must survive indexing.
pub fn is_ordered_relation(relation: &str) -> bool {
    matches!(relation_table().get(relation), Some(RelationKind::Own))
}
