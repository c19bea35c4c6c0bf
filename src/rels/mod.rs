//! Relationship documents (RELS-EXT) and the triples derived from them.
//!
//! Parsing is pure: nothing in this module touches the object store or the index.

mod document;
mod known;
mod title;
mod triples;

pub use document::{Edge, EdgeValue, RelationshipDocument};
pub use known::{
    classify_relation, is_ordered_relation, RelationKind, FOSTER_RELATIONS, HAS_MODEL,
    OWN_RELATIONS,
};
pub use title::{mine_title, TitleScan};
pub use triples::{
    extract_triples, fold_resource_edges, EdgeListener, RelationTriple, ResourceEdge,
    TripleTarget,
};

pub const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
/// Structural relations between objects (hasPage, isOnPage, ...).
pub const RELS_NS: &str = "http://www.nsdl.org/ontologies/relationships#";
pub const RELS_EXT_NS: &str = "info:fedora/fedora-system:def/relations-external#";
pub const MODEL_NS: &str = "info:fedora/fedora-system:def/model#";
pub const OWL_NS: &str = "http://www.w3.org/2002/07/owl#";
/// Ordered List Ontology, used for position literals of ordered relations.
pub const OLO_NS: &str = "http://purl.org/ontology/olo/core#";
pub const DC_NS: &str = "http://purl.org/dc/elements/1.1/";

/// Namespaces whose resource edges form the object graph walked by the traversal engine.
pub const STRUCTURAL_NAMESPACES: &[&str] = &[RELS_NS, RELS_EXT_NS];

/// Model PIDs carry this namespace: `model:monograph`.
const MODEL_PID_PREFIX: &str = "model:";

/// Model name for a `hasModel` target: `info:fedora/model:page` -> `page`.
pub fn model_name(target: &str) -> &str {
    let pid = crate::pid::strip_uri(target);
    pid.strip_prefix(MODEL_PID_PREFIX).unwrap_or(pid)
}

/// Text for an entity reference name: predefined (`amp`) or character (`#233`, `#xE9`).
pub(crate) fn resolve_entity(name: &str) -> Option<String> {
    if let Some(number) = name.strip_prefix('#') {
        let code = match number.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => number.parse().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    quick_xml::escape::resolve_predefined_entity(name).map(str::to_string)
}
