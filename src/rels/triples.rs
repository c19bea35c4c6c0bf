//! Relation triples derived from a relationship document.

use std::collections::HashMap;

use super::{is_ordered_relation, EdgeValue, RelationshipDocument, OLO_NS, OWL_NS};
use crate::pid::strip_uri;

const SAME_AS: &str = "sameAs";
const INDEX: &str = "index";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripleTarget {
    Resource(String),
    Literal(String),
}

/// `(source, namespace#local_name, target)`. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationTriple {
    pub source: String,
    pub namespace: String,
    pub local_name: String,
    pub target: TripleTarget,
}

/// Called once per resource edge with `(target_pid, relation)`.
///
/// Returning `Some` rewrites the edge target.
pub trait EdgeListener {
    fn on_resource_edge(&mut self, target: &str, relation: &str) -> Option<String>;
}

impl<F> EdgeListener for F
where
    F: FnMut(&str, &str) -> Option<String>,
{
    fn on_resource_edge(&mut self, target: &str, relation: &str) -> Option<String> {
        self(target, relation)
    }
}

/// Slot node standing for the `position`-th occurrence of `relation` under `source`.
fn slot_node(source: &str, relation: &str, position: usize) -> String {
    format!("{}/{}#{}", source, relation, position)
}

/// Flatten a document into triples.
///
/// Ordered relations are expanded into a back-reference to a slot node, a
/// `sameAs` from the slot to the real target and an `index` literal, so the
/// position of every sibling survives storage as an unordered set.
pub fn extract_triples(
    doc: &RelationshipDocument,
    listener: &mut dyn EdgeListener,
) -> Vec<RelationTriple> {
    let source = doc.subject.as_str();
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut triples = Vec::with_capacity(doc.edges.len());

    for edge in &doc.edges {
        let relation = edge.local_name.as_str();
        match &edge.value {
            EdgeValue::Resource(raw) => {
                let stripped = strip_uri(raw);
                let target = listener
                    .on_resource_edge(stripped, relation)
                    .unwrap_or_else(|| stripped.to_string());

                if is_ordered_relation(relation) {
                    let position = positions.entry(relation).or_insert(0);
                    let node = slot_node(source, relation, *position);
                    triples.push(RelationTriple {
                        source: source.to_string(),
                        namespace: edge.namespace.clone(),
                        local_name: relation.to_string(),
                        target: TripleTarget::Resource(node.clone()),
                    });
                    triples.push(RelationTriple {
                        source: node.clone(),
                        namespace: OWL_NS.to_string(),
                        local_name: SAME_AS.to_string(),
                        target: TripleTarget::Resource(target),
                    });
                    triples.push(RelationTriple {
                        source: node,
                        namespace: OLO_NS.to_string(),
                        local_name: INDEX.to_string(),
                        target: TripleTarget::Literal(position.to_string()),
                    });
                    *position += 1;
                } else {
                    triples.push(RelationTriple {
                        source: source.to_string(),
                        namespace: edge.namespace.clone(),
                        local_name: relation.to_string(),
                        target: TripleTarget::Resource(target),
                    });
                }
            }
            EdgeValue::Literal(text) => triples.push(RelationTriple {
                source: source.to_string(),
                namespace: edge.namespace.clone(),
                local_name: relation.to_string(),
                target: TripleTarget::Literal(text.clone()),
            }),
        }
    }

    triples
}

/// A resource edge reassembled from triples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEdge {
    pub namespace: String,
    pub relation: String,
    pub target: String,
    /// Position among siblings of the same relation, for ordered relations.
    pub position: Option<usize>,
}

/// Fold synthesized slot triples back into plain resource edges.
pub fn fold_resource_edges(triples: &[RelationTriple]) -> Vec<ResourceEdge> {
    let mut same_as: HashMap<&str, &str> = HashMap::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for t in triples {
        match (&t.target, t.namespace.as_str(), t.local_name.as_str()) {
            (TripleTarget::Resource(target), OWL_NS, SAME_AS) => {
                same_as.insert(t.source.as_str(), target.as_str());
            }
            (TripleTarget::Literal(n), OLO_NS, INDEX) => {
                if let Ok(n) = n.parse() {
                    index.insert(t.source.as_str(), n);
                }
            }
            _ => {}
        }
    }

    triples
        .iter()
        .filter(|t| !same_as.contains_key(t.source.as_str()) && !index.contains_key(t.source.as_str()))
        .filter_map(|t| match &t.target {
            TripleTarget::Resource(target) => {
                let (target, position) = match same_as.get(target.as_str()) {
                    Some(real) => (real.to_string(), index.get(target.as_str()).copied()),
                    None => (target.clone(), None),
                };
                Some(ResourceEdge {
                    namespace: t.namespace.clone(),
                    relation: t.local_name.clone(),
                    target,
                    position,
                })
            }
            TripleTarget::Literal(_) => None,
        })
        .collect()
}
