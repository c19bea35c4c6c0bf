//! Graph traversal over the live relation graph.
//!
//! Walks relationship documents read straight from the object store, so the
//! results do not depend on the processing index being current.

mod processors;
mod traversal;

pub use processors::{first_viewable_descendant, subtree_pids};
pub use traversal::{read_relationship_document, traverse, TraversalOutcome, TreeNodeProcessor};
