//! Depth-first traversal over live relationship documents.

use std::collections::HashSet;

use crate::error::Result;
use crate::rels::RelationshipDocument;
use crate::store::ObjectStore;

/// Callbacks driven by [`traverse`].
pub trait TreeNodeProcessor {
    /// Visit `pid` at depth `level` (the start node is level 0).
    fn process(&mut self, pid: &str, level: usize) -> Result<()>;

    /// Veto descending into `pid`, checked before it is visited.
    fn skip_branch(&mut self, _pid: &str, _level: usize) -> bool {
        false
    }

    /// Stop the whole walk after `pid` has been processed.
    fn should_break(&mut self, _pid: &str, _level: usize) -> bool {
        false
    }

    /// Called with the current path every time it grows or shrinks.
    fn on_stack_changed(&mut self, _stack: &[String]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalOutcome {
    /// Distinct nodes processed.
    pub visited: usize,
    /// Edges not followed because they lead back onto the current path.
    pub cycles: usize,
    /// False when `should_break` cut the walk short.
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Break,
}

/// Path from the start node, every node seen so far and the cycle counter,
/// threaded through the recursion.
#[derive(Debug, Default)]
struct TraversalContext {
    stack: Vec<String>,
    visited: HashSet<String>,
    cycles: usize,
}

impl TraversalContext {
    fn push(&mut self, pid: &str, processor: &mut dyn TreeNodeProcessor) {
        self.stack.push(pid.to_string());
        processor.on_stack_changed(&self.stack);
    }

    fn pop(&mut self, processor: &mut dyn TreeNodeProcessor) {
        self.stack.pop();
        processor.on_stack_changed(&self.stack);
    }

    fn on_path(&self, pid: &str) -> bool {
        self.stack.iter().any(|p| p == pid)
    }
}

/// Read and parse the relationship document of `pid`.
///
/// Missing, unreadable and unparseable documents are logged and yield `None`.
pub fn read_relationship_document(store: &dyn ObjectStore, pid: &str) -> Option<RelationshipDocument> {
    match store.relationship_document(pid) {
        Ok(Some(xml)) => match RelationshipDocument::parse(&xml) {
            Ok(doc) => Some(doc),
            Err(e) => {
                log::warn!("Cannot parse relationship document of {}: {}", pid, e);
                None
            }
        },
        Ok(None) => {
            log::warn!("No relationship document for {}", pid);
            None
        }
        Err(e) => {
            log::warn!("Cannot read relationship document of {}: {}", pid, e);
            None
        }
    }
}

fn visit(
    store: &dyn ObjectStore,
    pid: &str,
    level: usize,
    processor: &mut dyn TreeNodeProcessor,
    ctx: &mut TraversalContext,
) -> Result<Flow> {
    let doc = read_relationship_document(store, pid);

    ctx.visited.insert(pid.to_string());
    processor.process(pid, level)?;
    if processor.should_break(pid, level) {
        return Ok(Flow::Break);
    }

    let Some(doc) = doc else {
        return Ok(Flow::Continue);
    };

    for (relation, child) in doc.structural_children() {
        if ctx.on_path(child) {
            log::warn!(
                "Cyclic reference {} -{}-> {} (path: {})",
                pid,
                relation,
                child,
                ctx.stack.join(" > ")
            );
            ctx.cycles += 1;
            continue;
        }
        if ctx.visited.contains(child) {
            log::debug!("{} already visited, not following {} -{}->", child, pid, relation);
            continue;
        }
        if processor.skip_branch(child, level + 1) {
            continue;
        }
        ctx.push(child, processor);
        let flow = visit(store, child, level + 1, processor, ctx);
        ctx.pop(processor);
        if flow? == Flow::Break {
            return Ok(Flow::Break);
        }
    }
    Ok(Flow::Continue)
}

/// Walk the structural subtree of `start` depth-first, pre-order, following
/// edges in document order.
///
/// Every node is processed at most once: a child reached again through
/// another parent is skipped silently. A node whose document cannot be read
/// is a leaf. An edge back onto the current path is reported as a cycle and
/// skipped; siblings are still visited.
pub fn traverse(
    store: &dyn ObjectStore,
    start: &str,
    processor: &mut dyn TreeNodeProcessor,
) -> Result<TraversalOutcome> {
    let mut ctx = TraversalContext::default();
    ctx.push(start, processor);
    let flow = visit(store, start, 0, processor, &mut ctx);
    ctx.pop(processor);
    let flow = flow?;
    Ok(TraversalOutcome {
        visited: ctx.visited.len(),
        cycles: ctx.cycles,
        completed: flow == Flow::Continue,
    })
}
