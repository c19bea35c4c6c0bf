//! Processors built on [`traverse`].

use super::traversal::{traverse, TreeNodeProcessor};
use crate::error::Result;
use crate::store::ObjectStore;

/// Finds the first node carrying a viewable datastream.
///
/// Only nodes deeper than the previously tested one are tested (plus the
/// root); reaching a node at the same or a shallower level ends the search.
struct FirstViewableFinder<'a> {
    store: &'a dyn ObjectStore,
    datastream: &'a str,
    previous_level: usize,
    found: Option<String>,
    done: bool,
}

impl TreeNodeProcessor for FirstViewableFinder<'_> {
    fn process(&mut self, pid: &str, level: usize) -> Result<()> {
        if level == 0 || level > self.previous_level {
            self.previous_level = level;
            if self.store.datastream_exists(pid, self.datastream)? {
                self.found = Some(pid.to_string());
                self.done = true;
            }
        } else {
            self.done = true;
        }
        Ok(())
    }

    fn should_break(&mut self, _pid: &str, _level: usize) -> bool {
        self.done
    }
}

/// First descendant of `pid` (or `pid` itself) with `datastream`, following
/// the leftmost structural path.
pub fn first_viewable_descendant(
    store: &dyn ObjectStore,
    pid: &str,
    datastream: &str,
) -> Result<Option<String>> {
    let mut finder = FirstViewableFinder {
        store,
        datastream,
        previous_level: 0,
        found: None,
        done: false,
    };
    traverse(store, pid, &mut finder)?;
    Ok(finder.found)
}

#[derive(Default)]
struct SubtreeCollector {
    pids: Vec<String>,
}

impl TreeNodeProcessor for SubtreeCollector {
    fn process(&mut self, pid: &str, _level: usize) -> Result<()> {
        self.pids.push(pid.to_string());
        Ok(())
    }
}

/// Every PID reachable from `pid` through structural edges, pre-order, each once.
pub fn subtree_pids(store: &dyn ObjectStore, pid: &str) -> Result<Vec<String>> {
    let mut collector = SubtreeCollector::default();
    traverse(store, pid, &mut collector)?;
    Ok(collector.pids)
}
