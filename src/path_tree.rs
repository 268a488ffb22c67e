//! Directory-count tree over session working directories.
//!
//! Every node carries the number of sessions at or below it. The tree can be
//! rebuilt from a flat `{path: count}` map, or patched in place with signed
//! per-path deltas when only a few sessions changed.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathTreeNode {
    pub segment: String,
    /// Sessions at this path plus all descendants.
    pub count: u64,
    pub children: BTreeMap<String, PathTreeNode>,
}

impl PathTreeNode {
    fn named(segment: &str) -> Self {
        Self {
            segment: segment.to_string(),
            ..Default::default()
        }
    }

    fn add(&mut self, segments: &[&str], count: u64) {
        self.count += count;
        if let Some((first, rest)) = segments.split_first() {
            self.children
                .entry((*first).to_string())
                .or_insert_with(|| PathTreeNode::named(first))
                .add(rest, count);
        }
    }

    /// Apply `delta` along `segments`. Caller guarantees no count goes negative.
    fn patch(&mut self, segments: &[&str], delta: i64) {
        self.count = self.count.saturating_add_signed(delta);
        if let Some((first, rest)) = segments.split_first() {
            let child = self
                .children
                .entry((*first).to_string())
                .or_insert_with(|| PathTreeNode::named(first));
            child.patch(rest, delta);
            if child.count == 0 {
                self.children.remove(*first);
            }
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// How the last update was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Patched,
    Rebuilt,
}

#[derive(Debug, Clone, Default)]
pub struct PathTree {
    root: PathTreeNode,
    flat: BTreeMap<String, u64>,
}

impl PathTree {
    pub fn from_flat(flat: BTreeMap<String, u64>) -> Self {
        let mut tree = Self::default();
        tree.rebuild(flat);
        tree
    }

    pub fn rebuild(&mut self, flat: BTreeMap<String, u64>) {
        let mut root = PathTreeNode::default();
        let flat: BTreeMap<String, u64> = flat.into_iter().filter(|(_, c)| *c > 0).collect();
        for (path, count) in &flat {
            root.add(&segments(path), *count);
        }
        self.root = root;
        self.flat = flat;
    }

    /// Apply signed per-path deltas, patching only the affected branches.
    ///
    /// Falls back to a rebuild when a delta would hang a path under an
    /// ancestor the tree does not have yet, or would drive a count negative.
    pub fn apply_deltas(&mut self, deltas: &BTreeMap<String, i64>) -> UpdateMode {
        let mut next_flat = self.flat.clone();
        let mut consistent = true;
        for (path, delta) in deltas {
            let current = next_flat.get(path).copied().unwrap_or(0) as i64;
            let updated = current + delta;
            if updated < 0 {
                consistent = false;
            }
            if updated > 0 {
                next_flat.insert(path.clone(), updated as u64);
            } else {
                next_flat.remove(path);
            }
        }

        let structural = deltas
            .iter()
            .any(|(path, delta)| *delta > 0 && !self.has_parent_of(path));

        if !consistent || structural {
            self.rebuild(next_flat);
            return UpdateMode::Rebuilt;
        }

        for (path, delta) in deltas {
            if *delta != 0 {
                self.root.patch(&segments(path), *delta);
            }
        }
        self.flat = next_flat;
        UpdateMode::Patched
    }

    fn has_parent_of(&self, path: &str) -> bool {
        let segs = segments(path);
        match segs.split_last() {
            None => true,
            Some((_, parents)) => self.node_at(parents).is_some(),
        }
    }

    fn node_at(&self, segs: &[&str]) -> Option<&PathTreeNode> {
        let mut node = &self.root;
        for seg in segs {
            node = node.children.get(*seg)?;
        }
        Some(node)
    }

    pub fn root(&self) -> &PathTreeNode {
        &self.root
    }

    pub fn flat(&self) -> &BTreeMap<String, u64> {
        &self.flat
    }

    pub fn node(&self, path: &str) -> Option<&PathTreeNode> {
        self.node_at(&segments(path))
    }

    /// Sessions at or below `path`.
    pub fn count_under(&self, path: &str) -> u64 {
        self.node(path).map_or(0, |n| n.count)
    }

    pub fn total(&self) -> u64 {
        self.root.count
    }
}

/// Signed deltas turning `old` into `new`. Unchanged paths are omitted.
pub fn diff(old: &BTreeMap<String, u64>, new: &BTreeMap<String, u64>) -> BTreeMap<String, i64> {
    let mut deltas = BTreeMap::new();
    for (path, count) in new {
        let before = old.get(path).copied().unwrap_or(0);
        if before != *count {
            deltas.insert(path.clone(), *count as i64 - before as i64);
        }
    }
    for (path, count) in old {
        if !new.contains_key(path) && *count > 0 {
            deltas.insert(path.clone(), -(*count as i64));
        }
    }
    deltas
}
