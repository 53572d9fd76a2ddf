//! Reply trees over a flat list of comments.
//!
//! Comments only store their parent id; the tree is rebuilt on demand as an
//! index of child ids keyed by parent, so no comment owns another.

use std::collections::{HashMap, HashSet};

use crate::models::{Comment, Id};

pub struct CommentThread<'a> {
    by_id: HashMap<Id, &'a Comment>,
    children: HashMap<Id, Vec<Id>>,
    roots: Vec<Id>,
}

impl<'a> CommentThread<'a> {
    /// Comments whose parent is missing from `comments` are treated as roots.
    pub fn new(comments: &'a [Comment]) -> Self {
        let mut sorted: Vec<&Comment> = comments.iter().collect();
        sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let by_id: HashMap<Id, &Comment> = sorted.iter().map(|c| (c.id, *c)).collect();
        let mut children: HashMap<Id, Vec<Id>> = HashMap::new();
        let mut roots = Vec::new();
        for c in &sorted {
            match c.parent_id.filter(|p| by_id.contains_key(p) && *p != c.id) {
                Some(parent) => children.entry(parent).or_default().push(c.id),
                None => roots.push(c.id),
            }
        }
        Self { by_id, children, roots }
    }

    pub fn get(&self, id: Id) -> Option<&'a Comment> {
        self.by_id.get(&id).copied()
    }

    pub fn children_of(&self, id: Id) -> &[Id] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Depth-first thread order paired with nesting depth (roots are 0).
    pub fn in_thread_order(&self) -> Vec<(&'a Comment, usize)> {
        let mut out = Vec::with_capacity(self.by_id.len());
        let mut seen = HashSet::new();
        let mut stack: Vec<(Id, usize)> = self.roots.iter().rev().map(|id| (*id, 0)).collect();
        while let Some((id, depth)) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(c) = self.get(id) {
                out.push((c, depth));
            }
            stack.extend(self.children_of(id).iter().rev().map(|child| (*child, depth + 1)));
        }
        out
    }

    /// Number of ancestors above `id`; `None` if it isn't in the thread.
    pub fn depth_of(&self, id: Id) -> Option<usize> {
        let mut current = self.get(id)?;
        let mut depth = 0;
        while let Some(parent) = current.parent_id.and_then(|p| self.get(p)).filter(|p| p.id != current.id) {
            depth += 1;
            if depth > self.by_id.len() {
                break; // cycle
            }
            current = parent;
        }
        Some(depth)
    }

    /// `id` and every reply beneath it.
    pub fn subtree(&self, id: Id) -> Vec<Id> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            out.push(next);
            stack.extend_from_slice(self.children_of(next));
        }
        out
    }
}
