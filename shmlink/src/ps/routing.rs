//! K-ary broadcast tree over replica ids.
//!
//! The first `K` ids hang directly below the root. The remaining ids are
//! dealt round-robin below those `K` (`rest[i], rest[i + K], ...` go to the
//! i-th), and each of those lists is split the same way recursively.
//!
//! ```text
//! ids 0..22, K = 4
//!
//! root ─┬─ 0 ─┬─ 4 ── 20
//!       │     ├─ 8
//!       │     ├─ 12
//!       │     └─ 16
//!       ├─ 1 ─┬─ 5 ── 21
//!       │     └─ 9, 13, 17
//!       ├─ 2 ─── 6, 10, 14, 18
//!       └─ 3 ─── 7, 11, 15, 19
//! ```
//!
//! Nodes live in an arena and refer to each other by index.

use crate::error::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct RouteNode {
    id: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Broadcast tree with fan-out at most `K`.
#[derive(Debug, Clone)]
pub struct RouteTree {
    fan_out: usize,
    nodes: Vec<RouteNode>,
    roots: Vec<usize>,
    index: HashMap<String, usize>,
}

impl RouteTree {
    /// Build the tree for `ids` in the given order.
    pub fn new<I, S>(ids: I, fan_out: usize) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if fan_out == 0 {
            return Err(Error::InvalidConfig("fan_out must be > 0".into()));
        }
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        let mut tree = Self {
            fan_out,
            nodes: Vec::with_capacity(ids.len()),
            roots: Vec::new(),
            index: HashMap::with_capacity(ids.len()),
        };
        for id in &ids {
            if tree.index.insert(id.clone(), usize::MAX).is_some() {
                return Err(Error::InvalidConfig(format!("duplicate replica id '{}'", id)));
            }
        }
        tree.roots = tree.attach(None, &ids);
        Ok(tree)
    }

    fn attach(&mut self, parent: Option<usize>, ids: &[String]) -> Vec<usize> {
        let k = self.fan_out;
        let (heads, rest) = ids.split_at(ids.len().min(k));
        let mut placed = Vec::with_capacity(heads.len());
        for (i, id) in heads.iter().enumerate() {
            let idx = self.nodes.len();
            self.nodes.push(RouteNode {
                id: id.clone(),
                parent,
                children: Vec::new(),
            });
            self.index.insert(id.clone(), idx);

            let below: Vec<String> = rest.iter().skip(i).step_by(k).cloned().collect();
            let children = self.attach(Some(idx), &below);
            self.nodes[idx].children = children;
            placed.push(idx);
        }
        placed
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Number of replicas in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Replicas the root sends to directly.
    pub fn root_children(&self) -> Vec<&str> {
        self.roots.iter().map(|&i| self.nodes[i].id.as_str()).collect()
    }

    /// Replicas `id` forwards to, or `None` if `id` is not in the tree.
    pub fn children(&self, id: &str) -> Option<Vec<&str>> {
        let idx = *self.index.get(id)?;
        Some(
            self.nodes[idx]
                .children
                .iter()
                .map(|&c| self.nodes[c].id.as_str())
                .collect(),
        )
    }

    /// Replica that forwards to `id`; `None` for root children and unknown ids.
    pub fn parent(&self, id: &str) -> Option<&str> {
        let idx = *self.index.get(id)?;
        self.nodes[idx].parent.map(|p| self.nodes[p].id.as_str())
    }

    /// Number of replica levels below the root.
    pub fn depth(&self) -> usize {
        fn level(tree: &RouteTree, idx: usize) -> usize {
            1 + tree.nodes[idx]
                .children
                .iter()
                .map(|&c| level(tree, c))
                .max()
                .unwrap_or(0)
        }
        self.roots.iter().map(|&r| level(self, r)).max().unwrap_or(0)
    }

    /// Every replica id, in insertion (pre-order) order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }
}
