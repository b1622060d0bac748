//! Goal configuration normalized into a labeled tree, and the ordered diff
//! between two such trees (component C2).
//!
//! The tree is arena-backed (`Vec<Node>` plus parent/child indices) rather
//! than reference-counted, so it has no lifetime parameter and is trivially
//! `Clone`.

use std::collections::{BTreeMap, HashSet};

pub type NodeId = usize;

/// Stable stand-in for the session's execution-root directory, substituted
/// into every config value/attribute before diffing so a cache survives the
/// root being checked out at a different path (e.g. a fresh CI workspace).
pub const EXEC_ROOT_PLACEHOLDER: &str = "#{exec.root.dir}";

#[derive(Debug, Clone)]
struct Node {
    name: String,
    value: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    index_among_siblings: u32,
}

/// A normalized configuration tree. Node 0 is always the root.
#[derive(Debug, Clone)]
pub struct ConfigTree {
    nodes: Vec<Node>,
}

impl Default for ConfigTree {
    fn default() -> Self {
        ConfigTree::new("configuration")
    }
}

impl ConfigTree {
    /// Starts a new tree with a root node of the given name.
    pub fn new(root_name: impl Into<String>) -> Self {
        ConfigTree {
            nodes: vec![Node {
                name: root_name.into(),
                value: None,
                attributes: Vec::new(),
                children: Vec::new(),
                parent: None,
                index_among_siblings: 0,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn add_child(&mut self, parent: NodeId, name: impl Into<String>, value: Option<String>) -> NodeId {
        let index_among_siblings = self.nodes[parent].children.len() as u32;
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.into(),
            value,
            attributes: Vec::new(),
            children: Vec::new(),
            parent: Some(parent),
            index_among_siblings,
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn set_attribute(&mut self, node: NodeId, key: impl Into<String>, value: impl Into<String>) {
        self.nodes[node].attributes.push((key.into(), value.into()));
    }

    pub fn set_value(&mut self, node: NodeId, value: Option<String>) {
        self.nodes[node].value = value;
    }

    pub fn name(&self, node: NodeId) -> &str {
        &self.nodes[node].name
    }

    pub fn value(&self, node: NodeId) -> Option<&str> {
        self.nodes[node].value.as_deref()
    }

    pub fn attributes(&self, node: NodeId) -> &[(String, String)] {
        &self.nodes[node].attributes
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].children
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Rewrites every occurrence of `root` in node values and attribute
    /// values to [`EXEC_ROOT_PLACEHOLDER`], so two trees captured against
    /// different checkouts of the same workspace diff as identical.
    pub fn replace_exec_root_placeholder(&mut self, root: &str) {
        if root.is_empty() {
            return;
        }
        for node in &mut self.nodes {
            if let Some(value) = &node.value {
                node.value = Some(value.replace(root, EXEC_ROOT_PLACEHOLDER));
            }
            for (_, value) in &mut node.attributes {
                *value = value.replace(root, EXEC_ROOT_PLACEHOLDER);
            }
        }
    }

    /// `/`-joined chain of ancestor names, with `[index]` appended only
    /// where a name collides among its own siblings (otherwise the plain
    /// name is unambiguous and matches how diffs are conventionally read,
    /// e.g. `configuration/arg`).
    pub fn path(&self, node: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(node);
        while let Some(cur) = current {
            let n = &self.nodes[cur];
            let segment = match n.parent {
                Some(parent) => {
                    let same_name_siblings = self.nodes[parent]
                        .children
                        .iter()
                        .filter(|&&sibling| self.nodes[sibling].name == n.name)
                        .count();
                    if same_name_siblings > 1 {
                        format!("{}[{}]", n.name, n.index_among_siblings)
                    } else {
                        n.name.clone()
                    }
                }
                None => n.name.clone(),
            };
            segments.push(segment);
            current = n.parent;
        }
        segments.reverse();
        segments.join("/")
    }

    pub fn attribute_path(&self, node: NodeId, key: &str) -> String {
        format!("{}#{}", self.path(node), key)
    }
}

/// One side of a [`Diff`]: either a scalar (attribute or element value) or
/// the name of a whole node that was added/removed/replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffValue {
    Scalar(Option<String>),
    Node(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub orig: Option<DiffValue>,
    pub actual: Option<DiffValue>,
    pub path: String,
}

/// The ordered sequence of differences between two configuration trees.
///
/// Diffs are computed once at construction and can be replayed from the
/// start with [`ConfigDiff::rewind`] without recomputation, since the
/// source trees are immutable once built.
#[derive(Debug, Clone)]
pub struct ConfigDiff {
    diffs: Vec<Diff>,
    cursor: usize,
}

impl ConfigDiff {
    pub fn compute(orig: &ConfigTree, actual: &ConfigTree) -> Self {
        let mut diffs = Vec::new();
        let mut stack = vec![(Some(orig.root()), Some(actual.root()))];
        while let Some((o, a)) = stack.pop() {
            diff_one(orig, o, actual, a, &mut diffs, &mut stack);
        }
        ConfigDiff { diffs, cursor: 0 }
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn as_slice(&self) -> &[Diff] {
        &self.diffs
    }
}

impl Iterator for ConfigDiff {
    type Item = Diff;

    fn next(&mut self) -> Option<Diff> {
        let next = self.diffs.get(self.cursor).cloned();
        if next.is_some() {
            self.cursor += 1;
        }
        next
    }
}

fn diff_one(
    orig: &ConfigTree,
    o: Option<NodeId>,
    actual: &ConfigTree,
    a: Option<NodeId>,
    out: &mut Vec<Diff>,
    stack: &mut Vec<(Option<NodeId>, Option<NodeId>)>,
) {
    match (o, a) {
        (Some(oid), None) => out.push(Diff {
            orig: Some(DiffValue::Node(orig.name(oid).to_string())),
            actual: None,
            path: orig.path(oid),
        }),
        (None, Some(aid)) => out.push(Diff {
            orig: None,
            actual: Some(DiffValue::Node(actual.name(aid).to_string())),
            path: actual.path(aid),
        }),
        (None, None) => {}
        (Some(oid), Some(aid)) => {
            if orig.name(oid) != actual.name(aid) {
                out.push(Diff {
                    orig: Some(DiffValue::Node(orig.name(oid).to_string())),
                    actual: Some(DiffValue::Node(actual.name(aid).to_string())),
                    path: orig.path(oid),
                });
                return;
            }

            let (ov, av) = (orig.value(oid), actual.value(aid));
            if ov != av {
                out.push(Diff {
                    orig: Some(DiffValue::Scalar(ov.map(str::to_string))),
                    actual: Some(DiffValue::Scalar(av.map(str::to_string))),
                    path: orig.path(oid),
                });
            }

            let actual_attrs: BTreeMap<&str, &str> = actual
                .attributes(aid)
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let mut seen: HashSet<&str> = HashSet::new();
            for (k, v) in orig.attributes(oid) {
                seen.insert(k.as_str());
                match actual_attrs.get(k.as_str()) {
                    Some(actual_v) if *actual_v == v.as_str() => {}
                    Some(actual_v) => out.push(Diff {
                        orig: Some(DiffValue::Scalar(Some(v.clone()))),
                        actual: Some(DiffValue::Scalar(Some(actual_v.to_string()))),
                        path: orig.attribute_path(oid, k),
                    }),
                    None => out.push(Diff {
                        orig: Some(DiffValue::Scalar(Some(v.clone()))),
                        actual: None,
                        path: orig.attribute_path(oid, k),
                    }),
                }
            }
            for (k, v) in actual.attributes(aid) {
                if !seen.contains(k.as_str()) {
                    out.push(Diff {
                        orig: None,
                        actual: Some(DiffValue::Scalar(Some(v.clone()))),
                        path: actual.attribute_path(aid, k),
                    });
                }
            }

            let ochildren = orig.children(oid);
            let achildren = actual.children(aid);
            let max_len = ochildren.len().max(achildren.len());
            for i in (0..max_len).rev() {
                stack.push((ochildren.get(i).copied(), achildren.get(i).copied()));
            }
        }
    }
}
