//! Flame graph of a metric namespace.
//!
//! Every dotted metric name (`a.b.c`) contributes one occurrence to each of its
//! path components (`a`, `a.b`); the final segment is the metric itself and is
//! never materialized. The root is a synthetic `all` node whose value is the
//! number of names the graph was built from.
//!
//! Nodes live in an arena (`Vec<FlameNode>`). Children are arena indices owned
//! by their parent, and `parent` is a plain index used for lookups only.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::collections::{BTreeMap, HashMap};

/// Reserved id of the root node in every snapshot.
pub const ROOT_ID: u64 = 1;

pub const ROOT_NAME: &str = "all";

/// Path components beyond this depth are ignored when building.
pub const MAX_PATH_SEGMENTS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct FlameNode {
    pub id: u64,
    pub name: String,
    pub total: u64,
    pub value: u64,
    /// Arena indices of the children, in insertion order.
    pub children: Vec<usize>,
    /// Ids of `children`, same order.
    pub children_ids: Vec<u64>,
    pub parent: Option<usize>,
}

/// Hands out snapshot-local node ids, starting just above [`ROOT_ID`].
struct IdGenerator {
    next: u64,
}

impl IdGenerator {
    fn new() -> Self {
        Self { next: ROOT_ID + 1 }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Value a node must exceed to survive trimming with `fraction` of `total`.
pub fn trim_floor(total: u64, fraction: f64) -> u64 {
    (total as f64 * fraction) as u64
}

#[derive(Debug, Clone)]
pub struct FlameGraph {
    cluster: String,
    nodes: Vec<FlameNode>,
}

impl FlameGraph {
    /// Arena index of the root.
    pub const ROOT: usize = 0;

    /// A graph holding only a root node.
    pub fn with_root(cluster: &str, id: u64, name: &str, total: u64, value: u64) -> Self {
        Self {
            cluster: cluster.to_string(),
            nodes: vec![FlameNode {
                id,
                name: name.to_string(),
                total,
                value,
                children: Vec::new(),
                children_ids: Vec::new(),
                parent: None,
            }],
        }
    }

    /// Build the graph of `names`, which are expected to be deduplicated.
    pub fn build<S: AsRef<str>>(cluster: &str, names: &[S]) -> Self {
        let mut ids = IdGenerator::new();
        let total = names.len() as u64;
        let mut graph = Self::with_root(cluster, ROOT_ID, ROOT_NAME, total, total);
        // Full dotted prefix -> arena index
        let mut seen: HashMap<String, usize> = HashMap::new();

        for name in names {
            let Some((components, _leaf)) = name.as_ref().rsplit_once('.') else {
                continue;
            };

            let mut prefix = String::with_capacity(components.len() + 1);
            let mut parent = Self::ROOT;
            let parts = components
                .split('.')
                .filter(|part| !part.is_empty())
                .take(MAX_PATH_SEGMENTS);

            for part in parts {
                prefix.push('.');
                prefix.push_str(part);
                parent = match seen.get(&prefix) {
                    Some(&index) => {
                        graph.nodes[index].value += 1;
                        index
                    }
                    None => {
                        let index = graph.attach(parent, ids.next_id(), part, 1);
                        seen.insert(prefix.clone(), index);
                        index
                    }
                };
            }
        }

        graph
    }

    /// Append a new node under `parent`, returning its arena index.
    pub(crate) fn attach(&mut self, parent: usize, id: u64, name: &str, value: u64) -> usize {
        let index = self.nodes.len();
        self.nodes.push(FlameNode {
            id,
            name: name.to_string(),
            total: self.total(),
            value,
            children: Vec::new(),
            children_ids: Vec::new(),
            parent: Some(parent),
        });
        let parent = &mut self.nodes[parent];
        parent.children.push(index);
        parent.children_ids.push(id);
        index
    }

    /// Drop every subtree whose root value is not strictly greater than
    /// `floor`. Survivors keep their original counts. Returns the number of
    /// nodes removed.
    pub fn trim(&mut self, floor: u64) -> usize {
        let before = self.nodes.len();
        let old = std::mem::take(&mut self.nodes);

        let mut root = old[Self::ROOT].clone();
        root.children.clear();
        root.children_ids.clear();
        let mut kept = Vec::with_capacity(before);
        kept.push(root);

        // (index in old arena, index in new arena)
        let mut stack = vec![(Self::ROOT, Self::ROOT)];
        while let Some((old_index, new_index)) = stack.pop() {
            for &child in &old[old_index].children {
                let node = &old[child];
                if node.value <= floor {
                    continue;
                }
                let new_child = kept.len();
                kept.push(FlameNode {
                    id: node.id,
                    name: node.name.clone(),
                    total: node.total,
                    value: node.value,
                    children: Vec::new(),
                    children_ids: Vec::new(),
                    parent: Some(new_index),
                });
                kept[new_index].children.push(new_child);
                kept[new_index].children_ids.push(node.id);
                stack.push((child, new_child));
            }
        }

        self.nodes = kept;
        before - self.nodes.len()
    }

    /// Trim with a floor of `fraction` of the root's total.
    pub fn trim_fraction(&mut self, fraction: f64) -> usize {
        self.trim(trim_floor(self.total(), fraction))
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn root(&self) -> &FlameNode {
        &self.nodes[Self::ROOT]
    }

    pub fn total(&self) -> u64 {
        self.root().total
    }

    pub fn node(&self, index: usize) -> Option<&FlameNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[FlameNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing but the root is left.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Follow `path` segment by segment from the root.
    pub fn find(&self, path: &[&str]) -> Option<&FlameNode> {
        let mut current = self.root();
        for segment in path {
            current = current
                .children
                .iter()
                .map(|&index| &self.nodes[index])
                .find(|node| node.name == *segment)?;
        }
        Some(current)
    }

    /// Dotted path of the node at `index`, walking parent links.
    pub fn path_of(&self, index: usize) -> String {
        let mut segments = Vec::new();
        let mut current = index;
        while let Some(parent) = self.nodes[current].parent {
            segments.push(self.nodes[current].name.as_str());
            current = parent;
        }
        segments.reverse();
        segments.join(".")
    }

    /// Every non-root node as `dotted.path -> value`. Independent of insertion
    /// order and id assignment, so two graphs of the same name set compare equal.
    pub fn prefix_counts(&self) -> BTreeMap<String, u64> {
        (1..self.nodes.len())
            .map(|index| (self.path_of(index), self.nodes[index].value))
            .collect()
    }

    /// Serializable view of the subtree rooted at `index`.
    pub fn view(&self, index: usize) -> NodeView<'_> {
        NodeView { graph: self, index }
    }
}

/// JSON shape of a node: `name`, `total`, `value` and `children` (omitted
/// when empty).
pub struct NodeView<'a> {
    graph: &'a FlameGraph,
    index: usize,
}

struct ChildrenView<'a> {
    graph: &'a FlameGraph,
    indices: &'a [usize],
}

impl Serialize for NodeView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let node = &self.graph.nodes[self.index];
        let has_children = !node.children.is_empty();
        let mut state = serializer.serialize_struct("FlameNode", if has_children { 4 } else { 3 })?;
        state.serialize_field("name", &node.name)?;
        state.serialize_field("total", &node.total)?;
        state.serialize_field("value", &node.value)?;
        if has_children {
            state.serialize_field(
                "children",
                &ChildrenView {
                    graph: self.graph,
                    indices: &node.children,
                },
            )?;
        } else {
            state.skip_field("children")?;
        }
        state.end()
    }
}

impl Serialize for ChildrenView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.indices.iter().map(|&index| self.graph.view(index)))
    }
}

impl Serialize for FlameGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.view(Self::ROOT).serialize(serializer)
    }
}
