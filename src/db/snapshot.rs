//! Flame graph <-> row conversion.
//!
//! A snapshot is stored as one row per node, each row carrying its own id and
//! the ids of its children. Reading a snapshot back starts at the root row and
//! follows `children_ids`, keeping only the ids present in the fetched row set.

use std::collections::{HashMap, HashSet};

use super::models::{GraphType, RowRecord};
use crate::flamegraph::FlameGraph;

/// One row per node, root first, parents before their children.
pub fn flatten(graph: &FlameGraph, timestamp: i64) -> Vec<RowRecord> {
    let nodes = graph.nodes();
    let mut rows = Vec::with_capacity(nodes.len());
    let mut stack = vec![FlameGraph::ROOT];

    while let Some(index) = stack.pop() {
        let node = &nodes[index];
        rows.push(RowRecord {
            timestamp,
            graph_type: GraphType::GraphiteMetrics,
            cluster: graph.cluster().to_string(),
            id: node.id,
            name: node.name.clone(),
            total: node.total,
            value: node.value,
            children_ids: node.children_ids.clone(),
        });
        stack.extend(node.children.iter().rev());
    }

    rows
}

/// Rebuild a graph from `root` and the rows that passed the value filter.
///
/// Child ids missing from `rows` are pruned along with everything below them.
/// An id is placed at most once, so a corrupted snapshot cannot loop.
pub fn reconstruct(root: &RowRecord, rows: &HashMap<u64, RowRecord>) -> FlameGraph {
    let mut graph = FlameGraph::with_root(&root.cluster, root.id, &root.name, root.total, root.value);
    let mut placed: HashSet<u64> = HashSet::from([root.id]);
    let mut stack: Vec<(usize, &[u64])> = vec![(FlameGraph::ROOT, root.children_ids.as_slice())];

    while let Some((parent, children_ids)) = stack.pop() {
        for id in children_ids {
            let Some(row) = rows.get(id) else { continue };
            if !placed.insert(row.id) {
                continue;
            }
            let index = graph.attach(parent, row.id, &row.name, row.value);
            stack.push((index, row.children_ids.as_slice()));
        }
    }

    graph
}
