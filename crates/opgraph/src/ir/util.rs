//! Graph walks and rewrites over [`Node`]s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::backend::hashing::Fingerprint;
use crate::ir::node::{Node, NodeId, NodePtr, Value};

/// Every node reachable from `roots`, operands before users, each node once.
pub fn post_order(roots: &[Value]) -> Vec<NodePtr> {
    post_order_where(roots.iter().map(Value::node), |_| true)
}

/// Post-order walk that does not enter nodes rejected by `include`.
pub fn post_order_where<'a>(
    roots: impl IntoIterator<Item = &'a NodePtr>,
    mut include: impl FnMut(&Node) -> bool,
) -> Vec<NodePtr> {
    let mut order = Vec::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<(NodePtr, bool)> = Vec::new();
    for root in roots {
        if visited.contains(&root.id()) || !include(&**root) {
            continue;
        }
        stack.push((Arc::clone(root), false));
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !visited.insert(node.id()) {
                continue;
            }
            stack.push((Arc::clone(&node), true));
            for operand in node.operands().iter().rev() {
                let input = operand.node();
                if !visited.contains(&input.id()) && include(&**input) {
                    stack.push((Arc::clone(input), false));
                }
            }
        }
    }
    order
}

/// Number of distinct nodes reachable from `roots`.
pub fn graph_size(roots: &[Value]) -> usize {
    post_order(roots).len()
}

/// Rebuilds the graph under `roots` so structurally identical nodes share one instance.
///
/// Nodes are keyed by structural hash and, for nodes carrying runtime data, by the identity of
/// that data. The first node seen for a key is kept; nodes whose operands were redirected are
/// rebuilt with [`Node::clone_with_operands`]. Returns the rewritten roots in order.
pub fn deduplicate(roots: &[Value]) -> Vec<Value> {
    let mut canonical: HashMap<(Fingerprint, Option<usize>), NodePtr> = HashMap::new();
    let mut replaced: HashMap<NodeId, NodePtr> = HashMap::new();
    for node in post_order(roots) {
        let operands: Vec<Value> = node
            .operands()
            .iter()
            .map(|operand| match replaced.get(&operand.node().id()) {
                Some(node) => Value::new(Arc::clone(node), operand.index()),
                None => operand.clone(),
            })
            .collect();
        let key = (node.hash(), node.data_identity());
        let rewritten = match canonical.get(&key) {
            Some(existing) if existing.op() == node.op() => Arc::clone(existing),
            Some(existing) => {
                tracing::warn!(
                    hash = node.hash(),
                    kept = %existing,
                    other = %node,
                    "structural hash collision during deduplication"
                );
                rebuild(&node, &operands)
            }
            None => {
                let rebuilt = rebuild(&node, &operands);
                canonical.insert(key, Arc::clone(&rebuilt));
                rebuilt
            }
        };
        if rewritten.id() != node.id() {
            replaced.insert(node.id(), rewritten);
        }
    }
    roots
        .iter()
        .map(|root| match replaced.get(&root.node().id()) {
            Some(node) => Value::new(Arc::clone(node), root.index()),
            None => root.clone(),
        })
        .collect()
}

fn rebuild(node: &NodePtr, operands: &[Value]) -> NodePtr {
    if operands == node.operands() {
        Arc::clone(node)
    } else {
        node.clone_with_operands(operands)
    }
}
