// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

use super::{EdgeMap, Graph, NodeId};
use std::cmp::Ordering;

/// Orders in which the nodes of a [Graph] can be listed. Every order ends
/// with the same total order on node infos, so sorting is deterministic.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum NodeOrder {
    /// Heaviest flat weight first, then printable name, then cum weight.
    FlatName,
    /// Heaviest flat weight, then heaviest cum weight, then printable name.
    FlatCumName,
    /// Heaviest cum weight, then printable name, then flat weight.
    CumName,
    /// Function name.
    Name,
    /// Source file, then start line.
    File,
    Address,
    /// Like [NodeOrder::CumName] but scored by [entropy_score], which favors
    /// nodes that fan in or out.
    Entropy,
}

struct SortKey {
    id: NodeId,
    name: String,
    score: i64,
}

impl Graph {
    /// Sorts the nodes the way reports list them: by entropy in visual mode,
    /// else by cum or flat weight.
    pub fn sort_nodes(&mut self, cum: bool, visual: bool) {
        let order = if visual {
            NodeOrder::Entropy
        } else if cum {
            NodeOrder::CumName
        } else {
            NodeOrder::FlatName
        };
        self.sort_by_order(order);
    }

    pub fn sort_by_order(&mut self, order: NodeOrder) {
        let mut keys: Vec<SortKey> = self
            .nodes
            .iter()
            .map(|id| {
                let node = self.node(*id);
                let score = match order {
                    NodeOrder::CumName => node.cum,
                    NodeOrder::Entropy => entropy_score(self, *id),
                    _ => 0,
                };
                SortKey {
                    id: *id,
                    name: node.info.printable_name(),
                    score,
                }
            })
            .collect();
        keys.sort_by(|l, r| self.compare(order, l, r));
        self.nodes = keys.into_iter().map(|k| k.id).collect();
    }

    fn compare(&self, order: NodeOrder, l: &SortKey, r: &SortKey) -> Ordering {
        let (ln, rn) = (self.node(l.id), self.node(r.id));
        let heavier = |l: i64, r: i64| r.unsigned_abs().cmp(&l.unsigned_abs());
        let by_name = || l.name.cmp(&r.name);
        match order {
            NodeOrder::FlatName => heavier(ln.flat, rn.flat)
                .then_with(by_name)
                .then_with(|| heavier(ln.cum, rn.cum)),
            NodeOrder::FlatCumName => heavier(ln.flat, rn.flat)
                .then_with(|| heavier(ln.cum, rn.cum))
                .then_with(by_name),
            NodeOrder::Name => ln.info.name.cmp(&rn.info.name),
            NodeOrder::File => ln
                .info
                .file
                .cmp(&rn.info.file)
                .then_with(|| ln.info.start_line.cmp(&rn.info.start_line)),
            NodeOrder::Address => ln.info.address.cmp(&rn.info.address),
            NodeOrder::CumName | NodeOrder::Entropy => heavier(l.score, r.score)
                .then_with(by_name)
                .then_with(|| heavier(ln.flat, rn.flat)),
        }
        .then_with(|| ln.info.cmp(&rn.info))
    }
}

/// Scores a node by how much it fans in and out, weighted by its cum weight.
/// A side with no edges contributes 1; the outgoing side counts the node's
/// own flat weight as one more branch.
pub fn entropy_score(graph: &Graph, id: NodeId) -> i64 {
    let node = graph.node(id);
    let mut score = 0f64;
    score += if node.incoming().is_empty() {
        1.0
    } else {
        edge_entropy(graph, node.incoming(), 0)
    };
    score += if node.outgoing().is_empty() {
        1.0
    } else {
        edge_entropy(graph, node.outgoing(), node.flat)
    };
    ((score * node.cum as f64) as i64).saturating_add(node.flat)
}

fn edge_entropy(graph: &Graph, edges: &EdgeMap, own: i64) -> f64 {
    let weights: Vec<i64> = edges.values().map(|e| graph.edge(*e).weight).collect();
    let total = weights
        .iter()
        .filter(|w| **w > 0)
        .fold(own, |total, w| total.saturating_add(*w));
    if total == 0 {
        return 0.0;
    }

    let mut branches = weights;
    if own > 0 {
        branches.push(own);
    }
    branches
        .into_iter()
        .map(|w| w.unsigned_abs() as f64 / total as f64)
        .filter(|fraction| *fraction != 0.0)
        .map(|fraction| -fraction * fraction.log2())
        .sum()
}
