// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

//! Lossy reductions of a [Graph]. Every operation keeps the edge maps of
//! both endpoints in sync, and all of them are no-ops on an empty graph.

use super::tags::retain_frequent_tags;
use super::{reaches, Edge, EdgeId, Graph, Node, NodeId, NodeIdSet, NodeSet};
use std::collections::VecDeque;

/// How many tags of a node count against the node budget in visual mode.
const MAX_NODELETS: usize = 4;

impl Graph {
    /// The infos of the nodes whose cum weight reaches `cutoff`.
    pub fn discard_low_frequency_nodes(&self, cutoff: i64) -> NodeSet {
        self.nodes()
            .filter(|n| reaches(n.cum, cutoff))
            .map(|n| n.info.clone())
            .collect()
    }

    /// The nodes whose cum weight reaches `cutoff`.
    pub fn discard_low_frequency_node_ids(&self, cutoff: i64) -> NodeIdSet {
        self.nodes
            .iter()
            .copied()
            .filter(|id| reaches(self.node(*id).cum, cutoff))
            .collect()
    }

    /// The infos of the first `max` nodes in the current order. In visual
    /// mode, a node's tags with flat weight also take up room.
    pub fn select_top_nodes(&self, max: usize, visual: bool) -> NodeSet {
        self.top_nodes(max, visual)
            .iter()
            .map(|id| self.node(*id).info.clone())
            .collect()
    }

    /// Like [Graph::select_top_nodes], for trimming this graph in place.
    pub fn select_top_node_ids(&self, max: usize, visual: bool) -> NodeIdSet {
        self.top_nodes(max, visual).iter().copied().collect()
    }

    fn top_nodes(&self, max: usize, visual: bool) -> &[NodeId] {
        let mut max = max;
        if max > 0 && visual {
            let mut count = 0;
            for (i, id) in self.nodes.iter().enumerate() {
                count += count_tags(self.node(*id)).min(MAX_NODELETS) + 1;
                if count >= max {
                    max = i + 1;
                    break;
                }
            }
        }
        &self.nodes[..max.min(self.nodes.len())]
    }

    /// Drops the tags whose flat and cum weights are both below `cutoff`.
    pub fn trim_low_frequency_tags(&mut self, cutoff: i64) {
        for id in self.nodes.clone() {
            let node = self.node_mut(id);
            retain_frequent_tags(&mut node.label_tags, cutoff);
            for tags in node.numeric_tags.values_mut() {
                retain_frequent_tags(tags, cutoff);
            }
        }
    }

    /// Removes the edges lighter than `cutoff` and returns how many went.
    pub fn trim_low_frequency_edges(&mut self, cutoff: i64) -> usize {
        let light: Vec<EdgeId> = self
            .nodes
            .iter()
            .flat_map(|id| self.node(*id).incoming.values())
            .copied()
            .filter(|e| !reaches(self.edge(*e).weight, cutoff))
            .collect();
        for edge in light.iter() {
            self.remove_edge(*edge);
        }
        light.len()
    }

    /// Removes the nodes of a tree that are not in `kept`. The children of a
    /// removed node are attached to its parent through residual edges that
    /// carry the child edge's weight, and become roots if it had none.
    ///
    /// Fails without touching the graph if any node has several parents.
    pub fn trim_tree(&mut self, kept: &NodeIdSet) -> anyhow::Result<()> {
        if let Some(node) = self.nodes().find(|n| n.incoming.len() > 1) {
            anyhow::bail!(
                "cannot trim a graph that is not a tree: {} has {} parents",
                node.info.printable_name(),
                node.incoming.len()
            );
        }

        let old = std::mem::take(&mut self.nodes);
        self.nodes.reserve(kept.len());
        for id in old {
            if kept.contains(&id) {
                self.nodes.push(id);
                continue;
            }

            let node = self.node(id);
            let parent_edge = node.incoming.values().next().copied();
            let children: Vec<EdgeId> = node.outgoing.values().copied().collect();
            let Some(parent_edge) = parent_edge else {
                for edge in children {
                    self.remove_edge(edge);
                }
                continue;
            };

            let Edge {
                src: parent,
                inline: parent_inline,
                ..
            } = *self.edge(parent_edge);
            self.remove_edge(parent_edge);
            for edge in children {
                let Edge {
                    dest: child,
                    weight,
                    inline,
                    ..
                } = *self.edge(edge);
                self.remove_edge(edge);
                self.add_to_edge(parent, child, weight, true, parent_inline && inline);
            }
        }
        log::trace!("trimmed tree down to {} nodes", self.nodes.len());

        self.remove_redundant_edges();
        Ok(())
    }

    /// Removes residual edges whose source still reaches their destination
    /// through other edges. For each node, incoming edges are considered
    /// lightest first, and none heavier than a non-residual edge is removed.
    pub fn remove_redundant_edges(&mut self) {
        for index in (0..self.nodes.len()).rev() {
            let id = self.nodes[index];
            let incoming = self.sorted_edges(&self.node(id).incoming);
            for edge in incoming.into_iter().rev() {
                if !self.edge(edge).residual {
                    break;
                }
                if self.is_redundant_edge(edge) {
                    self.remove_edge(edge);
                }
            }
        }
    }

    /// Whether the source of the edge is an ancestor of its destination
    /// through some other path.
    fn is_redundant_edge(&self, id: EdgeId) -> bool {
        let Edge { src, dest, .. } = *self.edge(id);
        let mut seen = NodeIdSet::default();
        seen.insert(dest);
        let mut queue = VecDeque::from([dest]);
        while let Some(node) = queue.pop_front() {
            for (parent, edge) in self.node(node).incoming.iter() {
                if *edge == id || seen.contains(parent) {
                    continue;
                }
                if *parent == src {
                    return true;
                }
                seen.insert(*parent);
                queue.push_back(*parent);
            }
        }
        false
    }
}

/// Number of tags of a node that carry flat weight.
fn count_tags(node: &Node) -> usize {
    let labels = node.label_tags.values().filter(|t| t.flat != 0).count();
    let numeric: usize = node
        .numeric_tags
        .values()
        .map(|tags| tags.values().filter(|t| t.flat != 0).count())
        .sum();
    labels + numeric
}
