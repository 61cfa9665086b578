// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

//! A weighted call graph built from the samples of a profile. Nodes and
//! edges live in arenas owned by the [Graph]; every edge is registered in
//! both the `outgoing` map of its source and the `incoming` map of its
//! destination, and both entries always hold the same [EdgeId].

mod builder;
pub mod pipeline;
mod reduce;
mod sort;
mod tags;

pub use builder::*;
pub use sort::*;
pub use tags::*;

use crate::collections::identifiable::{define_id, FxHashSet, FxIndexMap, Id};
use std::path::Path;

define_id!(
    /// Handle of a node in a [Graph].
    NodeId
);
define_id!(
    /// Handle of an edge in a [Graph].
    EdgeId
);

/// What a node stands for. Nodes with equal infos are the same node, except
/// in call-tree graphs where the parent is part of a node's identity.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeInfo {
    pub name: String,
    pub orig_name: String,
    pub address: u64,
    pub file: String,
    pub start_line: i64,
    pub lineno: i64,
    pub objfile: String,
}

impl NodeInfo {
    /// The parts of a printable name: the address, the function, and the
    /// most precise source position known.
    pub fn name_components(&self) -> Vec<String> {
        let mut name = Vec::with_capacity(3);
        if self.address != 0 {
            name.push(format!("{:016x}", self.address));
        }
        if !self.name.is_empty() {
            name.push(self.name.clone());
        }

        if self.lineno != 0 {
            name.push(format!("{}:{}", self.file, self.lineno));
        } else if !self.file.is_empty() {
            name.push(self.file.clone());
        } else if !self.name.is_empty() {
            // The function name alone is enough.
        } else if !self.objfile.is_empty() {
            let base = Path::new(&self.objfile)
                .file_name()
                .map(|b| b.to_string_lossy())
                .unwrap_or_else(|| self.objfile.as_str().into());
            name.push(format!("[{base}]"));
        } else {
            name.push("<unknown>".to_string());
        }
        name
    }

    pub fn printable_name(&self) -> String {
        self.name_components().join(" ")
    }
}

/// Whether `weight` is at least `cutoff` in absolute value. Non-positive
/// cutoffs keep everything.
#[inline]
pub(crate) fn reaches(weight: i64, cutoff: i64) -> bool {
    cutoff <= 0 || weight.unsigned_abs() >= cutoff.unsigned_abs()
}

/// Node identities, used to carry a selection from one graph to the next
/// build of the same profile.
pub type NodeSet = FxHashSet<NodeInfo>;

/// Node handles, used to select nodes within one graph.
pub type NodeIdSet = FxHashSet<NodeId>;

/// Edges of a node, keyed by the node at the other end.
pub type EdgeMap = FxIndexMap<NodeId, EdgeId>;

#[derive(Clone, Debug)]
pub struct Node {
    pub info: NodeInfo,

    /// The node representing the whole function this node is part of. Points
    /// back to the node itself when it has no address or line.
    pub function: NodeId,

    /// Weight of samples where this node is the leaf.
    pub flat: i64,

    /// Weight of samples whose stack passes through this node.
    pub cum: i64,

    incoming: EdgeMap,
    outgoing: EdgeMap,

    /// Tags keyed by the joined labels of the samples.
    pub label_tags: TagMap,

    /// Numeric tags, keyed first by the joined labels they were seen with
    /// (empty for samples without labels) and then by formatted value.
    pub numeric_tags: FxIndexMap<String, TagMap>,
}

impl Node {
    fn new(info: NodeInfo, id: NodeId) -> Self {
        Self {
            info,
            function: id,
            flat: 0,
            cum: 0,
            incoming: Default::default(),
            outgoing: Default::default(),
            label_tags: Default::default(),
            numeric_tags: Default::default(),
        }
    }

    #[inline]
    pub fn incoming(&self) -> &EdgeMap {
        &self.incoming
    }

    #[inline]
    pub fn outgoing(&self) -> &EdgeMap {
        &self.outgoing
    }

    /// Negative flat weight, or no flat weight and negative cum weight.
    pub fn is_negative(&self) -> bool {
        self.flat < 0 || (self.flat == 0 && self.cum < 0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Edge {
    pub src: NodeId,
    pub dest: NodeId,
    pub weight: i64,

    /// The edge summarizes a path that went through nodes which are no
    /// longer in the graph.
    pub residual: bool,

    /// The call was inlined: both ends came from the same location.
    pub inline: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    arena: Vec<Node>,
    edges: Vec<Edge>,

    /// The nodes of the graph, in the current sort order. The arena may hold
    /// more nodes than this, e.g. nodes that were trimmed away.
    nodes: Vec<NodeId>,
}

impl Graph {
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Handles of the graph's nodes in their current order.
    #[inline]
    pub fn node_ids(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().map(|id| &self.arena[id.to_offset()])
    }

    /// # Panics
    /// Panics if the handle did not come from this graph.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.arena[id.to_offset()]
    }

    /// # Panics
    /// Panics if the handle did not come from this graph.
    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.arena[id.to_offset()]
    }

    /// # Panics
    /// Panics if the handle did not come from this graph.
    #[inline]
    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.to_offset()]
    }

    /// Finds the node in the graph with the given info. In call-tree graphs
    /// several nodes may match; the first in node order is returned.
    pub fn find(&self, info: &NodeInfo) -> Option<NodeId> {
        self.nodes.iter().copied().find(|id| self.node(*id).info == *info)
    }

    /// Finds the node in the graph whose function name is `name`.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().copied().find(|id| self.node(*id).info.name == name)
    }

    /// The edge from `src` to `dest`, if any.
    pub fn find_edge(&self, src: NodeId, dest: NodeId) -> Option<&Edge> {
        self.node(src)
            .outgoing
            .get(&dest)
            .map(|id| self.edge(*id))
    }

    /// Adds a node to the arena without making it part of the graph.
    fn push_node(&mut self, info: NodeInfo) -> NodeId {
        let id = NodeId::from_offset(self.arena.len());
        self.arena.push(Node::new(info, id));
        id
    }

    /// Adds a new node at the end of the graph.
    pub fn add_node(&mut self, info: NodeInfo) -> NodeId {
        let id = self.push_node(info);
        self.nodes.push(id);
        id
    }

    /// Adds `weight` to the edge from `src` to `dest`, creating it if needed.
    /// The edge becomes residual if any contribution was residual, and stays
    /// inline only while every contribution was inline.
    ///
    /// # Panics
    /// Panics if the two nodes disagree about the edge between them.
    pub fn add_to_edge(
        &mut self,
        src: NodeId,
        dest: NodeId,
        weight: i64,
        residual: bool,
        inline: bool,
    ) -> EdgeId {
        let existing = self.node(src).outgoing.get(&dest).copied();
        let reverse = self.node(dest).incoming.get(&src).copied();
        if existing != reverse {
            panic!("asymmetric edge {src:?} -> {dest:?}: out has {existing:?}, in has {reverse:?}");
        }

        match existing {
            Some(id) => {
                let edge = &mut self.edges[id.to_offset()];
                edge.weight = edge.weight.saturating_add(weight);
                edge.residual |= residual;
                edge.inline &= inline;
                id
            }
            None => {
                let id = EdgeId::from_offset(self.edges.len());
                self.edges.push(Edge {
                    src,
                    dest,
                    weight,
                    residual,
                    inline,
                });
                self.node_mut(src).outgoing.insert(dest, id);
                self.node_mut(dest).incoming.insert(src, id);
                id
            }
        }
    }

    /// Detaches an edge from both of its endpoints.
    ///
    /// # Panics
    /// Panics if the endpoints don't both reference this edge.
    pub fn remove_edge(&mut self, id: EdgeId) {
        let Edge { src, dest, .. } = *self.edge(id);
        let outgoing = self.node_mut(src).outgoing.shift_remove(&dest);
        let incoming = self.node_mut(dest).incoming.shift_remove(&src);
        if outgoing != Some(id) || incoming != Some(id) {
            panic!(
                "asymmetric edge {id:?} from {src:?} to {dest:?}: \
                 out had {outgoing:?}, in had {incoming:?}"
            );
        }
    }

    /// Edges of the map sorted heaviest first, ties broken by the printable
    /// names of the source and then of the destination.
    pub fn sorted_edges(&self, edges: &EdgeMap) -> Vec<EdgeId> {
        let mut sorted: Vec<(EdgeId, String, String)> = edges
            .values()
            .map(|id| {
                let e = self.edge(*id);
                (
                    *id,
                    self.node(e.src).info.printable_name(),
                    self.node(e.dest).info.printable_name(),
                )
            })
            .collect();
        sorted.sort_by(|(l, lsrc, ldest), (r, rsrc, rdest)| {
            let (l, r) = (self.edge(*l), self.edge(*r));
            r.weight
                .unsigned_abs()
                .cmp(&l.weight.unsigned_abs())
                .then_with(|| lsrc.cmp(rsrc))
                .then_with(|| ldest.cmp(rdest))
        });
        sorted.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Total weight of the edges in the map.
    pub fn edge_weight_sum(&self, edges: &EdgeMap) -> i64 {
        edges
            .values()
            .fold(0i64, |sum, id| sum.saturating_add(self.edge(*id).weight))
    }

    /// Sum of the flat and of the cumulative weights of the graph's nodes.
    pub fn sum(&self) -> (i64, i64) {
        self.nodes().fold((0i64, 0i64), |(flat, cum), n| {
            (flat.saturating_add(n.flat), cum.saturating_add(n.cum))
        })
    }

    /// Checks the edge invariant over the whole graph.
    ///
    /// # Panics
    /// Panics on the first edge that is registered on one end only, or
    /// under another edge on the other end.
    pub fn assert_edges_symmetric(&self) {
        for (offset, node) in self.arena.iter().enumerate() {
            let id = NodeId::from_offset(offset);
            for (dest, edge) in node.outgoing.iter() {
                let e = self.edge(*edge);
                assert!(
                    e.src == id && e.dest == *dest,
                    "edge {edge:?} is filed under the wrong nodes"
                );
                assert_eq!(
                    Some(edge),
                    self.node(*dest).incoming.get(&id),
                    "asymmetric edge {id:?} -> {dest:?}"
                );
            }
            for (src, edge) in node.incoming.iter() {
                assert_eq!(
                    Some(edge),
                    self.node(*src).outgoing.get(&id),
                    "asymmetric edge {src:?} -> {id:?}"
                );
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn printable_names() {
        let full = NodeInfo {
            name: "main".into(),
            address: 0x1234,
            file: "main.c".into(),
            lineno: 42,
            ..NodeInfo::default()
        };
        assert_eq!("0000000000001234 main main.c:42", full.printable_name());

        let file_only = NodeInfo {
            name: "main".into(),
            file: "main.c".into(),
            ..NodeInfo::default()
        };
        assert_eq!("main main.c", file_only.printable_name());
        assert_eq!("main", info("main").printable_name());

        let objfile = NodeInfo {
            address: 0xff,
            objfile: "/usr/lib/libc.so.6".into(),
            ..NodeInfo::default()
        };
        assert_eq!("00000000000000ff [libc.so.6]", objfile.printable_name());
        assert_eq!("<unknown>", NodeInfo::default().printable_name());
    }

    #[test]
    fn edges_accumulate_flags() {
        let (mut graph, ids) = graph_from_edges(2, &[(0, 1, 5, true)]);
        let edge = *graph.find_edge(ids[0], ids[1]).unwrap();
        assert!(edge.inline && !edge.residual);

        graph.add_to_edge(ids[0], ids[1], 2, true, true);
        let edge = *graph.find_edge(ids[0], ids[1]).unwrap();
        assert_eq!(7, edge.weight);
        assert!(edge.inline && edge.residual);

        // Once seen as a real call, it never becomes inline again.
        graph.add_to_edge(ids[0], ids[1], 1, false, false);
        graph.add_to_edge(ids[0], ids[1], 1, false, true);
        let edge = *graph.find_edge(ids[0], ids[1]).unwrap();
        assert_eq!(9, edge.weight);
        assert!(!edge.inline && edge.residual);
        graph.assert_edges_symmetric();
    }

    #[test]
    fn remove_edge_detaches_both_ends() {
        let (mut graph, ids) = graph_from_edges(3, &[(0, 1, 5, false), (1, 2, 3, false)]);
        let id = graph.node(ids[0]).outgoing()[&ids[1]];
        graph.remove_edge(id);
        assert!(graph.node(ids[0]).outgoing().is_empty());
        assert!(graph.node(ids[1]).incoming().is_empty());
        assert_eq!(1, graph.node(ids[1]).outgoing().len());
        graph.assert_edges_symmetric();
    }

    #[test]
    #[should_panic(expected = "asymmetric edge")]
    fn asymmetric_edges_abort() {
        let (mut graph, ids) = graph_from_edges(2, &[(0, 1, 5, false)]);
        graph.node_mut(ids[1]).incoming.clear();
        graph.add_to_edge(ids[0], ids[1], 1, false, false);
    }

    #[test]
    #[should_panic(expected = "asymmetric edge")]
    fn symmetry_check_catches_dangling_entries() {
        let (mut graph, ids) = graph_from_edges(2, &[(0, 1, 5, false)]);
        graph.node_mut(ids[0]).outgoing.clear();
        graph.assert_edges_symmetric();
    }

    #[test]
    fn sorted_edges_heaviest_first() {
        let (graph, ids) = graph_from_edges(
            4,
            &[(1, 0, 2, false), (2, 0, -7, false), (3, 0, 2, false)],
        );
        let sorted: Vec<NodeId> = graph
            .sorted_edges(graph.node(ids[0]).incoming())
            .into_iter()
            .map(|e| graph.edge(e).src)
            .collect();
        assert_eq!(vec![ids[2], ids[1], ids[3]], sorted);
        assert_eq!(-3, graph.edge_weight_sum(graph.node(ids[0]).incoming()));
    }

    #[test]
    fn empty_graph() {
        let graph = Graph::default();
        assert!(graph.is_empty());
        assert_eq!((0, 0), graph.sum());
        assert_eq!(None, graph.find_by_name("main"));
        graph.assert_edges_symmetric();
    }
}
