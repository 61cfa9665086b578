// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

//! The reduction a report applies before showing a call graph: cut the
//! nodes and edges that carry too little weight, then keep the most
//! important nodes. Each refinement rebuilds the graph from the samples, as
//! the graph alone can't tell where the weight of a dropped node belongs.

use super::{Graph, NodeIdSet, NodeSet, Options};
use crate::config::{NegativeNodes, ReductionConfig};
use crate::profile::Profile;

#[derive(Debug)]
pub struct ReducedGraph {
    pub graph: Graph,

    /// Flat weight of the complete graph, before any reduction.
    pub total: i64,

    /// Number of nodes left after the weight cutoff, before selecting the
    /// top nodes.
    pub original_node_count: usize,

    /// Nodes that fell below the weight cutoff.
    pub dropped_nodes: usize,

    /// Edges that fell below the weight cutoff in the final graph.
    pub dropped_edges: usize,
}

pub fn reduce(profile: &Profile, config: &ReductionConfig) -> anyhow::Result<ReducedGraph> {
    config.validate()?;
    let index = profile.sample_index(config.sample_index.as_deref().unwrap_or(""))?;
    let sample_value = |values: &[i64]| values.get(index).copied().unwrap_or(0);
    let drop_early = config.negative_nodes == NegativeNodes::DropBeforeSelection;
    let visual = config.visual_mode;

    let mut graph = build(profile, config, &sample_value, None, drop_early);
    let (total, _) = graph.sum();
    let node_cutoff = cutoff(total, config.node_fraction);
    let edge_cutoff = cutoff(total, config.edge_fraction);

    let mut dropped_nodes = 0;
    if node_cutoff > 0 {
        if config.call_tree {
            let kept = graph.discard_low_frequency_node_ids(node_cutoff);
            if kept.len() != graph.len() {
                dropped_nodes = graph.len() - kept.len();
                graph.trim_tree(&kept)?;
            }
        } else {
            let kept = graph.discard_low_frequency_nodes(node_cutoff);
            if kept.len() != graph.len() {
                dropped_nodes = graph.len() - kept.len();
                graph = build(profile, config, &sample_value, Some(&kept), drop_early);
            }
        }
    }
    let original_node_count = graph.len();

    // Light tags and edges would otherwise count towards the selection.
    graph.trim_low_frequency_tags(node_cutoff);
    graph.trim_low_frequency_edges(edge_cutoff);

    // A node count of zero means no limit. Even a graph that fits can lose
    // nodes in visual mode, where tags take up slots.
    if config.node_count > 0 {
        graph.sort_nodes(config.cum_sort, visual);
        if config.call_tree {
            let kept = graph.select_top_node_ids(config.node_count, visual);
            if kept.len() != graph.len() {
                graph.trim_tree(&kept)?;
            }
        } else {
            let kept = graph.select_top_nodes(config.node_count, visual);
            if kept.len() != graph.len() {
                graph = build(profile, config, &sample_value, Some(&kept), drop_early);
            }
        }
    }

    if config.negative_nodes == NegativeNodes::DropAfterSelection {
        if config.call_tree {
            let kept: NodeIdSet = graph
                .node_ids()
                .iter()
                .copied()
                .filter(|id| !graph.node(*id).is_negative())
                .collect();
            graph.trim_tree(&kept)?;
        } else {
            let kept: NodeSet = graph.nodes().map(|n| n.info.clone()).collect();
            graph = build(profile, config, &sample_value, Some(&kept), true);
        }
    }

    graph.sort_nodes(config.cum_sort, visual);
    graph.trim_low_frequency_tags(node_cutoff);
    let dropped_edges = graph.trim_low_frequency_edges(edge_cutoff);
    if visual {
        graph.remove_redundant_edges();
    }

    log::debug!(
        "reduced graph to {} of {original_node_count} nodes (total {total}, \
         {dropped_nodes} nodes and {dropped_edges} edges below cutoff)",
        graph.len()
    );
    Ok(ReducedGraph {
        graph,
        total,
        original_node_count,
        dropped_nodes,
        dropped_edges,
    })
}

fn build(
    profile: &Profile,
    config: &ReductionConfig,
    sample_value: &dyn Fn(&[i64]) -> i64,
    kept_nodes: Option<&NodeSet>,
    drop_negative: bool,
) -> Graph {
    let options = Options {
        obj_names: config.obj_names,
        orig_fn_names: config.orig_fn_names,
        call_tree: config.call_tree,
        drop_negative,
        kept_nodes,
        ..Options::new(sample_value)
    };
    Graph::new(profile, &options)
}

fn cutoff(total: i64, fraction: f64) -> i64 {
    ((total as f64 * fraction) as i64).saturating_abs()
}
