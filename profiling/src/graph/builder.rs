// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

use super::tags::find_or_add_tag;
use super::{Graph, NodeId, NodeInfo, NodeSet};
use crate::collections::identifiable::{FxHashMap, FxHashSet, Id};
use crate::profile::{Line, Location, Profile, Sample};

/// How [Graph::new] turns samples into nodes and weights.
pub struct Options<'a> {
    /// Picks the weight of a sample out of its values.
    pub sample_value: &'a dyn Fn(&[i64]) -> i64,

    /// Formats a numeric label value given its unit. Decimal when `None`.
    pub format_tag: Option<&'a dyn Fn(i64, &str) -> String>,

    /// Keep the object file and start line in every node.
    pub obj_names: bool,

    /// Keep the system (e.g. mangled) function names.
    pub orig_fn_names: bool,

    /// Build a tree: a node's parent is part of its identity.
    pub call_tree: bool,

    /// Drop nodes whose weight is negative.
    pub drop_negative: bool,

    /// Only create nodes with these infos.
    pub kept_nodes: Option<&'a NodeSet>,
}

impl<'a> Options<'a> {
    pub fn new(sample_value: &'a dyn Fn(&[i64]) -> i64) -> Self {
        Self {
            sample_value,
            format_tag: None,
            obj_names: false,
            orig_fn_names: false,
            call_tree: false,
            drop_negative: false,
            kept_nodes: None,
        }
    }
}

type NodeMap = FxHashMap<NodeInfo, NodeId>;

impl Graph {
    /// Builds the call graph, or call tree, of a profile.
    pub fn new(profile: &Profile, options: &Options) -> Self {
        let mut graph = Graph::default();
        if options.call_tree {
            graph.add_tree_samples(profile, options);
        } else {
            graph.add_graph_samples(profile, options);
        }
        graph.select_nodes(options.drop_negative);
        log::debug!(
            "built call {} with {} nodes out of {} candidates",
            if options.call_tree { "tree" } else { "graph" },
            graph.nodes.len(),
            graph.arena.len()
        );
        graph
    }

    fn add_graph_samples(&mut self, profile: &Profile, options: &Options) {
        let mut node_map = NodeMap::default();
        let mut location_nodes: Vec<Vec<Option<NodeId>>> =
            Vec::with_capacity(profile.locations.len());
        for location in profile.locations.iter() {
            let nodes = location_lines(location)
                .into_iter()
                .map(|line| {
                    self.find_or_insert_line(&mut node_map, profile, location, line, options)
                })
                .collect();
            location_nodes.push(nodes);
        }

        let default_format = |value: i64, _: &str| value.to_string();
        let format: &dyn Fn(i64, &str) -> String = match options.format_tag {
            Some(format) => format,
            None => &default_format,
        };

        let mut seen_nodes = FxHashSet::default();
        let mut seen_edges = FxHashSet::default();
        for sample in profile.samples.iter() {
            let weight = (options.sample_value)(&sample.values);
            if weight == 0 {
                continue;
            }
            seen_nodes.clear();
            seen_edges.clear();
            let labels = join_labels(sample);

            let mut parent: Option<NodeId> = None;
            let mut residual = false;
            for location in sample.locations.iter().rev() {
                let Some(nodes) = location_nodes.get(location.to_offset()) else {
                    continue;
                };
                for (index, node) in nodes.iter().enumerate().rev() {
                    let Some(node) = *node else {
                        residual = true;
                        continue;
                    };
                    if seen_nodes.insert(node) {
                        self.add_sample(node, weight, &labels, sample, format, false);
                    }
                    if let Some(parent) = parent {
                        if parent != node && seen_edges.insert((parent, node)) {
                            let inline = index != nodes.len() - 1;
                            self.add_to_edge(parent, node, weight, residual, inline);
                        }
                    }
                    parent = Some(node);
                    residual = false;
                }
            }
            if let Some(leaf) = parent {
                if !residual {
                    self.add_sample(leaf, weight, &labels, sample, format, true);
                }
            }
        }
    }

    fn add_tree_samples(&mut self, profile: &Profile, options: &Options) {
        let mut children: FxHashMap<Option<NodeId>, NodeMap> = FxHashMap::default();

        let default_format = |value: i64, _: &str| value.to_string();
        let format: &dyn Fn(i64, &str) -> String = match options.format_tag {
            Some(format) => format,
            None => &default_format,
        };

        for sample in profile.samples.iter() {
            let weight = (options.sample_value)(&sample.values);
            if weight == 0 {
                continue;
            }
            let labels = join_labels(sample);

            let mut parent: Option<NodeId> = None;
            let mut residual = false;
            for location in sample.locations.iter().rev() {
                let Some(location) = profile.locations.get(location.to_offset()) else {
                    continue;
                };
                let lines = location_lines(location);
                for (index, line) in lines.iter().enumerate().rev() {
                    let node_map = children.entry(parent).or_default();
                    let Some(node) =
                        self.find_or_insert_line(node_map, profile, location, *line, options)
                    else {
                        residual = true;
                        continue;
                    };
                    self.add_sample(node, weight, &labels, sample, format, false);
                    if let Some(parent) = parent {
                        let inline = index != lines.len() - 1;
                        self.add_to_edge(parent, node, weight, residual, inline);
                    }
                    parent = Some(node);
                    residual = false;
                }
            }
            if let Some(leaf) = parent {
                if !residual {
                    self.add_sample(leaf, weight, &labels, sample, format, true);
                }
            }
        }
    }

    fn find_or_insert_line(
        &mut self,
        node_map: &mut NodeMap,
        profile: &Profile,
        location: &Location,
        line: Option<Line>,
        options: &Options,
    ) -> Option<NodeId> {
        let info = node_info(profile, location, line, options);
        self.find_or_insert_node(node_map, info, options.kept_nodes)
    }

    /// Looks up the node for `info`, creating it unless a keep-set excludes
    /// it. New nodes are linked to the node of their whole function.
    fn find_or_insert_node(
        &mut self,
        node_map: &mut NodeMap,
        info: NodeInfo,
        kept: Option<&NodeSet>,
    ) -> Option<NodeId> {
        if let Some(kept) = kept {
            if !kept.contains(&info) {
                return None;
            }
        }
        if let Some(node) = node_map.get(&info) {
            return Some(*node);
        }

        let node = self.push_node(info.clone());
        node_map.insert(info.clone(), node);
        if info.address != 0 || info.lineno != 0 {
            let function_info = NodeInfo {
                address: 0,
                lineno: 0,
                ..info
            };
            if let Some(function) = self.find_or_insert_node(node_map, function_info, None) {
                self.node_mut(node).function = function;
            }
        }
        Some(node)
    }

    fn add_sample(
        &mut self,
        node: NodeId,
        weight: i64,
        labels: &str,
        sample: &Sample,
        format: &dyn Fn(i64, &str) -> String,
        flat: bool,
    ) {
        let add = |flat_weight: &mut i64, cum_weight: &mut i64| {
            if flat {
                *flat_weight = flat_weight.saturating_add(weight);
            } else {
                *cum_weight = cum_weight.saturating_add(weight);
            }
        };

        let node = self.node_mut(node);
        add(&mut node.flat, &mut node.cum);

        if !labels.is_empty() {
            let tag = find_or_add_tag(&mut node.label_tags, labels, "", 0);
            add(&mut tag.flat, &mut tag.cum);
        }

        if sample.num_labels.is_empty() {
            return;
        }
        let numeric_tags = node.numeric_tags.entry(labels.to_string()).or_default();
        for (key, values) in sample.num_labels.iter() {
            let units = sample.num_units.get(key);
            for (index, value) in values.iter().enumerate() {
                let unit = units
                    .and_then(|units| units.get(index))
                    .map_or(key.as_str(), |unit| unit.as_str());
                let tag = find_or_add_tag(numeric_tags, &format(*value, unit), unit, *value);
                add(&mut tag.flat, &mut tag.cum);
            }
        }
    }

    /// Moves every node with weight into the graph, in creation order, and
    /// detaches the others.
    fn select_nodes(&mut self, drop_negative: bool) {
        let mut dropped = Vec::new();
        for offset in 0..self.arena.len() {
            let id = NodeId::from_offset(offset);
            let node = self.node(id);
            let empty = node.cum == 0 && node.flat == 0;
            if empty || (drop_negative && node.is_negative()) {
                dropped.push(id);
            } else {
                self.nodes.push(id);
            }
        }
        for id in dropped {
            self.detach_node(id);
        }
    }

    /// Removes every edge touching `id`.
    fn detach_node(&mut self, id: NodeId) {
        let node = self.node(id);
        let edges: Vec<_> = node
            .incoming()
            .values()
            .chain(node.outgoing().values())
            .copied()
            .collect();
        for edge in edges {
            self.remove_edge(edge);
        }
    }
}

/// The lines a location expands into, outermost last. A location without
/// lines still yields one node carrying its address.
fn location_lines(location: &Location) -> Vec<Option<Line>> {
    if location.lines.is_empty() {
        vec![None]
    } else {
        location.lines.iter().copied().map(Some).collect()
    }
}

fn node_info(
    profile: &Profile,
    location: &Location,
    line: Option<Line>,
    options: &Options,
) -> NodeInfo {
    let objfile = location
        .mapping
        .and_then(|m| profile.get_mapping(m))
        .map(|m| m.file.clone())
        .unwrap_or_default();
    let function = line.and_then(|l| {
        let function = profile.get_function(l.function?)?;
        Some((l.line, function))
    });
    let Some((lineno, function)) = function else {
        return NodeInfo {
            address: location.address,
            objfile,
            ..NodeInfo::default()
        };
    };

    let mut info = NodeInfo {
        name: function.name.clone(),
        address: location.address,
        lineno,
        ..NodeInfo::default()
    };
    if !function.filename.is_empty() {
        info.file = clean_path(&function.filename);
    }
    if options.orig_fn_names {
        info.orig_name = function.system_name.clone();
    }
    if options.obj_names || (info.name.is_empty() && info.orig_name.is_empty()) {
        info.objfile = objfile;
        info.start_line = function.start_line;
    }
    info
}

/// The sample's string labels as sorted `key:value` entries, one per line.
pub fn join_labels(sample: &Sample) -> String {
    let mut labels: Vec<String> = sample
        .labels
        .iter()
        .flat_map(|(key, values)| values.iter().map(move |v| format!("{key}:{v}")))
        .collect();
    labels.sort_unstable();
    labels.join("\n")
}

/// Lexically simplifies a slash-separated path: repeated separators, `.`
/// and resolvable `..` elements are removed.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            _ => parts.push(part),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
