// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// When nodes with negative weight leave the graph. Negative weights come
/// from diffed profiles; dropping them before selection frees their slots
/// for other nodes.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeNodes {
    #[default]
    Keep,
    DropBeforeSelection,
    DropAfterSelection,
}

/// Settings for [crate::graph::pipeline::reduce]. Every field is optional
/// in the serialized form.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReductionConfig {
    /// Sample type to weigh samples by, as a type name or an index. The
    /// profile's default when unset.
    pub sample_index: Option<String>,

    /// Nodes whose cum weight is below this fraction of the total are
    /// dropped.
    pub node_fraction: f64,

    /// Edges whose weight is below this fraction of the total are dropped.
    pub edge_fraction: f64,

    /// Maximum number of nodes to keep.
    pub node_count: usize,

    pub cum_sort: bool,

    /// Shape the graph for drawing: sort by entropy, let tags take up node
    /// slots and remove redundant edges.
    pub visual_mode: bool,

    pub call_tree: bool,
    pub obj_names: bool,
    pub orig_fn_names: bool,
    pub negative_nodes: NegativeNodes,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            sample_index: None,
            node_fraction: 0.005,
            edge_fraction: 0.001,
            node_count: 80,
            cum_sort: false,
            visual_mode: false,
            call_tree: false,
            obj_names: false,
            orig_fn_names: false,
            negative_nodes: NegativeNodes::Keep,
        }
    }
}

impl ReductionConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid reduction config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, fraction) in [
            ("node_fraction", self.node_fraction),
            ("edge_fraction", self.edge_fraction),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                anyhow::bail!("{name} must be within [0, 1], got {fraction}");
            }
        }
        Ok(())
    }
}
