// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

use crate::collections::identifiable::FxIndexMap;

/// Weight carried by a node for one label set or one numeric label value.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tag {
    pub name: String,
    pub unit: String,
    pub value: i64,
    pub flat: i64,
    pub cum: i64,
}

/// Tags keyed by name.
pub type TagMap = FxIndexMap<String, Tag>;

pub(crate) fn find_or_add_tag<'a>(
    tags: &'a mut TagMap,
    label: &str,
    unit: &str,
    value: i64,
) -> &'a mut Tag {
    tags.entry(label.to_string()).or_insert_with(|| Tag {
        name: label.to_string(),
        unit: unit.to_string(),
        value,
        flat: 0,
        cum: 0,
    })
}

/// Sorts tags heaviest first, by flat weight or else by cumulative weight
/// with flat weight as tie-breaker, then by name.
pub fn sort_tags(mut tags: Vec<&Tag>, flat: bool) -> Vec<&Tag> {
    tags.sort_by(|l, r| {
        let by_cum = if flat {
            std::cmp::Ordering::Equal
        } else {
            r.cum.unsigned_abs().cmp(&l.cum.unsigned_abs())
        };
        by_cum
            .then_with(|| r.flat.unsigned_abs().cmp(&l.flat.unsigned_abs()))
            .then_with(|| l.name.cmp(&r.name))
    });
    tags
}

/// Drops the tags whose flat and cumulative weights are both below `cutoff`
/// in absolute value.
pub(crate) fn retain_frequent_tags(tags: &mut TagMap, cutoff: i64) {
    tags.retain(|_, t| super::reaches(t.flat, cutoff) || super::reaches(t.cum, cutoff));
}
