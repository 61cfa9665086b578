// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

use crate::profile::{Profile, ValueType};

/// The sample types present in every profile, in the order of the first
/// profile.
fn common_sample_types(profiles: &[Profile]) -> Vec<ValueType> {
    let Some((first, rest)) = profiles.split_first() else {
        return Vec::new();
    };
    first
        .sample_types
        .iter()
        .filter(|st| rest.iter().all(|p| p.sample_types.contains(st)))
        .cloned()
        .collect()
}

/// For each common sample type, the column of `profile` it comes from.
fn column_remap(profile: &Profile, common: &[ValueType]) -> anyhow::Result<Vec<usize>> {
    common
        .iter()
        .map(|st| match profile.sample_types.iter().position(|p| p == st) {
            Some(index) => Ok(index),
            None => anyhow::bail!("sample type {}/{} not found in profile", st.r#type, st.unit),
        })
        .collect()
}

/// Projects every profile onto the sample types they all share. The shared
/// types keep the relative order of the first profile, and each sample's
/// values are reordered and trimmed to match. Either every profile is
/// rewritten or, on error, none is.
pub fn compatibilize_sample_types(profiles: &mut [Profile]) -> anyhow::Result<()> {
    let common = common_sample_types(profiles);
    if common.is_empty() {
        anyhow::bail!("profiles have empty common sample type list");
    }

    let remaps = profiles
        .iter()
        .map(|p| column_remap(p, &common))
        .collect::<anyhow::Result<Vec<_>>>()?;

    for (profile, remap) in profiles.iter_mut().zip(remaps) {
        apply_remap(profile, &common, &remap);
    }
    Ok(())
}

fn apply_remap(profile: &mut Profile, common: &[ValueType], remap: &[usize]) {
    let unchanged = remap.len() == profile.sample_types.len()
        && remap.iter().enumerate().all(|(i, index)| i == *index);
    if !unchanged {
        log::debug!(
            "projecting {} sample types onto {} common ones",
            profile.sample_types.len(),
            common.len()
        );
        for sample in profile.samples.iter_mut() {
            // Samples with the wrong number of values are malformed; keep
            // whatever columns exist and zero the rest.
            let values = remap
                .iter()
                .map(|index| sample.values.get(*index).copied().unwrap_or(0))
                .collect();
            sample.values = values;
        }
        profile.sample_types = common.to_vec();
    }

    // An empty default means the last type, which projection may change.
    let default_is_common = common
        .iter()
        .any(|st| st.r#type == profile.default_sample_type);
    if !default_is_common {
        profile.default_sample_type = common[0].r#type.clone();
    }
}
