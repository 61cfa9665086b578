// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

//! Combines independently collected profiles into one. Mappings, functions
//! and locations are deduplicated by content, never by their original ids,
//! and samples are carried over unchanged apart from their location handles.

mod compat;

pub use compat::*;

use crate::collections::identifiable::{FxHashMap, Id};
use crate::profile::{
    Function, FunctionId, Line, Location, LocationId, Mapping, MappingId, Profile, Sample,
    ValueType,
};

/// Identity of a binary across profiles.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum MappingKey {
    Build { file: String, build_id: String },
    File(String),
    /// Mappings with neither file nor build id all merge into one.
    Fake,
}

impl From<&Mapping> for MappingKey {
    fn from(m: &Mapping) -> Self {
        if m.is_fake() {
            MappingKey::Fake
        } else if m.build_id.is_empty() {
            MappingKey::File(m.file.clone())
        } else {
            MappingKey::Build {
                file: m.file.clone(),
                build_id: m.build_id.clone(),
            }
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct FunctionKey {
    name: String,
    system_name: String,
    filename: String,
    start_line: i64,
}

impl From<&Function> for FunctionKey {
    fn from(f: &Function) -> Self {
        Self {
            name: f.name.clone(),
            system_name: f.system_name.clone(),
            filename: f.filename.clone(),
            start_line: f.start_line,
        }
    }
}

/// Identity of a location after its mapping and functions were merged.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct LocationKey {
    mapping: Option<MappingId>,
    address: u64,
    lines: Vec<Line>,
    is_folded: bool,
}

/// A source mapping resolved to the merged mapping, plus the distance
/// between their load addresses.
#[derive(Copy, Clone, Debug)]
struct MappingInfo {
    id: MappingId,
    offset: u64,
}

struct ProfileMerger {
    profile: Profile,
    mappings: FxHashMap<MappingKey, MappingId>,
    functions: FxHashMap<FunctionKey, FunctionId>,
    locations: FxHashMap<LocationKey, LocationId>,
}

/// Per-source lookups, indexed by the source's own handles. Interchange ids
/// are unreliable here: they can be sparse, and entries added after parsing
/// may reuse the numbering of another profile.
struct SourceIds {
    mappings: Vec<Option<MappingInfo>>,
    functions: Vec<Option<FunctionId>>,
}

impl SourceIds {
    fn new(src: &Profile) -> Self {
        Self {
            mappings: vec![None; src.mappings.len()],
            functions: vec![None; src.functions.len()],
        }
    }
}

impl ProfileMerger {
    fn new(header: Profile) -> Self {
        Self {
            profile: header,
            mappings: Default::default(),
            functions: Default::default(),
            locations: Default::default(),
        }
    }

    fn map_mapping(
        &mut self,
        ids: &mut SourceIds,
        src_profile: &Profile,
        handle: MappingId,
    ) -> Option<MappingInfo> {
        let slot = ids.mappings.get_mut(handle.to_offset())?;
        if let Some(info) = *slot {
            return Some(info);
        }
        let src = src_profile.get_mapping(handle)?;

        let key = MappingKey::from(src);
        let info = match self.mappings.get(&key) {
            Some(id) => MappingInfo {
                id: *id,
                offset: self.profile.mapping(*id).start.wrapping_sub(src.start),
            },
            None => {
                let id = self.profile.add_mapping(Mapping {
                    id: 0,
                    ..src.clone()
                });
                self.mappings.insert(key, id);
                MappingInfo { id, offset: 0 }
            }
        };
        *slot = Some(info);
        Some(info)
    }

    fn map_function(
        &mut self,
        ids: &mut SourceIds,
        src_profile: &Profile,
        handle: FunctionId,
    ) -> Option<FunctionId> {
        let slot = ids.functions.get_mut(handle.to_offset())?;
        if let Some(id) = *slot {
            return Some(id);
        }
        let src = src_profile.get_function(handle)?;

        let key = FunctionKey::from(src);
        let id = match self.functions.get(&key) {
            Some(id) => *id,
            None => {
                let id = self.profile.add_function(Function {
                    id: 0,
                    ..src.clone()
                });
                self.functions.insert(key, id);
                id
            }
        };
        *slot = Some(id);
        Some(id)
    }

    fn map_location(
        &mut self,
        ids: &mut SourceIds,
        src_profile: &Profile,
        src: &Location,
    ) -> LocationId {
        let mapped = src
            .mapping
            .and_then(|m| self.map_mapping(ids, src_profile, m));
        let (mapping, address) = match mapped {
            Some(info) => (Some(info.id), src.address.wrapping_add(info.offset)),
            None => (None, src.address),
        };
        let lines = src
            .lines
            .iter()
            .map(|line| Line {
                function: line
                    .function
                    .and_then(|f| self.map_function(ids, src_profile, f)),
                line: line.line,
            })
            .collect::<Vec<_>>();

        let key = LocationKey {
            mapping,
            address,
            lines,
            is_folded: src.is_folded,
        };
        if let Some(id) = self.locations.get(&key) {
            return *id;
        }
        let id = self.profile.add_location(Location {
            id: 0,
            mapping: key.mapping,
            address: key.address,
            lines: key.lines.clone(),
            is_folded: key.is_folded,
        });
        self.locations.insert(key, id);
        id
    }

    fn merge_profile(&mut self, src: &Profile) {
        let mut ids = SourceIds::new(src);

        for offset in 0..src.mappings.len() {
            self.map_mapping(&mut ids, src, MappingId::from_offset(offset));
        }

        let locations = src
            .locations
            .iter()
            .map(|location| self.map_location(&mut ids, src, location))
            .collect::<Vec<_>>();

        let mut dangling = 0usize;
        self.profile.samples.reserve(src.samples.len());
        for sample in src.samples.iter() {
            let mut merged = Vec::with_capacity(sample.locations.len());
            for location in sample.locations.iter() {
                match locations.get(location.to_offset()) {
                    Some(id) => merged.push(*id),
                    None => dangling += 1,
                }
            }
            self.profile.samples.push(Sample {
                locations: merged,
                ..sample.clone()
            });
        }
        if dangling > 0 {
            log::warn!("skipped {dangling} sample frames pointing at missing locations");
        }
    }
}

/// Builds the header of the merged profile. Everything but the samples and
/// their structural tables is decided here.
fn combine_headers(profiles: &[Profile]) -> anyhow::Result<Profile> {
    let Some(first) = profiles.first() else {
        anyhow::bail!("no profiles to merge");
    };

    let mut period_type: Option<&ValueType> = None;
    for p in profiles.iter() {
        match (period_type, p.period_type.as_ref()) {
            (Some(seen), Some(pt)) if seen != pt => anyhow::bail!(
                "incompatible period types {}/{} and {}/{}",
                seen.r#type,
                seen.unit,
                pt.r#type,
                pt.unit
            ),
            (None, Some(pt)) => period_type = Some(pt),
            _ => {}
        }
    }

    let mut header = Profile {
        sample_types: first.sample_types.clone(),
        default_sample_type: first.default_sample_type.clone(),
        drop_frames: first.drop_frames.clone(),
        keep_frames: first.keep_frames.clone(),
        period_type: period_type.cloned(),
        ..Profile::default()
    };

    for p in profiles.iter() {
        if p.time_nanos != 0 && (header.time_nanos == 0 || p.time_nanos < header.time_nanos) {
            header.time_nanos = p.time_nanos;
        }
        header.duration_nanos = header.duration_nanos.saturating_add(p.duration_nanos);
        header.period = header.period.max(p.period);
        for comment in p.comments.iter() {
            if !header.comments.contains(comment) {
                header.comments.push(comment.clone());
            }
        }
    }
    Ok(header)
}

/// Merges the profiles into a new one. The inputs are not modified: they are
/// copied and projected onto their common sample types first, which fails if
/// they have none in common. Samples keep their order and multiplicity, so
/// the merged values always add up to the sum of the inputs' values.
pub fn merge(profiles: &[Profile]) -> anyhow::Result<Profile> {
    if profiles.is_empty() {
        anyhow::bail!("no profiles to merge");
    }

    let mut copies = profiles.to_vec();
    compatibilize_sample_types(&mut copies)?;
    let header = combine_headers(&copies)?;

    let mut merger = ProfileMerger::new(header);
    for src in copies.iter() {
        merger.merge_profile(src);
    }

    let merged = merger.profile;
    log::debug!(
        "merged {} profiles into {} samples, {} locations, {} functions and {} mappings",
        profiles.len(),
        merged.samples.len(),
        merged.locations.len(),
        merged.functions.len(),
        merged.mappings.len()
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::test_utils::ProfileBuilder;
    use maplit::btreemap;

    fn two_frame_profile(file: &str, build_id: &str, start: u64, values: &[i64]) -> Profile {
        let mut builder = ProfileBuilder::new(&[("samples", "count"), ("cpu", "nanoseconds")])
            .with_mapping(file, build_id, start);
        builder.sample(&["main", "work"], values);
        builder.sample(&["main"], values);
        builder.build()
    }

    #[test]
    fn merge_conserves_weight() -> anyhow::Result<()> {
        let a = two_frame_profile("/bin/app", "b1", 0x1000, &[1, 10]);
        let b = two_frame_profile("/bin/app", "b1", 0x9000, &[2, 20]);
        let c = two_frame_profile("/lib/other.so", "", 0x5000, &[4, 40]);

        let merged = merge(&[a.clone(), b.clone(), c.clone()])?;
        assert_eq!(6, merged.samples.len());
        let expected: Vec<i64> = (0..2)
            .map(|i| a.total_values()[i] + b.total_values()[i] + c.total_values()[i])
            .collect();
        assert_eq!(expected, merged.total_values());
        Ok(())
    }

    #[test]
    fn merge_with_self_doubles_samples_not_structure() -> anyhow::Result<()> {
        let p = two_frame_profile("/bin/app", "b1", 0x1000, &[1, 10]);
        let merged = merge(&[p.clone(), p.clone()])?;

        assert_eq!(1, merged.mappings.len());
        assert_eq!(p.locations.len(), merged.locations.len());
        assert_eq!(p.functions.len(), merged.functions.len());
        assert_eq!(p.samples.len() * 2, merged.samples.len());
        assert_eq!(merged.samples[0].locations, merged.samples[2].locations);
        assert_eq!(vec![4, 40], merged.total_values());
        Ok(())
    }

    #[test]
    fn relocated_binary_shares_locations() -> anyhow::Result<()> {
        let a = two_frame_profile("/bin/app", "b1", 0x1000, &[1, 10]);
        let b = two_frame_profile("/bin/app", "b1", 0x7000, &[1, 10]);

        let merged = merge(&[a.clone(), b])?;
        assert_eq!(1, merged.mappings.len());
        assert_eq!(0x1000, merged.mappings[0].start);
        assert_eq!(a.locations.len(), merged.locations.len());
        for (original, location) in a.locations.iter().zip(merged.locations.iter()) {
            assert_eq!(original.address, location.address);
        }
        Ok(())
    }

    #[test]
    fn mapping_key_distinguishes_build_ids_and_fakes() -> anyhow::Result<()> {
        let a = two_frame_profile("/bin/app", "b1", 0x1000, &[1, 1]);
        let b = two_frame_profile("/bin/app", "b2", 0x1000, &[1, 1]);
        let c = two_frame_profile("/bin/app", "", 0x1000, &[1, 1]);
        let d = two_frame_profile("", "", 0x1000, &[1, 1]);
        let e = two_frame_profile("", "", 0x2000, &[1, 1]);

        let merged = merge(&[a, b, c, d, e])?;
        let keys: Vec<_> = merged
            .mappings
            .iter()
            .map(|m| (m.file.as_str(), m.build_id.as_str()))
            .collect();
        assert_eq!(
            vec![("/bin/app", "b1"), ("/bin/app", "b2"), ("/bin/app", ""), ("", "")],
            keys
        );
        let ids: Vec<_> = merged.mappings.iter().map(|m| m.id).collect();
        assert_eq!(vec![1, 2, 3, 4], ids);
        Ok(())
    }

    #[test]
    fn location_key_requires_every_field() -> anyhow::Result<()> {
        let mut a =
            ProfileBuilder::new(&[("samples", "count")]).with_mapping("/bin/app", "b1", 0x1000);
        let base = a.location(0x10, &["f"]);
        a.profile.samples.push(Sample {
            locations: vec![base],
            values: vec![1],
            ..Sample::default()
        });
        let a = a.build();

        let variants: Vec<Box<dyn Fn(&mut Profile)>> = vec![
            Box::new(|_: &mut Profile| {}),
            Box::new(|p: &mut Profile| p.locations[0].address += 4),
            Box::new(|p: &mut Profile| p.locations[0].lines[0].line += 1),
            Box::new(|p: &mut Profile| p.locations[0].is_folded = true),
            Box::new(|p: &mut Profile| p.functions[0].name = "g".into()),
            Box::new(|p: &mut Profile| p.mappings[0].build_id = "b2".into()),
        ];
        let expected_locations = [1, 2, 2, 2, 2, 2];
        for (variant, expected) in variants.iter().zip(expected_locations) {
            let mut b = a.clone();
            variant(&mut b);
            let merged = merge(&[a.clone(), b])?;
            assert_eq!(expected, merged.locations.len());
        }
        Ok(())
    }

    #[test]
    fn samples_keep_order_labels_and_multiplicity() -> anyhow::Result<()> {
        let mut builder = ProfileBuilder::new(&[("samples", "count")]);
        builder.sample(&["main", "work"], &[3]).labels =
            btreemap! { "thread".to_string() => vec!["t1".to_string()] };
        builder.sample(&["main", "work"], &[3]);
        builder.sample(&["main"], &[0]);
        let p = builder.build();

        let merged = merge(&[p.clone()])?;
        assert_eq!(p.samples, merged.samples);
        Ok(())
    }

    #[test]
    fn inputs_are_not_modified() -> anyhow::Result<()> {
        let mut a = ProfileBuilder::new(&[("alloc", "bytes"), ("samples", "count")]);
        a.sample(&["main"], &[64, 1]);
        let mut b = ProfileBuilder::new(&[("samples", "count")]);
        b.sample(&["main"], &[2]);
        let (a, b) = (a.build(), b.build());
        let inputs = [a.clone(), b.clone()];

        let merged = merge(&inputs)?;
        assert_eq!(a, inputs[0]);
        assert_eq!(b, inputs[1]);
        assert_eq!(vec![ValueType::new("samples", "count")], merged.sample_types);
        assert_eq!(vec![3], merged.total_values());
        Ok(())
    }

    #[test]
    fn incompatible_inputs_fail() {
        let a = ProfileBuilder::new(&[("cpu", "nanoseconds")]).build();
        let b = ProfileBuilder::new(&[("alloc", "bytes")]).build();
        merge(&[a, b]).unwrap_err();
        merge(&[]).unwrap_err();

        let mut c = ProfileBuilder::new(&[("cpu", "nanoseconds")]).build();
        let mut d = c.clone();
        c.period_type = Some(ValueType::new("cpu", "nanoseconds"));
        d.period_type = Some(ValueType::new("wall", "nanoseconds"));
        let err = merge(&[c, d]).unwrap_err();
        assert!(err.to_string().contains("incompatible period types"));
    }

    #[test]
    fn headers_are_combined() -> anyhow::Result<()> {
        let mut a = ProfileBuilder::new(&[("cpu", "nanoseconds")]).build();
        let mut b = a.clone();
        a.time_nanos = 2_000;
        a.duration_nanos = 10;
        a.period = 100;
        a.comments = vec!["first".into()];
        a.drop_frames = "runtime\\..*".into();
        b.time_nanos = 1_000;
        b.duration_nanos = 5;
        b.period = 250;
        b.period_type = Some(ValueType::new("cpu", "nanoseconds"));
        b.comments = vec!["first".into(), "second".into()];

        let merged = merge(&[a, b])?;
        assert_eq!(1_000, merged.time_nanos);
        assert_eq!(15, merged.duration_nanos);
        assert_eq!(250, merged.period);
        assert_eq!(Some(ValueType::new("cpu", "nanoseconds")), merged.period_type);
        assert_eq!(vec!["first".to_string(), "second".to_string()], merged.comments);
        assert_eq!("runtime\\..*", merged.drop_frames);
        Ok(())
    }

    #[test]
    fn locations_without_mapping_or_function_merge() -> anyhow::Result<()> {
        let mut p = Profile::new(vec![ValueType::new("samples", "count")]);
        let location = p.add_location(Location {
            address: 0xdead,
            lines: vec![Line {
                function: None,
                line: 7,
            }],
            ..Location::default()
        });
        p.samples.push(Sample {
            locations: vec![location],
            values: vec![1],
            ..Sample::default()
        });

        let merged = merge(&[p.clone(), p])?;
        assert_eq!(1, merged.locations.len());
        assert_eq!(None, merged.locations[0].mapping);
        assert_eq!(2, merged.samples.len());
        Ok(())
    }

    #[test]
    fn sparse_ids_survive_symbolize_and_merge() -> anyhow::Result<()> {
        use crate::symbolize::{symbolize, Frame};

        let mut p = Profile::new(vec![ValueType::new("samples", "count")]);
        for (id, name) in [(2, "a"), (3, "b")] {
            p.add_function(Function {
                id,
                name: name.into(),
                ..Function::default()
            });
        }
        let named = p.add_location(Location {
            id: 5,
            address: 0x10,
            lines: vec![Line {
                function: Some(FunctionId::from_offset(1)),
                line: 1,
            }],
            ..Location::default()
        });
        let bare = p.add_location(Location {
            id: 7,
            address: 0x20,
            ..Location::default()
        });
        p.samples.push(Sample {
            locations: vec![bare, named],
            values: vec![1],
            ..Sample::default()
        });

        let symbolizer = |_: Option<&Mapping>, _: u64| -> anyhow::Result<Vec<Frame>> {
            Ok(vec![Frame {
                function_name: "c".into(),
                file: "c.c".into(),
                line: 9,
            }])
        };
        symbolize(&mut p, &symbolizer);
        let ids: Vec<u64> = p.functions.iter().map(|f| f.id).collect();
        assert_eq!(vec![2, 3, 4], ids);

        let merged = merge(&[p.clone()])?;
        let names: Vec<&str> = merged
            .locations
            .iter()
            .map(|l| merged.function(l.lines[0].function.unwrap()).name.as_str())
            .collect();
        assert_eq!(vec!["b", "c"], names);

        let mut encoded = Vec::new();
        p.encode(&mut encoded)?;
        let reparsed = Profile::parse(&encoded)?;
        assert_eq!(3, reparsed.functions.len());
        Ok(())
    }

    #[test]
    fn dangling_handles_merge_best_effort() -> anyhow::Result<()> {
        let mut p = Profile::new(vec![ValueType::new("samples", "count")]);
        let location = p.add_location(Location {
            mapping: Some(MappingId::from_offset(4)),
            address: 0x30,
            lines: vec![Line {
                function: Some(FunctionId::from_offset(2)),
                line: 3,
            }],
            ..Location::default()
        });
        p.samples.push(Sample {
            locations: vec![LocationId::from_offset(3), location],
            values: vec![2],
            ..Sample::default()
        });

        let merged = merge(&[p])?;
        assert_eq!(1, merged.samples.len());
        assert_eq!(1, merged.samples[0].locations.len());
        assert_eq!(vec![2], merged.total_values());
        let location = &merged.locations[0];
        assert_eq!(None, location.mapping);
        assert_eq!(0x30, location.address);
        assert_eq!(
            vec![Line {
                function: None,
                line: 3
            }],
            location.lines
        );
        assert!(merged.mappings.is_empty());
        Ok(())
    }

    #[test]
    fn merge_conserves_weight_for_arbitrary_values() {
        bolero::check!()
            .with_type::<Vec<(u8, i32, i32)>>()
            .for_each(|samples| {
                let mut left = ProfileBuilder::new(&[("samples", "count")]);
                let mut right = ProfileBuilder::new(&[("samples", "count")]);
                let stacks: [&[&str]; 4] =
                    [&["main"], &["main", "a"], &["main", "b"], &["main", "a", "b"]];
                let mut expected = 0i64;
                for (stack, l, r) in samples.iter() {
                    let stack = stacks[*stack as usize % stacks.len()];
                    left.sample(stack, &[*l as i64]);
                    right.sample(stack, &[*r as i64]);
                    expected += *l as i64 + *r as i64;
                }
                #[allow(clippy::unwrap_used)]
                let merged = merge(&[left.build(), right.build()]).unwrap();
                assert_eq!(samples.len() * 2, merged.samples.len());
                assert_eq!(vec![expected], merged.total_values());
            });
    }
}
