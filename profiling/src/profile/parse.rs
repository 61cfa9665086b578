// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

use super::*;
use crate::collections::identifiable::{FxHashMap, Id, StringTable};
use crate::pprof;
use anyhow::Context;
use std::collections::BTreeMap;

/// Lookup tables from interchange ids to arena handles, built while
/// converting a [pprof::Profile].
struct ProfileIndex<'pprof> {
    pprof: &'pprof pprof::Profile,
    mappings: FxHashMap<u64, MappingId>,
    functions: FxHashMap<u64, FunctionId>,
    locations: FxHashMap<u64, LocationId>,
}

impl<'pprof> ProfileIndex<'pprof> {
    fn new(pprof: &'pprof pprof::Profile) -> Self {
        Self {
            pprof,
            mappings: Default::default(),
            functions: Default::default(),
            locations: Default::default(),
        }
    }

    fn get_string(&self, id: i64) -> anyhow::Result<String> {
        if id == 0 {
            return Ok(String::new());
        }
        match usize::try_from(id) {
            Ok(index) => match self.pprof.string_table.get(index) {
                Some(str) => Ok(str.clone()),
                None => anyhow::bail!("pprof did not contain string index {index}"),
            },
            Err(err) => {
                anyhow::bail!("index to pprof string table {id} failed to convert to usize: {err}")
            }
        }
    }

    fn get_value_type(&self, vt: &pprof::ValueType) -> anyhow::Result<ValueType> {
        Ok(ValueType {
            r#type: self.get_string(vt.r#type)?,
            unit: self.get_string(vt.unit)?,
        })
    }

    fn get_mapping(&self, id: u64) -> anyhow::Result<Option<MappingId>> {
        if id == 0 {
            return Ok(None);
        }
        match self.mappings.get(&id) {
            None => anyhow::bail!("pprof did not contain mapping id {id}"),
            Some(item) => Ok(Some(*item)),
        }
    }

    fn get_function(&self, id: u64) -> anyhow::Result<Option<FunctionId>> {
        if id == 0 {
            return Ok(None);
        }
        match self.functions.get(&id) {
            None => anyhow::bail!("pprof did not contain function id {id}"),
            Some(item) => Ok(Some(*item)),
        }
    }

    fn get_location(&self, id: u64) -> anyhow::Result<LocationId> {
        match self.locations.get(&id) {
            None => anyhow::bail!("pprof did not contain location id {id}"),
            Some(item) => Ok(*item),
        }
    }
}

fn register<H: Copy>(
    ids: &mut FxHashMap<u64, H>,
    kind: &str,
    id: u64,
    handle: H,
) -> anyhow::Result<()> {
    if id == 0 {
        anyhow::bail!("pprof {kind} has reserved id 0");
    }
    if ids.insert(id, handle).is_some() {
        anyhow::bail!("multiple pprof {kind}s were found with id {id}");
    }
    Ok(())
}

impl TryFrom<&pprof::Profile> for Profile {
    type Error = anyhow::Error;

    fn try_from(pprof: &pprof::Profile) -> anyhow::Result<Self> {
        match pprof.string_table.first() {
            Some(first) if first.is_empty() => {}
            Some(_) => anyhow::bail!("pprof string table does not start with the empty string"),
            None if pprof.samples.is_empty() && pprof.sample_types.is_empty() => {}
            None => anyhow::bail!("pprof string table is empty"),
        }

        let mut index = ProfileIndex::new(pprof);
        let mut profile = Profile::default();

        for vt in pprof.sample_types.iter() {
            profile.sample_types.push(index.get_value_type(vt)?);
        }
        profile.default_sample_type = index.get_string(pprof.default_sample_type)?;

        for m in pprof.mappings.iter() {
            let mapping = Mapping {
                id: m.id,
                start: m.memory_start,
                limit: m.memory_limit,
                offset: m.file_offset,
                file: index.get_string(m.filename)?,
                build_id: index.get_string(m.build_id)?,
                has_functions: m.has_functions,
                has_filenames: m.has_filenames,
                has_line_numbers: m.has_line_numbers,
                has_inline_frames: m.has_inline_frames,
            };
            // An all-zero range is what producers emit when they don't know
            // where the binary was loaded.
            let placeholder = mapping.start == 0 && mapping.limit == 0;
            if !placeholder && mapping.start >= mapping.limit {
                anyhow::bail!(
                    "pprof mapping {} has an empty or inverted range {:#x}..{:#x}",
                    m.id,
                    mapping.start,
                    mapping.limit
                );
            }
            let handle = MappingId::from_offset(profile.mappings.len());
            register(&mut index.mappings, "mapping", m.id, handle)?;
            profile.mappings.push(mapping);
        }

        for f in pprof.functions.iter() {
            let function = Function {
                id: f.id,
                name: index.get_string(f.name)?,
                system_name: index.get_string(f.system_name)?,
                filename: index.get_string(f.filename)?,
                start_line: f.start_line,
            };
            let handle = FunctionId::from_offset(profile.functions.len());
            register(&mut index.functions, "function", f.id, handle)?;
            profile.functions.push(function);
        }

        for l in pprof.locations.iter() {
            let lines = l
                .lines
                .iter()
                .map(|line| {
                    Ok(Line {
                        function: index.get_function(line.function_id)?,
                        line: line.line,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("invalid line in pprof location {}", l.id))?;
            let location = Location {
                id: l.id,
                mapping: index
                    .get_mapping(l.mapping_id)
                    .with_context(|| format!("invalid pprof location {}", l.id))?,
                address: l.address,
                lines,
                is_folded: l.is_folded,
            };
            let handle = LocationId::from_offset(profile.locations.len());
            register(&mut index.locations, "location", l.id, handle)?;
            profile.locations.push(location);
        }

        for (offset, s) in pprof.samples.iter().enumerate() {
            let sample = sample_from_pprof(&index, s)
                .with_context(|| format!("invalid pprof sample at offset {offset}"))?;
            if sample.values.len() != profile.sample_types.len() {
                anyhow::bail!(
                    "pprof sample at offset {offset} has {} values, expected {}",
                    sample.values.len(),
                    profile.sample_types.len()
                );
            }
            profile.samples.push(sample);
        }

        profile.drop_frames = index.get_string(pprof.drop_frames)?;
        profile.keep_frames = index.get_string(pprof.keep_frames)?;
        profile.time_nanos = pprof.time_nanos;
        profile.duration_nanos = pprof.duration_nanos;
        profile.period_type = pprof
            .period_type
            .as_ref()
            .map(|vt| index.get_value_type(vt))
            .transpose()?;
        profile.period = pprof.period;
        profile.comments = pprof
            .comment
            .iter()
            .map(|id| index.get_string(*id))
            .collect::<anyhow::Result<_>>()?;

        Ok(profile)
    }
}

fn sample_from_pprof(index: &ProfileIndex, s: &pprof::Sample) -> anyhow::Result<Sample> {
    let mut sample = Sample {
        locations: s
            .location_ids
            .iter()
            .map(|id| index.get_location(*id))
            .collect::<anyhow::Result<_>>()?,
        values: s.values.clone(),
        ..Sample::default()
    };

    let mut units: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut has_units = false;
    for label in s.labels.iter() {
        let key = index.get_string(label.key)?;
        // A string label with an empty value is encoded with every field
        // but the key at zero.
        if label.num != 0 || label.num_unit != 0 {
            let unit = index.get_string(label.num_unit)?;
            has_units |= !unit.is_empty();
            sample.num_labels.entry(key.clone()).or_default().push(label.num);
            units.entry(key).or_default().push(unit);
        } else {
            let value = index.get_string(label.str)?;
            sample.labels.entry(key).or_default().push(value);
        }
    }
    if has_units {
        sample.num_units = units;
    }
    Ok(sample)
}

impl Profile {
    /// Parses a serialized profile, gzip-compressed or not, validating that
    /// every id it refers to exists.
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let pprof = pprof::Profile::decode_maybe_compressed(bytes)?;
        let profile = Profile::try_from(&pprof)?;
        log::debug!(
            "parsed profile with {} samples, {} locations, {} functions and {} mappings",
            profile.samples.len(),
            profile.locations.len(),
            profile.functions.len(),
            profile.mappings.len()
        );
        Ok(profile)
    }

    /// Converts the profile into its interchange message, building the
    /// string table along the way.
    pub fn to_pprof(&self) -> pprof::Profile {
        let mut strings = StringTable::with_capacity(self.functions.len() * 2 + 16);
        let mut intern = |s: &str| strings.intern(s).to_raw_id();

        let sample_types = self
            .sample_types
            .iter()
            .map(|vt| pprof::ValueType {
                r#type: intern(&vt.r#type),
                unit: intern(&vt.unit),
            })
            .collect();

        let samples = self
            .samples
            .iter()
            .map(|s| {
                let mut labels = Vec::new();
                for (key, values) in s.labels.iter() {
                    for value in values {
                        labels.push(pprof::Label {
                            key: intern(key),
                            str: intern(value),
                            ..pprof::Label::default()
                        });
                    }
                }
                for (key, nums) in s.num_labels.iter() {
                    let units = s.num_units.get(key);
                    for (i, num) in nums.iter().enumerate() {
                        let unit = units
                            .and_then(|units| units.get(i))
                            .map(String::as_str)
                            .unwrap_or("");
                        labels.push(pprof::Label {
                            key: intern(key),
                            num: *num,
                            num_unit: intern(unit),
                            ..pprof::Label::default()
                        });
                    }
                }
                pprof::Sample {
                    location_ids: s
                        .locations
                        .iter()
                        .filter_map(|l| self.get_location(*l).map(|l| l.id))
                        .collect(),
                    values: s.values.clone(),
                    labels,
                }
            })
            .collect();

        let mappings = self
            .mappings
            .iter()
            .map(|m| pprof::Mapping {
                id: m.id,
                memory_start: m.start,
                memory_limit: m.limit,
                file_offset: m.offset,
                filename: intern(&m.file),
                build_id: intern(&m.build_id),
                has_functions: m.has_functions,
                has_filenames: m.has_filenames,
                has_line_numbers: m.has_line_numbers,
                has_inline_frames: m.has_inline_frames,
            })
            .collect();

        let locations = self
            .locations
            .iter()
            .map(|l| pprof::Location {
                id: l.id,
                mapping_id: l
                    .mapping
                    .and_then(|m| self.get_mapping(m))
                    .map_or(0, |m| m.id),
                address: l.address,
                lines: l
                    .lines
                    .iter()
                    .map(|line| pprof::Line {
                        function_id: line
                            .function
                            .and_then(|f| self.get_function(f))
                            .map_or(0, |f| f.id),
                        line: line.line,
                    })
                    .collect(),
                is_folded: l.is_folded,
            })
            .collect();

        let functions = self
            .functions
            .iter()
            .map(|f| pprof::Function {
                id: f.id,
                name: intern(&f.name),
                system_name: intern(&f.system_name),
                filename: intern(&f.filename),
                start_line: f.start_line,
            })
            .collect();

        let drop_frames = intern(&self.drop_frames);
        let keep_frames = intern(&self.keep_frames);
        let period_type = self.period_type.as_ref().map(|vt| pprof::ValueType {
            r#type: intern(&vt.r#type),
            unit: intern(&vt.unit),
        });
        let comment = self.comments.iter().map(|c| intern(c)).collect();
        let default_sample_type = intern(&self.default_sample_type);

        pprof::Profile {
            sample_types,
            samples,
            mappings,
            locations,
            functions,
            string_table: strings.into_pprof_vec(),
            drop_frames,
            keep_frames,
            time_nanos: self.time_nanos,
            duration_nanos: self.duration_nanos,
            period_type,
            period: self.period,
            comment,
            default_sample_type,
        }
    }

    /// Encodes the profile as an uncompressed protobuf message.
    pub fn encode(&self, buffer: &mut Vec<u8>) -> anyhow::Result<()> {
        self.to_pprof().write_to_vec(buffer)
    }

    /// Encodes the profile the way pprof files are stored: gzipped protobuf.
    pub fn serialize_compressed(&self) -> anyhow::Result<Vec<u8>> {
        self.to_pprof().write_compressed()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::ProfileBuilder;
    use super::*;
    use maplit::btreemap;

    fn labelled_profile() -> Profile {
        let mut builder = ProfileBuilder::new(&[("samples", "count"), ("cpu", "nanoseconds")])
            .with_mapping("/usr/bin/app", "abc123", 0x400000);
        let sample = builder.sample(&["main", "work"], &[1, 1000]);
        sample.labels = btreemap! { "thread".to_string() => vec!["worker-1".to_string()] };
        sample.num_labels = btreemap! { "bytes".to_string() => vec![512, 1024] };
        sample.num_units = btreemap! {
            "bytes".to_string() => vec!["bytes".to_string(), "bytes".to_string()],
        };
        builder.sample(&["main"], &[2, 3000]);
        let mut profile = builder.build();
        profile.period_type = Some(ValueType::new("cpu", "nanoseconds"));
        profile.period = 10_000_000;
        profile.time_nanos = 1_700_000_000_000_000_000;
        profile.duration_nanos = 60_000_000_000;
        profile.comments = vec!["collected in tests".into()];
        profile.default_sample_type = "cpu".into();
        profile
    }

    #[test]
    fn serialize_then_parse_preserves_content() -> anyhow::Result<()> {
        let profile = labelled_profile();
        let bytes = profile.serialize_compressed()?;
        let parsed = Profile::parse(&bytes)?;
        assert_eq!(profile, parsed);
        Ok(())
    }

    #[test]
    fn numeric_units_are_dropped_when_all_empty() -> anyhow::Result<()> {
        let mut profile = labelled_profile();
        profile.samples[0].num_units.clear();
        let mut buffer = Vec::new();
        profile.encode(&mut buffer)?;
        let parsed = Profile::parse(&buffer)?;
        assert!(parsed.samples[0].num_units.is_empty());
        assert_eq!(vec![512, 1024], parsed.samples[0].num_labels["bytes"]);
        Ok(())
    }

    #[test]
    fn empty_string_labels_stay_string_labels() -> anyhow::Result<()> {
        let mut profile = labelled_profile();
        profile.samples[1].labels = btreemap! {
            "span".to_string() => vec![String::new(), "root".to_string()],
        };
        let mut buffer = Vec::new();
        profile.encode(&mut buffer)?;
        let parsed = Profile::parse(&buffer)?;
        assert_eq!(profile.samples[1].labels, parsed.samples[1].labels);
        assert!(parsed.samples[1].num_labels.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_dangling_location() {
        let mut pprof = labelled_profile().to_pprof();
        pprof.samples[0].location_ids.push(99);
        let err = Profile::try_from(&pprof).unwrap_err();
        assert!(format!("{err:#}").contains("location id 99"), "{err:#}");
    }

    #[test]
    fn rejects_dangling_function_and_mapping() {
        let mut pprof = labelled_profile().to_pprof();
        pprof.locations[0].lines[0].function_id = 42;
        let err = Profile::try_from(&pprof).unwrap_err();
        assert!(format!("{err:#}").contains("function id 42"), "{err:#}");

        let mut pprof = labelled_profile().to_pprof();
        pprof.locations[0].mapping_id = 7;
        let err = Profile::try_from(&pprof).unwrap_err();
        assert!(format!("{err:#}").contains("mapping id 7"), "{err:#}");
    }

    #[test]
    fn rejects_bad_strings_ids_and_values() {
        let mut pprof = labelled_profile().to_pprof();
        pprof.functions[0].name = 10_000;
        Profile::try_from(&pprof).unwrap_err();

        let mut pprof = labelled_profile().to_pprof();
        pprof.string_table[0] = "oops".into();
        Profile::try_from(&pprof).unwrap_err();

        let mut pprof = labelled_profile().to_pprof();
        let duplicate = pprof.functions[0];
        pprof.functions.push(duplicate);
        let err = Profile::try_from(&pprof).unwrap_err();
        assert!(err.to_string().contains("multiple pprof functions"));

        let mut pprof = labelled_profile().to_pprof();
        pprof.samples[1].values.pop();
        let err = Profile::try_from(&pprof).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn rejects_inverted_mapping_but_allows_placeholder() -> anyhow::Result<()> {
        let mut pprof = labelled_profile().to_pprof();
        pprof.mappings[0].memory_limit = pprof.mappings[0].memory_start;
        let err = Profile::try_from(&pprof).unwrap_err();
        assert!(err.to_string().contains("inverted range"));

        pprof.mappings[0].memory_start = 0;
        pprof.mappings[0].memory_limit = 0;
        let profile = Profile::try_from(&pprof)?;
        assert_eq!(0, profile.mappings[0].limit);
        Ok(())
    }

    #[test]
    fn empty_message_is_an_empty_profile() -> anyhow::Result<()> {
        let profile = Profile::parse(&[])?;
        assert_eq!(Profile::default(), profile);
        Ok(())
    }
}
