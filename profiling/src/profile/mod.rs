// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2021-Present Datadog, Inc.

//! The in-memory profile model. A [Profile] owns every [Mapping],
//! [Function] and [Location] in arenas, and samples and lines refer to them
//! through typed handles rather than through the interchange ids.

mod parse;
mod scale;

pub use parse::*;
pub use scale::*;

use crate::collections::identifiable::{define_id, Id};
use std::collections::BTreeMap;

define_id!(
    /// Handle of a [Mapping] in [Profile::mappings].
    MappingId
);
define_id!(
    /// Handle of a [Function] in [Profile::functions].
    FunctionId
);
define_id!(
    /// Handle of a [Location] in [Profile::locations].
    LocationId
);

/// Describes one column of sample values, e.g. `cpu`/`nanoseconds`.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ValueType {
    pub r#type: String,
    pub unit: String,
}

impl ValueType {
    pub fn new(r#type: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            unit: unit.into(),
        }
    }
}

/// One loaded binary or shared object.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Mapping {
    /// Profile-local id from the interchange format. Reassigned on merge.
    pub id: u64,

    /// Address at which the binary (or DLL) is loaded into memory.
    pub start: u64,

    /// The limit of the address range occupied by this mapping.
    pub limit: u64,

    /// Offset in the binary that corresponds to the first mapped address.
    pub offset: u64,

    /// The object this entry is loaded from. This can be a filename on
    /// disk for the main binary and shared libraries, or virtual
    /// abstractions like "[vdso]".
    pub file: String,

    /// A string that uniquely identifies a particular program version
    /// with high probability.
    pub build_id: String,

    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

impl Mapping {
    /// A mapping with neither a file nor a build id only exists so that
    /// locations have somewhere to point.
    pub fn is_fake(&self) -> bool {
        self.file.is_empty() && self.build_id.is_empty()
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Function {
    pub id: u64,

    /// Name of the function, in human-readable form if available.
    pub name: String,

    /// Name of the function, as identified by the system. For instance,
    /// it can be a C++ mangled name.
    pub system_name: String,

    /// Source file containing the function.
    pub filename: String,

    pub start_line: i64,
}

#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Line {
    /// Absent when the symbolizer only knew the line number.
    pub function: Option<FunctionId>,
    pub line: i64,
}

/// One unique program counter value, i.e. a frame of a call stack.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Location {
    pub id: u64,

    /// `None` means the location is synthetic or its binary is unknown.
    pub mapping: Option<MappingId>,

    pub address: u64,

    /// Innermost inlined frame first; the last line is the real call site.
    pub lines: Vec<Line>,

    pub is_folded: bool,
}

/// A single observed stack trace with one value per sample type.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Sample {
    /// The leaf is at locations\[0\].
    pub locations: Vec<LocationId>,

    /// Parallel to [Profile::sample_types].
    pub values: Vec<i64>,

    pub labels: BTreeMap<String, Vec<String>>,

    pub num_labels: BTreeMap<String, Vec<i64>>,

    /// Units of [Sample::num_labels], only present for keys where at least
    /// one value carried a unit.
    pub num_units: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Profile {
    pub sample_types: Vec<ValueType>,

    /// Type of the sample type preferred for display; empty means the last
    /// one.
    pub default_sample_type: String,

    pub samples: Vec<Sample>,
    pub mappings: Vec<Mapping>,
    pub locations: Vec<Location>,
    pub functions: Vec<Function>,

    pub drop_frames: String,
    pub keep_frames: String,

    pub time_nanos: i64,
    pub duration_nanos: i64,
    pub period_type: Option<ValueType>,
    pub period: i64,

    pub comments: Vec<String>,
}

/// Interchange ids need not be dense, so new ones start above the largest.
fn next_id(ids: impl Iterator<Item = u64>) -> u64 {
    ids.max().unwrap_or(0).saturating_add(1)
}

impl Profile {
    pub fn new(sample_types: Vec<ValueType>) -> Self {
        Self {
            sample_types,
            ..Self::default()
        }
    }

    /// # Panics
    /// Panics if the handle did not come from this profile.
    #[inline]
    pub fn mapping(&self, id: MappingId) -> &Mapping {
        &self.mappings[id.to_offset()]
    }

    /// # Panics
    /// Panics if the handle did not come from this profile.
    #[inline]
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.to_offset()]
    }

    /// # Panics
    /// Panics if the handle did not come from this profile.
    #[inline]
    pub fn location(&self, id: LocationId) -> &Location {
        &self.locations[id.to_offset()]
    }

    #[inline]
    pub fn get_mapping(&self, id: MappingId) -> Option<&Mapping> {
        self.mappings.get(id.to_offset())
    }

    #[inline]
    pub fn get_function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.to_offset())
    }

    #[inline]
    pub fn get_location(&self, id: LocationId) -> Option<&Location> {
        self.locations.get(id.to_offset())
    }

    /// Adds a mapping. An `id` of 0 is replaced by one above every
    /// interchange id already in use.
    pub fn add_mapping(&mut self, mut mapping: Mapping) -> MappingId {
        if mapping.id == 0 {
            mapping.id = next_id(self.mappings.iter().map(|m| m.id));
        }
        self.mappings.push(mapping);
        MappingId::from_offset(self.mappings.len() - 1)
    }

    /// Adds a function. An `id` of 0 is replaced by one above every
    /// interchange id already in use.
    pub fn add_function(&mut self, mut function: Function) -> FunctionId {
        if function.id == 0 {
            function.id = next_id(self.functions.iter().map(|f| f.id));
        }
        self.functions.push(function);
        FunctionId::from_offset(self.functions.len() - 1)
    }

    /// Adds a location. An `id` of 0 is replaced by one above every
    /// interchange id already in use.
    pub fn add_location(&mut self, mut location: Location) -> LocationId {
        if location.id == 0 {
            location.id = next_id(self.locations.iter().map(|l| l.id));
        }
        self.locations.push(location);
        LocationId::from_offset(self.locations.len() - 1)
    }

    /// Resolves a sample type either by its type name or by its numeric
    /// position. An empty `name` resolves to the default sample type, or to
    /// the last sample type when no default is set.
    pub fn sample_index(&self, name: &str) -> anyhow::Result<usize> {
        if self.sample_types.is_empty() {
            anyhow::bail!("profile has no sample types");
        }
        let name = if name.is_empty() {
            self.default_sample_type.as_str()
        } else {
            name
        };
        if name.is_empty() {
            return Ok(self.sample_types.len() - 1);
        }
        if let Some(index) = self.sample_types.iter().position(|st| st.r#type == name) {
            return Ok(index);
        }
        if let Ok(index) = name.parse::<usize>() {
            if index < self.sample_types.len() {
                return Ok(index);
            }
            anyhow::bail!(
                "sample index {index} out of range [0..{}]",
                self.sample_types.len() - 1
            );
        }
        let available = self
            .sample_types
            .iter()
            .map(|st| st.r#type.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        anyhow::bail!("sample type {name:?} not found, available: {available}")
    }

    /// Sum of every sample's values, column by column. Used to check that
    /// transformations preserve weight; wraps on overflow.
    pub fn total_values(&self) -> Vec<i64> {
        let mut totals = vec![0i64; self.sample_types.len()];
        for sample in self.samples.iter() {
            for (total, value) in totals.iter_mut().zip(sample.values.iter()) {
                *total = total.wrapping_add(*value);
            }
        }
        totals
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Builds small profiles for tests: one function per name, one location
    /// per function, all in a single mapping.
    pub struct ProfileBuilder {
        pub profile: Profile,
        mapping: Option<MappingId>,
    }

    impl ProfileBuilder {
        pub fn new(sample_types: &[(&str, &str)]) -> Self {
            let sample_types = sample_types
                .iter()
                .map(|(t, u)| ValueType::new(*t, *u))
                .collect();
            Self {
                profile: Profile::new(sample_types),
                mapping: None,
            }
        }

        pub fn with_mapping(mut self, file: &str, build_id: &str, start: u64) -> Self {
            let id = self.profile.add_mapping(Mapping {
                start,
                limit: start + 0x10000,
                file: file.into(),
                build_id: build_id.into(),
                has_functions: true,
                ..Mapping::default()
            });
            self.mapping = Some(id);
            self
        }

        pub fn function(&mut self, name: &str) -> FunctionId {
            if let Some(offset) = self.profile.functions.iter().position(|f| f.name == name) {
                return FunctionId::from_offset(offset);
            }
            self.profile.add_function(Function {
                name: name.into(),
                system_name: name.into(),
                filename: format!("{name}.c"),
                ..Function::default()
            })
        }

        /// Location whose lines are the given functions, innermost first.
        pub fn location(&mut self, address: u64, inlined: &[&str]) -> LocationId {
            let lines = inlined
                .iter()
                .enumerate()
                .map(|(i, name)| Line {
                    function: Some(self.function(name)),
                    line: 10 + i as i64,
                })
                .collect();
            let start = self.mapping.map(|m| self.profile.mapping(m).start).unwrap_or(0);
            self.profile.add_location(Location {
                mapping: self.mapping,
                address: start + address,
                lines,
                ..Location::default()
            })
        }

        /// Finds or creates the single-line location of `name`.
        pub fn frame(&mut self, name: &str) -> LocationId {
            let existing = self.profile.locations.iter().position(|l| {
                l.lines.len() == 1
                    && l.lines[0]
                        .function
                        .map(|f| self.profile.function(f).name == name)
                        .unwrap_or(false)
            });
            match existing {
                Some(offset) => LocationId::from_offset(offset),
                None => {
                    let address = 0x100 * (self.profile.locations.len() as u64 + 1);
                    self.location(address, &[name])
                }
            }
        }

        /// Adds a sample whose stack is given root first, e.g.
        /// `["main", "work", "leaf"]`.
        pub fn sample(&mut self, root_first: &[&str], values: &[i64]) -> &mut Sample {
            let locations = root_first.iter().rev().map(|name| self.frame(name)).collect();
            self.profile.samples.push(Sample {
                locations,
                values: values.to_vec(),
                ..Sample::default()
            });
            #[allow(clippy::unwrap_used)]
            self.profile.samples.last_mut().unwrap()
        }

        pub fn build(self) -> Profile {
            self.profile
        }
    }
}
