// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

//! The seam where an external symbolizer plugs in. Symbolizers run
//! elsewhere (often one subprocess per binary); this module only writes the
//! frames they resolve into a profile's locations.

use crate::collections::identifiable::{FxHashMap, Id};
use crate::profile::{Function, FunctionId, Line, Mapping, Profile};

/// One source frame at an address. Frames for a single address are ordered
/// innermost first, like [crate::profile::Location::lines].
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Frame {
    pub function_name: String,
    pub file: String,
    pub line: i64,
}

pub trait Symbolize {
    /// Resolves an address inside `mapping` to its frames. An empty result
    /// means the symbolizer knows nothing about the address, which is not an
    /// error.
    fn resolve_frames(&self, mapping: Option<&Mapping>, address: u64) -> anyhow::Result<Vec<Frame>>;
}

impl<F> Symbolize for F
where
    F: Fn(Option<&Mapping>, u64) -> anyhow::Result<Vec<Frame>>,
{
    fn resolve_frames(
        &self,
        mapping: Option<&Mapping>,
        address: u64,
    ) -> anyhow::Result<Vec<Frame>> {
        self(mapping, address)
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SymbolizeStats {
    /// Locations that received lines.
    pub symbolized: usize,
    /// Locations the symbolizer had nothing for.
    pub unresolved: usize,
    /// Locations whose lookup failed.
    pub failed: usize,
}

/// Fills in the lines of every location that has none. Locations that
/// already carry lines are left alone, and failures are logged and skipped
/// so one bad binary doesn't spoil the rest of the profile.
pub fn symbolize<S: Symbolize + ?Sized>(profile: &mut Profile, symbolizer: &S) -> SymbolizeStats {
    let mut stats = SymbolizeStats::default();
    let mut functions: FxHashMap<(String, String), FunctionId> = profile
        .functions
        .iter()
        .enumerate()
        .map(|(offset, f)| {
            let key = (f.name.clone(), f.filename.clone());
            (key, FunctionId::from_offset(offset))
        })
        .collect();

    for offset in 0..profile.locations.len() {
        let location = &profile.locations[offset];
        if !location.lines.is_empty() {
            continue;
        }
        let mapping = location.mapping.and_then(|m| profile.get_mapping(m));
        let address = location.address;
        let frames = match symbolizer.resolve_frames(mapping, address) {
            Ok(frames) => frames,
            Err(err) => {
                log::warn!("failed to symbolize address {address:#x}: {err:#}");
                stats.failed += 1;
                continue;
            }
        };
        if frames.is_empty() {
            stats.unresolved += 1;
            continue;
        }

        let mut lines = Vec::with_capacity(frames.len());
        for frame in frames {
            let function = match functions.get(&(frame.function_name.clone(), frame.file.clone())) {
                Some(id) => *id,
                None => {
                    let id = profile.add_function(Function {
                        name: frame.function_name.clone(),
                        system_name: frame.function_name.clone(),
                        filename: frame.file.clone(),
                        ..Function::default()
                    });
                    functions.insert((frame.function_name, frame.file), id);
                    id
                }
            };
            lines.push(Line {
                function: Some(function),
                line: frame.line,
            });
        }
        profile.locations[offset].lines = lines;
        stats.symbolized += 1;
    }

    log::debug!(
        "symbolized {} locations, {} unresolved, {} failed",
        stats.symbolized,
        stats.unresolved,
        stats.failed
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Location, ValueType};

    fn unsymbolized_profile() -> Profile {
        let mut profile = Profile::new(vec![ValueType::new("samples", "count")]);
        let mapping = profile.add_mapping(Mapping {
            start: 0x1000,
            limit: 0x9000,
            file: "/bin/app".into(),
            ..Mapping::default()
        });
        for address in [0x1010u64, 0x1020, 0x1030, 0x1040] {
            profile.add_location(Location {
                mapping: Some(mapping),
                address,
                ..Location::default()
            });
        }
        profile
    }

    #[test]
    fn fills_missing_lines_and_tolerates_failures() {
        let mut profile = unsymbolized_profile();
        profile.locations[3].lines = vec![Line {
            function: None,
            line: 1,
        }];

        let symbolizer = |mapping: Option<&Mapping>, address: u64| -> anyhow::Result<Vec<Frame>> {
            assert_eq!(Some("/bin/app"), mapping.map(|m| m.file.as_str()));
            match address {
                0x1010 => Ok(vec![
                    Frame {
                        function_name: "inlined".into(),
                        file: "a.c".into(),
                        line: 3,
                    },
                    Frame {
                        function_name: "outer".into(),
                        file: "a.c".into(),
                        line: 20,
                    },
                ]),
                0x1020 => Ok(vec![]),
                _ => anyhow::bail!("addr2line crashed"),
            }
        };

        let stats = symbolize(&mut profile, &symbolizer);
        assert_eq!(
            SymbolizeStats {
                symbolized: 1,
                unresolved: 1,
                failed: 1
            },
            stats
        );
        assert_eq!(2, profile.locations[0].lines.len());
        assert_eq!(2, profile.functions.len());
        let inner = profile.locations[0].lines[0]
            .function
            .map(|f| profile.function(f).name.clone());
        assert_eq!(Some("inlined".to_string()), inner);
        assert!(profile.locations[1].lines.is_empty());
        assert_eq!(1, profile.locations[3].lines.len());
    }

    #[test]
    fn reuses_functions_across_addresses() {
        let mut profile = unsymbolized_profile();
        let symbolizer = |_: Option<&Mapping>, address: u64| -> anyhow::Result<Vec<Frame>> {
            Ok(vec![Frame {
                function_name: "loop".into(),
                file: "loop.c".into(),
                line: address as i64,
            }])
        };
        let stats = symbolize(&mut profile, &symbolizer);
        assert_eq!(4, stats.symbolized);
        assert_eq!(1, profile.functions.len());
    }
}
