// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

use super::*;

/// The [StringTable] stores strings and associates them with [StringId]s,
/// which correspond to the order in which strings were inserted. The empty
/// string is always associated with [StringId::ZERO].
pub struct StringTable {
    strings: FxIndexSet<Box<str>>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    #[inline]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a new [StringTable] with room for at least `capacity` strings
    /// before reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut strings = FxIndexSet::with_capacity_and_hasher(capacity, Default::default());
        // string tables always have the empty string at 0.
        let (_id, _inserted) = strings.insert_full(Box::from(""));
        debug_assert!(_id == StringId::ZERO.to_offset());
        debug_assert!(_inserted);
        Self { strings }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Never true, the empty string is always present.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Inserts the string into the table, if it did not already exist. The id
    /// of the string is returned.
    #[inline]
    pub fn intern(&mut self, str: &str) -> StringId {
        self.insert_full(str).0
    }

    /// Inserts the string into the table, if it did not already exist. The id
    /// of the string is returned, along with whether the string was inserted.
    pub fn insert_full(&mut self, str: &str) -> (StringId, bool) {
        // For performance, delay converting the &str to an owned string until
        // after it has been determined to not exist in the set. This avoids
        // temporary allocations.
        match self.strings.get_index_of(str) {
            Some(offset) => (StringId::from_offset(offset), false),
            None => {
                let (offset, inserted) = self.strings.insert_full(Box::from(str));
                (StringId::from_offset(offset), inserted)
            }
        }
    }

    /// Gets the string associated with the id, if it exists.
    #[inline]
    pub fn get(&self, id: StringId) -> Option<&str> {
        self.strings.get_index(id.to_offset()).map(|s| s.as_ref())
    }

    /// Returns an iterator over the strings in the table. The items are
    /// returned in the order they were inserted, matching the [StringId]s.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(|s| s.as_ref())
    }

    /// Consumes the table, producing the string table of a pprof message.
    pub fn into_pprof_vec(self) -> Vec<String> {
        self.strings.into_iter().map(String::from).collect()
    }
}
