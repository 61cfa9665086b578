// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2023-Present Datadog, Inc.

mod string_table;

pub use string_table::*;

use std::hash::{BuildHasherDefault, Hash};

pub type FxBuildHasher = BuildHasherDefault<rustc_hash::FxHasher>;
pub type FxHashMap<K, V> = std::collections::HashMap<K, V, FxBuildHasher>;
pub type FxHashSet<K> = std::collections::HashSet<K, FxBuildHasher>;
pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, FxBuildHasher>;
pub type FxIndexSet<K> = indexmap::IndexSet<K, FxBuildHasher>;

/// A handle into one of the arenas owned by a profile or a graph. Handles
/// are offsets into the arena, so they are only meaningful to the owner that
/// handed them out.
pub trait Id: Copy + Eq + Hash {
    type RawId;

    fn from_offset(inner: usize) -> Self;

    fn to_offset(&self) -> usize;

    fn to_raw_id(&self) -> Self::RawId;
}

/// Defines a `u32` handle type implementing [Id]. The raw id is the offset
/// widened to `u64`.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $crate::collections::identifiable::Id for $name {
            type RawId = u64;

            #[inline]
            fn from_offset(inner: usize) -> Self {
                #[allow(clippy::expect_used)]
                let offset: u32 = inner
                    .try_into()
                    .expect(concat!(stringify!($name), " offset to fit into a u32"));
                Self(offset)
            }

            #[inline]
            fn to_offset(&self) -> usize {
                self.0 as usize
            }

            #[inline]
            fn to_raw_id(&self) -> Self::RawId {
                self.0 as u64
            }
        }
    };
}

pub(crate) use define_id;

/// Index into a pprof string table. Offset zero is always the empty string.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct StringId(u32);

impl StringId {
    pub const ZERO: StringId = Self(0);

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Id for StringId {
    type RawId = i64;

    #[inline]
    fn from_offset(inner: usize) -> Self {
        #[allow(clippy::expect_used)]
        let offset: u32 = inner.try_into().expect("StringId to fit into a u32");
        Self(offset)
    }

    #[inline]
    fn to_offset(&self) -> usize {
        self.0 as usize
    }

    #[inline]
    fn to_raw_id(&self) -> Self::RawId {
        Self::RawId::from(self.0)
    }
}
