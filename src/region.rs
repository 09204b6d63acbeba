//! Region algebra for the sharded key space.
//!
//! The table's key space is partitioned twofold: by user shards (configurable
//! key ranges) and by a fixed CPU-sharding factor that subdivides the hash
//! space. A region is the intersection of a hash band and a key range, and is
//! the unit a contract governs. Regions support intersection and
//! partitioning by split points; contracts' regions must partition the key
//! space exactly within each hash band.

use serde_derive::{Deserialize, Serialize};

use std::collections::BTreeSet;

/// A table key, as an opaque byte string. The empty key is the minimum.
pub type Key = Vec<u8>;

/// The number of CPU shards each user shard is subdivided into. Each CPU
/// shard covers a fixed band of the hash space and is served by a separate
/// store thread, so contracts are always scoped to a single band.
pub const CPU_SHARDS: usize = 8;

/// A half-open key range [start, end). An unbounded end covers the rest of
/// the key space.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Key,
    pub end: Option<Key>,
}

impl KeyRange {
    /// Creates a key range. Panics on an empty or inverted range.
    pub fn new(start: Key, end: Option<Key>) -> Self {
        if let Some(end) = &end {
            assert!(&start < end, "invalid key range {:?}..{:?}", start, end);
        }
        Self { start, end }
    }

    /// The full key space.
    pub fn all() -> Self {
        Self { start: Key::new(), end: None }
    }

    /// Returns true if the range contains the given key.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.as_deref().map_or(true, |end| key < end)
    }

    /// Returns the intersection of two ranges, or None if they are disjoint.
    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = std::cmp::max(&self.start, &other.start).clone();
        let end = match (&self.end, &other.end) {
            (Some(a), Some(b)) => Some(std::cmp::min(a, b).clone()),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        match &end {
            Some(end) if *end <= start => None,
            _ => Some(KeyRange { start, end }),
        }
    }

    /// Partitions the range at the given cut points, ignoring cuts outside
    /// the range's interior. Returns consecutive subranges covering the range.
    pub fn partition(&self, cuts: &BTreeSet<Key>) -> Vec<KeyRange> {
        let mut pieces = Vec::with_capacity(cuts.len() + 1);
        let mut start = self.start.clone();
        for cut in cuts {
            if *cut > start && self.contains(cut) {
                pieces.push(KeyRange::new(start, Some(cut.clone())));
                start = cut.clone();
            }
        }
        pieces.push(KeyRange { start, end: self.end.clone() });
        pieces
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}..", String::from_utf8_lossy(&self.start))?;
        match &self.end {
            Some(end) => write!(f, "{})", String::from_utf8_lossy(end)),
            None => write!(f, "*)"),
        }
    }
}

/// A half-open band [start, end) of the u64 hash space. The full space ends
/// at u64::MAX, which no key hashes to.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub start: u64,
    pub end: u64,
}

impl HashRange {
    /// The hash band of the given CPU shard.
    pub fn cpu_shard(index: usize) -> Self {
        assert!(index < CPU_SHARDS, "CPU shard {index} out of range");
        let width = u64::MAX / CPU_SHARDS as u64;
        let start = index as u64 * width;
        let end = if index == CPU_SHARDS - 1 { u64::MAX } else { start + width };
        Self { start, end }
    }

    /// The CPU shard this band belongs to.
    pub fn shard_index(&self) -> usize {
        (self.start / (u64::MAX / CPU_SHARDS as u64)) as usize
    }
}

/// A region: the intersection of a hash band and a key range. The unit a
/// contract governs.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub hash: HashRange,
    pub keys: KeyRange,
}

impl Region {
    pub fn new(hash: HashRange, keys: KeyRange) -> Self {
        Self { hash, keys }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "cpu{}:{}", self.hash.shard_index(), self.keys)
    }
}

/// An ordered mapping from contiguous key ranges to values. Adjacent entries
/// with equal values are coalesced, so boundaries always separate distinct
/// values. Used for per-sub-region version reports and branch origins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMap<V> {
    entries: Vec<(KeyRange, V)>,
}

impl<V: Clone + PartialEq> RangeMap<V> {
    /// Creates a map with a single value across the given range.
    pub fn uniform(range: KeyRange, value: V) -> Self {
        Self { entries: vec![(range, value)] }
    }

    /// Creates a map from consecutive entries. Panics if the entries are
    /// empty or not contiguous.
    pub fn from_entries(entries: Vec<(KeyRange, V)>) -> Self {
        assert!(!entries.is_empty(), "range map must cover a range");
        for pair in entries.windows(2) {
            assert_eq!(
                pair[0].0.end.as_ref(),
                Some(&pair[1].0.start),
                "range map entries must be contiguous"
            );
        }
        let mut map = Self { entries };
        map.coalesce();
        map
    }

    /// The full range the map covers.
    pub fn range(&self) -> KeyRange {
        let start = self.entries.first().expect("empty range map").0.start.clone();
        let end = self.entries.last().expect("empty range map").0.end.clone();
        KeyRange { start, end }
    }

    /// Looks up the value at a key, or None if the key is outside the map.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.entries.iter().find(|(range, _)| range.contains(key)).map(|(_, value)| value)
    }

    /// Restricts the map to the given range. Entries outside it are dropped;
    /// the result may be empty if the ranges are disjoint.
    pub fn mask(&self, range: &KeyRange) -> RangeMap<V> {
        let entries = self
            .entries
            .iter()
            .filter_map(|(r, v)| r.intersect(range).map(|r| (r, v.clone())))
            .collect();
        let mut map = Self { entries };
        map.coalesce();
        map
    }

    /// The interior boundaries of the map: the start keys of all entries but
    /// the first. Since equal neighbors are coalesced, every boundary
    /// separates distinct values.
    pub fn boundaries(&self) -> impl Iterator<Item = &Key> + '_ {
        self.entries.iter().skip(1).map(|(range, _)| &range.start)
    }

    /// Iterates over (range, value) entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&KeyRange, &V)> + '_ {
        self.entries.iter().map(|(range, value)| (range, value))
    }

    /// Merges adjacent entries with equal values.
    fn coalesce(&mut self) {
        let mut coalesced: Vec<(KeyRange, V)> = Vec::with_capacity(self.entries.len());
        for (range, value) in self.entries.drain(..) {
            match coalesced.last_mut() {
                Some((prev, pv)) if *pv == value && prev.end.as_ref() == Some(&range.start) => {
                    prev.end = range.end;
                }
                _ => coalesced.push((range, value)),
            }
        }
        self.entries = coalesced;
    }
}
