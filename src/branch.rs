//! Branch history: the write lineage of the table.
//!
//! Every region's primary writes under a branch. When a new primary takes
//! over it forks a new branch from the versions it holds, so the history
//! forms a DAG rooted at the zero version. The coordinator uses the lineage
//! to decide which replica may be elected primary (its data must not be
//! behind any other voter's), and garbage-collects branches no surviving
//! contract or ack depends on.
//!
//! Branches are stored in a flat map keyed by branch id, with parent
//! references by id rather than by pointer, so the history is cheap to
//! serialize and garbage-collect.

use crate::region::RangeMap;
use crate::table::BranchId;

use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A logical write timestamp within a branch.
pub type Timestamp = u64;

/// A point in the write history: a timestamp on a branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub branch: BranchId,
    pub ts: Timestamp,
}

impl Version {
    pub fn new(branch: BranchId, ts: Timestamp) -> Self {
        Self { branch, ts }
    }

    /// The version of a region that has never been written: timestamp 0 on
    /// the nil branch.
    pub fn zero() -> Self {
        Self { branch: BranchId::nil(), ts: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.branch.is_nil() && self.ts == 0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}", self.branch, self.ts)
    }
}

/// A branch: a linear run of writes under one primary. `origin` records, per
/// key sub-range, the parent version the branch forked from; root branches
/// fork from the zero version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub origin: RangeMap<Version>,
}

impl Branch {
    pub fn new(origin: RangeMap<Version>) -> Self {
        Self { origin }
    }
}

/// The branch DAG, keyed by branch id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHistory {
    pub branches: BTreeMap<BranchId, Branch>,
}

impl BranchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BranchId) -> Option<&Branch> {
        self.branches.get(&id)
    }

    pub fn contains(&self, id: BranchId) -> bool {
        self.branches.contains_key(&id)
    }

    pub fn insert(&mut self, id: BranchId, branch: Branch) {
        self.branches.insert(id, branch);
    }

    /// Merges another history into this one, e.g. an ack's fragment into a
    /// working view. Entries for known branch ids are kept as-is: branches
    /// are immutable, so duplicates are identical.
    pub fn merge(&mut self, other: &BranchHistory) {
        for (id, branch) in &other.branches {
            self.branches.entry(*id).or_insert_with(|| branch.clone());
        }
    }

    /// Returns true if version `a` is equal to or a descendant of version `b`
    /// at the given key, following origin links toward the root. A version on
    /// a branch missing from the history is not comparable and never
    /// dominates.
    pub fn dominates(&self, mut a: Version, b: Version, key: &[u8]) -> bool {
        // The walk is bounded by the history size since the DAG is acyclic.
        for _ in 0..=self.branches.len() {
            if a.branch == b.branch {
                return a.ts >= b.ts;
            }
            let Some(branch) = self.get(a.branch) else { return false };
            match branch.origin.get(key) {
                Some(origin) => a = *origin,
                None => return false,
            }
        }
        false
    }

    /// Returns the given branch and every branch transitively reachable from
    /// it through origin references, or None if any referenced branch is
    /// missing from the history.
    pub fn ancestry(&self, id: BranchId) -> Option<Vec<BranchId>> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let branch = self.get(id)?;
            chain.push(id);
            for (_, origin) in branch.origin.iter() {
                if !origin.branch.is_nil() && !seen.contains(&origin.branch) {
                    queue.push_back(origin.branch);
                }
            }
        }
        Some(chain)
    }
}
