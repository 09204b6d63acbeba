//! The contract coordinator: the deterministic control-plane function that
//! drives a table's published contracts toward its desired configuration.
//!
//! Each tick, the coordinator reads the Raft-replicated table state and a
//! snapshot of server acks and computes two diffs: contracts to remove/add,
//! and branch-history entries to garbage-collect/graft. It performs no I/O,
//! reads no clocks, and given identical inputs produces identical outputs
//! (fresh contract ids come from an injectable generator). It is intended to
//! run on the Raft leader, with the diffs proposed as a Raft command so every
//! node applies the same update; the caller must apply both diffs as one
//! unit.

mod branches;
mod contracts;

use crate::branch::BranchHistory;
use crate::contract::{AckSource, Contract};
use crate::region::Region;
use crate::table::{BranchId, ContractId, IdGen, TableRaftState};

use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The contract changes of one coordinator tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractDiff {
    pub remove: BTreeSet<ContractId>,
    pub add: BTreeMap<ContractId, (Region, Contract)>,
}

impl ContractDiff {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// The branch-history changes of one coordinator tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchDiff {
    pub remove: BTreeSet<BranchId>,
    pub add: BranchHistory,
}

impl BranchDiff {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.branches.is_empty()
    }
}

/// The contract coordinator. Holds only the contract id generator; all other
/// inputs are passed per tick.
pub struct Coordinator {
    ids: Box<dyn IdGen>,
}

impl Coordinator {
    pub fn new(ids: Box<dyn IdGen>) -> Self {
        Self { ids }
    }

    /// Computes the contract diff for one tick: for each existing contract,
    /// aligns its region with the configured shard boundaries and the
    /// boundaries of reported versions, then runs the per-region evolution
    /// machine on each piece.
    pub fn calculate_contracts(
        &mut self,
        state: &TableRaftState,
        acks: &dyn AckSource,
    ) -> ContractDiff {
        contracts::calculate_all(state, acks, self.ids.as_mut())
    }

    /// Computes the branch-history diff for a tick, given the contract diff:
    /// grafts in branches that surviving contracts and acks depend on, and
    /// garbage-collects branches nothing reachable depends on.
    pub fn calculate_branches(
        &self,
        state: &TableRaftState,
        acks: &dyn AckSource,
        diff: &ContractDiff,
    ) -> BranchDiff {
        branches::calculate(state, acks, diff)
    }

    /// Runs both calculators in order. The two diffs must be applied
    /// atomically.
    pub fn tick(
        &mut self,
        state: &TableRaftState,
        acks: &dyn AckSource,
    ) -> (ContractDiff, BranchDiff) {
        let contracts = self.calculate_contracts(state, acks);
        let branches = self.calculate_branches(state, acks, &contracts);
        (contracts, branches)
    }
}
