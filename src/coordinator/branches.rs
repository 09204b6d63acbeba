//! The branch-history calculator: grafts in branches the new contracts and
//! surviving acks depend on, and garbage-collects branches no longer
//! reachable from any of them.
//!
//! Contracts are the only long-term roots of the branch DAG; acks are
//! transient but count as roots while present. Reachability is the
//! reflexive-transitive closure of origin references.

use super::{BranchDiff, ContractDiff};
use crate::branch::BranchHistory;
use crate::contract::{AckSource, ContractAck};
use crate::table::{BranchId, TableRaftState};

use std::collections::BTreeSet;

/// Computes the branch-history diff for a tick, given the contract diff.
pub(super) fn calculate(
    state: &TableRaftState,
    acks: &dyn AckSource,
    diff: &ContractDiff,
) -> BranchDiff {
    // The candidate pool: the replicated history plus every fragment
    // currently acked. Fragments of acks for contracts removed this tick are
    // included, since a new contract's branch may only exist in such a
    // fragment (a PrimaryNeedBranch ack is always keyed by the contract it
    // replaces).
    let mut pool = state.branch_history.clone();
    for &contract in state.contracts.keys() {
        for (_, ack) in acks.for_contract(contract) {
            if let Some(fragment) = ack.branch_history() {
                pool.merge(fragment);
            }
        }
    }

    // Roots: the branches of surviving contracts, plus every branch
    // referenced by an ack of a surviving contract.
    let mut roots: BTreeSet<BranchId> = BTreeSet::new();
    for (id, (_, contract)) in &state.contracts {
        if !diff.remove.contains(id) {
            roots.insert(contract.branch);
        }
    }
    for (_, contract) in diff.add.values() {
        roots.insert(contract.branch);
    }
    for &contract in state.contracts.keys() {
        if diff.remove.contains(&contract) {
            continue;
        }
        for (_, ack) in acks.for_contract(contract) {
            match ack {
                ContractAck::SecondaryNeedPrimary { version, .. } => {
                    roots.extend(
                        version.iter().map(|(_, v)| v.branch).filter(|branch| !branch.is_nil()),
                    );
                }
                ContractAck::PrimaryNeedBranch { branch, .. } => {
                    roots.insert(*branch);
                }
                _ => {}
            }
        }
    }

    // Additions: each root's ancestry resolved through the pool, minus what
    // the state already has. A root whose chain does not fully resolve is
    // skipped; grafting a partial chain would orphan its descendants.
    let mut add = BranchHistory::new();
    let mut reachable: BTreeSet<BranchId> = BTreeSet::new();
    for &root in &roots {
        let Some(chain) = pool.ancestry(root) else { continue };
        for id in chain {
            reachable.insert(id);
            if !state.branch_history.contains(id) && !add.contains(id) {
                add.insert(id, pool.get(id).expect("branch is in its own ancestry").clone());
            }
        }
    }

    // Removals: state branches not reachable from any root.
    let remove = state
        .branch_history
        .branches
        .keys()
        .filter(|id| !reachable.contains(*id))
        .copied()
        .collect();

    BranchDiff { remove, add }
}
