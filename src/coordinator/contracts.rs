//! The contract calculator: computes the next generation of contracts from
//! the current state and the servers' acks.
//!
//! Contracts evolve per region through a small state machine:
//!
//! - Replicas are added as soon as the config wants them, and dropped once
//!   neither the config nor the voter sets need them.
//! - Voter changes go through a temp_voters phase. The new set is staged once
//!   every member has caught up, and committed once the primary confirms that
//!   all writes accepted under the old set are acknowledged under the new
//!   one, so no committed write can be lost in the transition.
//! - Primacy moves by hand-over (drain, then a no-primary gap, then
//!   election) or by failover (the primary's ack vanishes and a quorum of
//!   voters report their failover timers elapsed).
//! - Elections pick a voter whose reported version is at least as new as
//!   every other report along the branch lineage. Where eligibility differs
//!   across the key space, the region splits and each piece elects its own
//!   primary.

use super::ContractDiff;
use crate::branch::{BranchHistory, Version};
use crate::contract::{AckSource, Contract, ContractAck, Primary};
use crate::region::{Key, Region};
use crate::table::{IdGen, ServerId, ShardConfig, TableRaftState, WriteAckMode};

use itertools::Itertools as _;
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

/// Computes the contract diff for a tick. Each existing contract's region is
/// cut at the configured shard boundaries and at the interior boundaries of
/// reported version maps, so every piece sees constant inputs; the evolution
/// machine then runs on each piece. A contract whose single piece comes out
/// identical is left untouched and keeps its id.
pub(super) fn calculate_all(
    state: &TableRaftState,
    acks: &dyn AckSource,
    ids: &mut dyn IdGen,
) -> ContractDiff {
    let mut diff = ContractDiff::default();
    for (&id, (region, old)) in &state.contracts {
        // The acks of this contract's replicas.
        let acked: BTreeMap<ServerId, &ContractAck> =
            old.replicas.iter().filter_map(|&s| acks.get(s, id).map(|ack| (s, ack))).collect();

        // A working branch view for eligibility decisions: the replicated
        // history plus every fragment attached to these acks.
        let mut lineage = state.branch_history.clone();
        for ack in acked.values() {
            if let Some(fragment) = ack.branch_history() {
                lineage.merge(fragment);
            }
        }

        // Cut points: shard boundaries and version report boundaries.
        let mut cuts: BTreeSet<Key> = state.shard_scheme.split_points.iter().cloned().collect();
        for ack in acked.values() {
            if let ContractAck::SecondaryNeedPrimary { version, .. } = ack {
                cuts.extend(version.mask(&region.keys).boundaries().cloned());
            }
        }

        let pieces = region.keys.partition(&cuts);
        let outputs: Vec<(Region, Contract)> = pieces
            .into_iter()
            .map(|keys| {
                let shard = &state.config.shards[state.shard_scheme.shard_index(&keys.start)];
                let piece = Region::new(region.hash, keys);
                let new = calculate_contract(
                    old,
                    shard,
                    &acked,
                    &piece,
                    &lineage,
                    state.config.write_ack,
                );
                (piece, new)
            })
            .collect();

        if outputs.len() == 1 && outputs[0].1 == *old {
            continue; // Unchanged; the contract keeps its id.
        }

        debug!("{region}: replacing contract {id}");
        diff.remove.insert(id);
        for (piece, contract) in outputs {
            diff.add.insert(ids.contract_id(), (piece, contract));
        }
    }
    diff
}

/// Computes the new contract for one piece of an existing contract's region.
/// Total and deterministic: missing acks are a normal input and simply leave
/// the machine waiting.
fn calculate_contract(
    old: &Contract,
    shard: &ShardConfig,
    acked: &BTreeMap<ServerId, &ContractAck>,
    region: &Region,
    lineage: &BranchHistory,
    mode: WriteAckMode,
) -> Contract {
    let mut new = old.clone();

    // Every desired replica joins the contract, so it can start backfilling.
    new.replicas.extend(shard.replicas.iter().copied());

    // Commit a pending voter change. The primary acks PrimaryReady once every
    // write accepted under the old voter set is also acknowledged under the
    // new one; with no primary there are no writes in flight.
    if let Some(temp) = &old.temp_voters {
        let committed = match &old.primary {
            Some(primary) => {
                matches!(acked.get(&primary.server), Some(ContractAck::PrimaryReady))
            }
            None => true,
        };
        if committed {
            debug!("{region}: committing voters {}", temp.iter().join(","));
            new.voters = temp.clone();
            new.temp_voters = None;
        }
    }

    // Begin a voter change once every desired replica has caught up. Until
    // then a new voter could be missing committed writes.
    if new.temp_voters.is_none() && new.voters != shard.replicas {
        let caught_up =
            shard.replicas.iter().all(|s| acked.get(s).is_some_and(|ack| ack.is_current()));
        if caught_up {
            debug!("{region}: staging voters {}", shard.replicas.iter().join(","));
            new.temp_voters = Some(shard.replicas.clone());
        }
    }

    // The primary machine.
    if let Some(old_primary) = &old.primary {
        let primary_ack = acked.get(&old_primary.server).copied();
        // A primary whose ack is missing, or who regressed to a secondary
        // state after a restart, can no longer serve the contract.
        let failed = !primary_ack.is_some_and(|ack| {
            matches!(
                ack,
                ContractAck::PrimaryNeedBranch { .. }
                    | ContractAck::PrimaryInProgress
                    | ContractAck::PrimaryReady
            )
        });

        if failed && failover_quorum(old, acked, mode) {
            info!("{region}: failing over, primary {} lost", old_primary.server);
            new.primary = None;
        } else if old_primary.hand_over.is_some()
            && matches!(primary_ack, Some(ContractAck::PrimaryReady))
        {
            // The outgoing primary drained its writes; enter the no-primary
            // phase so a successor can be elected.
            debug!("{region}: hand-over from {} complete", old_primary.server);
            new.primary = None;
        } else {
            let ready = old_primary.server != shard.primary
                && new.is_voter(shard.primary)
                && matches!(
                    acked.get(&shard.primary),
                    Some(ContractAck::SecondaryStreaming)
                );
            let primary = new.primary.as_mut().expect("primary was cloned from old");
            match old_primary.hand_over {
                // The desired primary changed while handing over; back out
                // and let a later tick restart toward the new target.
                Some(target) if target != shard.primary => primary.hand_over = None,
                Some(_) => {}
                None if old_primary.server != shard.primary => {
                    // Start a hand-over once the desired primary is a caught
                    // up voter.
                    if ready {
                        debug!(
                            "{region}: hand-over from {} to {}",
                            old_primary.server, shard.primary
                        );
                        primary.hand_over = Some(shard.primary);
                    }
                }
                None => {}
            }

            // A freshly elected primary proposes a branch to write under;
            // adopt it once its ancestry is resolvable.
            if let Some(ContractAck::PrimaryNeedBranch { branch, .. }) = primary_ack {
                if new.branch != *branch && lineage.ancestry(*branch).is_some() {
                    debug!("{region}: primary {} adopts branch {branch}", old_primary.server);
                    new.branch = *branch;
                }
            }
        }
    } else if let Some(server) = elect(old, &new, shard, acked, region, lineage, mode) {
        info!("{region}: electing {server} as primary");
        new.primary = Some(Primary { server, hand_over: None });
    }

    // Drop replicas that are neither desired nor still playing a role.
    let voters = new.voters.clone();
    let temp_voters = new.temp_voters.clone();
    let primary = new.primary.clone();
    new.replicas.retain(|s| {
        shard.replicas.contains(s)
            || voters.contains(s)
            || temp_voters.as_ref().is_some_and(|temp| temp.contains(s))
            || primary.as_ref().is_some_and(|p| p.server == *s)
    });
    new
}

/// Returns true if enough voters have given up on the primary to fail over:
/// the voters acking SecondaryNeedPrimary with their failover timers elapsed
/// must form an ack quorum of the voters, and of the temp voters when a voter
/// change is in flight. Any single missing flag within the required quorum
/// keeps the primary, so briefly losing contact does not force a failover.
fn failover_quorum(
    old: &Contract,
    acked: &BTreeMap<ServerId, &ContractAck>,
    mode: WriteAckMode,
) -> bool {
    let elapsed: BTreeSet<ServerId> = acked
        .iter()
        .filter_map(|(&server, &ack)| match ack {
            ContractAck::SecondaryNeedPrimary { failover_timeout_elapsed: true, .. } => {
                Some(server)
            }
            _ => None,
        })
        .collect();
    has_quorum(&elapsed, &old.voters, mode)
        && old.temp_voters.as_ref().map_or(true, |temp| has_quorum(&elapsed, temp, mode))
}

/// Returns true if `have` contains an ack quorum of `of`.
fn has_quorum(have: &BTreeSet<ServerId>, of: &BTreeSet<ServerId>, mode: WriteAckMode) -> bool {
    have.intersection(of).count() >= mode.quorum(of.len())
}

/// Elects a primary for a region without one, or returns None to keep
/// waiting.
///
/// The voters reporting SecondaryNeedPrimary must form an ack quorum of the
/// old voter sets: every write acknowledged under those sets is then present
/// in at least one report. A reporter is eligible if its version dominates
/// every other report along the branch lineage, so electing it cannot roll
/// back an acknowledged write. Prefers the configured primary, then the
/// highest version timestamp, then the lowest server id.
fn elect(
    old: &Contract,
    new: &Contract,
    shard: &ShardConfig,
    acked: &BTreeMap<ServerId, &ContractAck>,
    region: &Region,
    lineage: &BranchHistory,
    mode: WriteAckMode,
) -> Option<ServerId> {
    let key = &region.keys.start;
    let mut reports = BTreeMap::new();
    for (&server, ack) in acked {
        if let ContractAck::SecondaryNeedPrimary { version, .. } = ack {
            if old.is_voter(server) {
                if let Some(&version) = version.get(key) {
                    reports.insert(server, version);
                }
            }
        }
    }

    let reporters: BTreeSet<ServerId> = reports.keys().copied().collect();
    if !has_quorum(&reporters, &old.voters, mode) {
        return None;
    }
    if let Some(temp) = &old.temp_voters {
        if !has_quorum(&reporters, temp, mode) {
            return None;
        }
    }

    let eligible: Vec<(ServerId, Version)> = reports
        .iter()
        .map(|(&server, &version)| (server, version))
        .filter(|&(server, _)| new.is_voter(server))
        .filter(|&(_, version)| {
            reports.values().all(|&other| lineage.dominates(version, other, key))
        })
        .collect();

    if eligible.iter().any(|&(server, _)| server == shard.primary) {
        return Some(shard.primary);
    }
    eligible
        .into_iter()
        .max_by(|a, b| a.1.ts.cmp(&b.1.ts).then_with(|| b.0.cmp(&a.0)))
        .map(|(server, _)| server)
}
