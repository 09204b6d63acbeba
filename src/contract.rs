//! Contracts: per-region agreements about which servers play which roles,
//! and the acknowledgements servers send back about them.
//!
//! A contract is immutable once published; the coordinator changes a region
//! by removing the old contract and adding a new one under a fresh id.
//! Servers report their progress against a specific contract id, and the
//! coordinator folds those acks into the next generation of contracts.

use crate::branch::{BranchHistory, Version};
use crate::region::RangeMap;
use crate::table::{BranchId, ContractId, ServerId};

use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The primary assignment of a contract. When `hand_over` is set, the
/// primary finishes its pending writes and then steps down in favor of the
/// named replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primary {
    pub server: ServerId,
    pub hand_over: Option<ServerId>,
}

/// The authoritative statement of which servers play which roles for a
/// region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    /// The servers physically holding data for the region.
    pub replicas: BTreeSet<ServerId>,
    /// The replicas whose acks count toward write quorums.
    pub voters: BTreeSet<ServerId>,
    /// A second voter set used during voter transitions. When present,
    /// writes must be acknowledged by quorums of both sets.
    pub temp_voters: Option<BTreeSet<ServerId>>,
    /// The current primary, if any. An absent primary means writes are
    /// stopped until one is elected.
    pub primary: Option<Primary>,
    /// The branch the region's primary writes under.
    pub branch: BranchId,
}

impl Contract {
    /// Returns true if the server is in the voters or the temp voters.
    pub fn is_voter(&self, server: ServerId) -> bool {
        self.voters.contains(&server)
            || self.temp_voters.as_ref().is_some_and(|temp| temp.contains(&server))
    }
}

/// A server's report of its state with respect to a specific contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractAck {
    /// The server holds no data and is not participating.
    Nothing,
    /// A secondary waiting for a primary. Reports the highest version the
    /// server has seen per sub-region so the coordinator can judge election
    /// eligibility, and whether the server's failover timer has expired.
    SecondaryNeedPrimary {
        version: RangeMap<Version>,
        branch_history: BranchHistory,
        failover_timeout_elapsed: bool,
    },
    /// A secondary copying data from the primary.
    SecondaryBackfilling,
    /// A secondary fully caught up and streaming writes.
    SecondaryStreaming,
    /// A newly elected primary proposing a fresh branch rooted at its
    /// starting version. The fragment carries the branch and its ancestors.
    PrimaryNeedBranch { branch: BranchId, branch_history: BranchHistory },
    /// A primary that is serving but not yet settled, e.g. still waiting for
    /// writes to be acknowledged under a new voter set.
    PrimaryInProgress,
    /// A primary in steady state. With a hand-over pending, this also means
    /// the pending writes are drained and primacy can be transferred.
    PrimaryReady,
}

impl ContractAck {
    /// Returns true if the server holds current data for the contract: a
    /// streaming secondary or an acting primary.
    pub fn is_current(&self) -> bool {
        matches!(
            self,
            ContractAck::SecondaryStreaming
                | ContractAck::PrimaryNeedBranch { .. }
                | ContractAck::PrimaryInProgress
                | ContractAck::PrimaryReady
        )
    }

    /// The branch-history fragment attached to the ack, if any.
    pub fn branch_history(&self) -> Option<&BranchHistory> {
        match self {
            ContractAck::SecondaryNeedPrimary { branch_history, .. } => Some(branch_history),
            ContractAck::PrimaryNeedBranch { branch_history, .. } => Some(branch_history),
            _ => None,
        }
    }
}

/// A read-consistent snapshot of server acknowledgements. The coordinator
/// reads acks only through this interface, so implementations can hand it a
/// copy or hold a lock for the duration of a tick.
pub trait AckSource {
    /// The ack of one server for one contract.
    fn get(&self, server: ServerId, contract: ContractId) -> Option<&ContractAck>;

    /// All acks for a contract, ordered by server id.
    fn for_contract(&self, contract: ContractId) -> Vec<(ServerId, &ContractAck)>;
}

/// A map-backed ack store. Acks live until their contract is removed, at
/// which point the caller sweeps them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AckMap {
    acks: BTreeMap<(ServerId, ContractId), ContractAck>,
}

impl AckMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, server: ServerId, contract: ContractId, ack: ContractAck) {
        self.acks.insert((server, contract), ack);
    }

    pub fn remove(&mut self, server: ServerId, contract: ContractId) {
        self.acks.remove(&(server, contract));
    }

    /// Drops all acks for a contract, typically after it was removed.
    pub fn sweep(&mut self, contract: ContractId) {
        self.acks.retain(|(_, c), _| *c != contract);
    }
}

impl AckSource for AckMap {
    fn get(&self, server: ServerId, contract: ContractId) -> Option<&ContractAck> {
        self.acks.get(&(server, contract))
    }

    fn for_contract(&self, contract: ContractId) -> Vec<(ServerId, &ContractAck)> {
        self.acks
            .iter()
            .filter(|((_, c), _)| *c == contract)
            .map(|((s, _), ack)| (*s, ack))
            .collect()
    }
}
