//! Table-level types: identifiers, the desired configuration, the shard
//! scheme, and the Raft-replicated table state the coordinator reads.

use crate::branch::BranchHistory;
use crate::contract::Contract;
use crate::coordinator::{BranchDiff, ContractDiff};
use crate::error::{Error, Result};
use crate::region::{HashRange, Key, KeyRange, Region, CPU_SHARDS};

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A unique identifier for a replica server process.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(Uuid);

impl ServerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for ServerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// A unique identifier for a published contract. Contracts are immutable:
/// any change mints a fresh id, so servers can tell generations apart and
/// discard acks of stale contracts.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractId(Uuid);

impl From<Uuid> for ContractId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for ContractId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// A unique identifier for a branch. The nil id is reserved for the zero
/// version's branch and never appears in the branch history.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(Uuid);

impl BranchId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl From<Uuid> for BranchId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Generates fresh contract ids. Injectable so tests can produce
/// deterministic outputs.
pub trait IdGen {
    fn contract_id(&mut self) -> ContractId;
}

/// Generates random v4 ids.
pub struct RandomIds;

impl IdGen for RandomIds {
    fn contract_id(&mut self) -> ContractId {
        ContractId(Uuid::new_v4())
    }
}

/// Generates ids from a seeded RNG, for deterministic tests and replay.
pub struct SeededIds {
    rng: StdRng,
}

impl SeededIds {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    pub fn uuid(&mut self) -> Uuid {
        Uuid::from_u128(self.rng.gen())
    }
}

impl IdGen for SeededIds {
    fn contract_id(&mut self) -> ContractId {
        ContractId(self.uuid())
    }
}

/// Determines how many voter acknowledgements a write needs before it is
/// reported as committed. This also determines how many voters must report
/// their versions before a primary can be elected: the reports must be
/// guaranteed to cover every acknowledged write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteAckMode {
    /// Writes require a strict majority of each voter set.
    Majority,
    /// Writes require a single voter, so elections must hear from every one.
    Single,
}

impl WriteAckMode {
    /// The number of servers from a set of the given size whose reports are
    /// guaranteed to intersect every write quorum under this mode.
    pub fn quorum(self, size: usize) -> usize {
        match self {
            WriteAckMode::Majority => size / 2 + 1,
            WriteAckMode::Single => size,
        }
    }
}

/// The desired placement of one user shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// The servers that should hold a replica of the shard.
    pub replicas: BTreeSet<ServerId>,
    /// The replica that should act as primary.
    pub primary: ServerId,
}

/// The desired table configuration, as set by the user and replicated via
/// Raft. The coordinator drives the published contracts toward it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Desired placement per user shard, aligned with the shard scheme.
    pub shards: Vec<ShardConfig>,
    /// The write acknowledgement mode.
    pub write_ack: WriteAckMode,
    /// How long a secondary waits before reporting its failover timer as
    /// elapsed. Informational to the coordinator: servers time out against
    /// their own clocks and report the result in their acks.
    pub failover_timeout_ms: u64,
}

impl TableConfig {
    /// Validates the configuration against a shard scheme.
    pub fn validate(&self, scheme: &ShardScheme) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::InvalidInput("table must have at least one shard".into()));
        }
        if self.shards.len() != scheme.num_shards() {
            return Err(Error::InvalidInput(format!(
                "{} shards configured but scheme has {}",
                self.shards.len(),
                scheme.num_shards()
            )));
        }
        for (i, shard) in self.shards.iter().enumerate() {
            if shard.replicas.is_empty() {
                return Err(Error::InvalidInput(format!("shard {i} has no replicas")));
            }
            if !shard.replicas.contains(&shard.primary) {
                return Err(Error::InvalidInput(format!(
                    "shard {i} primary {} is not a replica",
                    shard.primary
                )));
            }
        }
        for pair in scheme.split_points.windows(2) {
            if pair[0] >= pair[1] {
                return Err(Error::InvalidInput("split points must be ascending".into()));
            }
        }
        if scheme.split_points.first().is_some_and(|p| p.is_empty()) {
            return Err(Error::InvalidInput("split point can't be the minimum key".into()));
        }
        Ok(())
    }
}

/// The user-shard boundaries of the key space: n split points make n+1
/// shards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardScheme {
    pub split_points: Vec<Key>,
}

impl ShardScheme {
    pub fn num_shards(&self) -> usize {
        self.split_points.len() + 1
    }

    /// The index of the shard containing the given key.
    pub fn shard_index(&self, key: &[u8]) -> usize {
        self.split_points.iter().take_while(|point| point.as_slice() <= key).count()
    }

    /// The key range of the shard at the given index.
    pub fn shard_range(&self, index: usize) -> KeyRange {
        assert!(index < self.num_shards(), "shard {index} out of range");
        let start = if index == 0 { Key::new() } else { self.split_points[index - 1].clone() };
        let end = self.split_points.get(index).cloned();
        KeyRange { start, end }
    }
}

/// The Raft-replicated table state the coordinator reads. The coordinator
/// never mutates it directly; it emits diffs that the Raft leader proposes
/// and every node applies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableRaftState {
    pub config: TableConfig,
    pub shard_scheme: ShardScheme,
    pub contracts: BTreeMap<ContractId, (Region, Contract)>,
    pub branch_history: BranchHistory,
}

impl TableRaftState {
    /// Applies a contract diff and a branch diff as one unit. Callers must
    /// apply both diffs of a tick together, and should sweep acks of the
    /// removed contracts from their ack store.
    pub fn apply(&mut self, contracts: &ContractDiff, branches: &BranchDiff) {
        for id in &contracts.remove {
            self.contracts.remove(id);
        }
        for (id, placement) in &contracts.add {
            let prev = self.contracts.insert(*id, placement.clone());
            assert!(prev.is_none(), "contract id {id} reused");
        }
        for id in &branches.remove {
            self.branch_history.branches.remove(id);
        }
        for (id, branch) in &branches.add.branches {
            self.branch_history.branches.insert(*id, branch.clone());
        }
    }

    /// Asserts the state invariants. A violation is a bug in the coordinator
    /// or its caller, not a recoverable condition.
    pub fn validate(&self) {
        self.config.validate(&self.shard_scheme).expect("invalid table config");

        // Contracts must partition the key space exactly within each band.
        let mut matched = 0;
        for i in 0..CPU_SHARDS {
            let band = HashRange::cpu_shard(i);
            let mut ranges: Vec<&KeyRange> = self
                .contracts
                .values()
                .filter(|(region, _)| region.hash == band)
                .map(|(region, _)| &region.keys)
                .collect();
            matched += ranges.len();
            ranges.sort_by(|a, b| a.start.cmp(&b.start));
            assert!(!ranges.is_empty(), "cpu shard {i} has no contracts");
            assert!(ranges[0].start.is_empty(), "cpu shard {i} does not start at the minimum key");
            for pair in ranges.windows(2) {
                assert_eq!(
                    pair[0].end.as_ref(),
                    Some(&pair[1].start),
                    "cpu shard {i} contracts do not tile the key space"
                );
            }
            assert!(ranges.last().unwrap().end.is_none(), "cpu shard {i} does not reach the end");
        }
        assert_eq!(matched, self.contracts.len(), "contract on an unknown hash band");

        for (id, (_, contract)) in &self.contracts {
            assert!(
                contract.voters.is_subset(&contract.replicas),
                "contract {id}: voters not a subset of replicas"
            );
            if let Some(temp) = &contract.temp_voters {
                assert!(
                    temp.is_subset(&contract.replicas),
                    "contract {id}: temp voters not a subset of replicas"
                );
            }
            if let Some(primary) = &contract.primary {
                assert!(
                    contract.voters.contains(&primary.server),
                    "contract {id}: primary is not a voter"
                );
            }
            // The contract's branch and all its ancestors must be present.
            assert!(
                self.branch_history.ancestry(contract.branch).is_some(),
                "contract {id}: branch {} has missing ancestry",
                contract.branch
            );
        }
    }
}
