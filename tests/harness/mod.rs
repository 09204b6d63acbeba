//! Test harness for driving the contract coordinator the way its embedding
//! server does: build a table state, publish contracts and acks, tick the
//! coordinator, apply the diffs, and check the resulting contracts.
//!
//! User-visible key ranges expand to one contract per CPU shard, so the
//! helpers mint and check ids in per-CPU bundles.

// Each integration test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use shardkv::branch::{Branch, BranchHistory, Version};
use shardkv::contract::{AckMap, Contract, ContractAck, Primary};
use shardkv::coordinator::Coordinator;
use shardkv::region::{HashRange, KeyRange, RangeMap, Region, CPU_SHARDS};
use shardkv::table::{
    BranchId, ContractId, SeededIds, ServerId, ShardConfig, ShardScheme, TableConfig,
    TableRaftState, WriteAckMode,
};

use pretty_assertions::assert_eq;

/// One entry of a branch origin or reported version map: a key range, the
/// per-CPU parent branches, and a timestamp. A None parent means the zero
/// version.
pub type OriginEntry<'a> = (KeyRange, Option<&'a CpuBranchIds>, u64);

/// The contract ids published for one key range, one per CPU shard.
#[derive(Clone, Debug)]
pub struct CpuContractIds {
    pub range: KeyRange,
    pub ids: Vec<ContractId>,
}

/// The branch ids registered for one key range, one per CPU shard.
#[derive(Clone, Debug)]
pub struct CpuBranchIds {
    pub range: KeyRange,
    pub ids: Vec<BranchId>,
}

/// Per-CPU-shard contracts for one key range.
pub type CpuContracts = Vec<Contract>;

/// Builds a key range from string keys, for readable test fixtures.
pub fn range(start: &str, end: Option<&str>) -> KeyRange {
    KeyRange::new(start.into(), end.map(|end| end.into()))
}

/// A contract with one voter set and a primary.
pub fn simple(replicas: &[ServerId], primary: ServerId, branch: &CpuBranchIds) -> CpuContracts {
    build(replicas, replicas, None, Some((primary, None)), branch)
}

/// A contract with non-voting extra replicas, e.g. mid-backfill.
pub fn extra_replicas(
    voters: &[ServerId],
    extra: &[ServerId],
    primary: ServerId,
    branch: &CpuBranchIds,
) -> CpuContracts {
    let all: Vec<ServerId> = voters.iter().chain(extra).copied().collect();
    build(&all, voters, None, Some((primary, None)), branch)
}

/// A contract in the middle of a voter transition.
pub fn temp_voters(
    voters: &[ServerId],
    temp: &[ServerId],
    primary: ServerId,
    branch: &CpuBranchIds,
) -> CpuContracts {
    let all: Vec<ServerId> = voters.iter().chain(temp).copied().collect();
    build(&all, voters, Some(temp), Some((primary, None)), branch)
}

/// A contract in a voter transition with a hand-over in flight.
pub fn temp_voters_hand_over(
    voters: &[ServerId],
    temp: &[ServerId],
    primary: ServerId,
    hand_over: ServerId,
    branch: &CpuBranchIds,
) -> CpuContracts {
    let all: Vec<ServerId> = voters.iter().chain(temp).copied().collect();
    build(&all, voters, Some(temp), Some((primary, Some(hand_over))), branch)
}

/// A contract handing primacy over.
pub fn hand_over(
    replicas: &[ServerId],
    primary: ServerId,
    hand_over: ServerId,
    branch: &CpuBranchIds,
) -> CpuContracts {
    build(replicas, replicas, None, Some((primary, Some(hand_over))), branch)
}

/// A contract in the no-primary phase.
pub fn no_primary(replicas: &[ServerId], branch: &CpuBranchIds) -> CpuContracts {
    build(replicas, replicas, None, None, branch)
}

fn build(
    replicas: &[ServerId],
    voters: &[ServerId],
    temp_voters: Option<&[ServerId]>,
    primary: Option<(ServerId, Option<ServerId>)>,
    branch: &CpuBranchIds,
) -> CpuContracts {
    (0..CPU_SHARDS)
        .map(|i| Contract {
            replicas: replicas.iter().copied().collect(),
            voters: voters.iter().copied().collect(),
            temp_voters: temp_voters.map(|temp| temp.iter().copied().collect()),
            primary: primary.map(|(server, hand_over)| Primary { server, hand_over }),
            branch: branch.ids[i],
        })
        .collect()
}

/// The coordinator under test, together with the state and acks it reads.
pub struct Harness {
    pub state: TableRaftState,
    pub acks: AckMap,
    pub coordinator: Coordinator,
    ids: SeededIds,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_seed(0xC0FFEE)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: TableRaftState {
                config: TableConfig {
                    shards: Vec::new(),
                    write_ack: WriteAckMode::Majority,
                    failover_timeout_ms: 60_000,
                },
                shard_scheme: ShardScheme::default(),
                contracts: Default::default(),
                branch_history: BranchHistory::new(),
            },
            acks: AckMap::new(),
            coordinator: Coordinator::new(Box::new(SeededIds::new(seed))),
            ids: SeededIds::new(seed.wrapping_add(1)),
        }
    }

    /// Mints a server id.
    pub fn server(&mut self) -> ServerId {
        ServerId::from(self.ids.uuid())
    }

    /// Sets the desired config from (range, replicas, primary) triples. The
    /// ranges must tile the key space in order.
    pub fn set_config(&mut self, shards: &[(KeyRange, Vec<ServerId>, ServerId)]) {
        assert!(shards[0].0.start.is_empty(), "config must start at the minimum key");
        let mut split_points = Vec::new();
        let mut config_shards = Vec::new();
        for (i, (range, replicas, primary)) in shards.iter().enumerate() {
            if i > 0 {
                assert_eq!(shards[i - 1].0.end.as_ref(), Some(&range.start), "config has gaps");
            }
            match &range.end {
                Some(end) => split_points.push(end.clone()),
                None => assert_eq!(i, shards.len() - 1, "unbounded shard must be last"),
            }
            config_shards
                .push(ShardConfig { replicas: replicas.iter().copied().collect(), primary: *primary });
        }
        self.state.shard_scheme = ShardScheme { split_points };
        self.state.config.shards = config_shards;
    }

    /// Registers one branch per CPU shard in the state's branch history.
    pub fn branch(&mut self, origins: &[OriginEntry]) -> CpuBranchIds {
        let mut history = std::mem::take(&mut self.state.branch_history);
        let branch = self.branch_in(&mut history, origins);
        self.state.branch_history = history;
        branch
    }

    /// Registers one branch per CPU shard in the given history, e.g. a
    /// server-side fragment that is ahead of the replicated state.
    pub fn branch_in(
        &mut self,
        history: &mut BranchHistory,
        origins: &[OriginEntry],
    ) -> CpuBranchIds {
        let mut ids = Vec::with_capacity(CPU_SHARDS);
        let mut covered = None;
        for i in 0..CPU_SHARDS {
            let id = BranchId::from(self.ids.uuid());
            let origin = Self::version_map(origins, i);
            covered = Some(origin.range());
            history.insert(id, Branch::new(origin));
            ids.push(id);
        }
        CpuBranchIds { range: covered.expect("branch must cover a range"), ids }
    }

    /// Publishes the contracts for a key range, one per CPU shard, and
    /// returns their ids.
    pub fn add_contract(&mut self, range: &KeyRange, contracts: CpuContracts) -> CpuContractIds {
        assert_eq!(contracts.len(), CPU_SHARDS);
        let mut ids = Vec::with_capacity(CPU_SHARDS);
        for (i, contract) in contracts.into_iter().enumerate() {
            let id = ContractId::from(self.ids.uuid());
            let region = Region::new(HashRange::cpu_shard(i), range.clone());
            self.state.contracts.insert(id, (region, contract));
            ids.push(id);
        }
        CpuContractIds { range: range.clone(), ids }
    }

    /// Acks a plain progress state for every CPU shard of a contract.
    pub fn add_ack(&mut self, server: ServerId, contracts: &CpuContractIds, ack: ContractAck) {
        assert!(
            !matches!(
                ack,
                ContractAck::SecondaryNeedPrimary { .. } | ContractAck::PrimaryNeedBranch { .. }
            ),
            "use the dedicated helpers for acks with payloads"
        );
        for i in 0..CPU_SHARDS {
            self.acks.insert(server, contracts.ids[i], ack.clone());
        }
    }

    /// Acks SecondaryNeedPrimary with a version map and a history fragment.
    pub fn add_ack_need_primary(
        &mut self,
        server: ServerId,
        contracts: &CpuContractIds,
        fragment: &BranchHistory,
        versions: &[OriginEntry],
        failover_timeout_elapsed: bool,
    ) {
        for i in 0..CPU_SHARDS {
            let ack = ContractAck::SecondaryNeedPrimary {
                version: Self::version_map(versions, i),
                branch_history: fragment.clone(),
                failover_timeout_elapsed,
            };
            self.acks.insert(server, contracts.ids[i], ack);
        }
    }

    /// Acks PrimaryNeedBranch with the proposed branch and its fragment.
    pub fn add_ack_need_branch(
        &mut self,
        server: ServerId,
        contracts: &CpuContractIds,
        fragment: &BranchHistory,
        branch: &CpuBranchIds,
    ) {
        for i in 0..CPU_SHARDS {
            let ack = ContractAck::PrimaryNeedBranch {
                branch: branch.ids[i],
                branch_history: fragment.clone(),
            };
            self.acks.insert(server, contracts.ids[i], ack);
        }
    }

    /// Removes a server's acks for a contract, simulating a server failure.
    pub fn remove_ack(&mut self, server: ServerId, contracts: &CpuContractIds) {
        for i in 0..CPU_SHARDS {
            self.acks.remove(server, contracts.ids[i]);
        }
    }

    /// Runs one coordinator tick and applies it: contracts and branches are
    /// updated as one unit and acks of removed contracts are swept. Asserts
    /// the state invariants, and that an immediate second tick is a no-op.
    pub fn coordinate(&mut self) {
        let (contracts, branches) = self.coordinator.tick(&self.state, &self.acks);
        self.state.apply(&contracts, &branches);
        for id in &contracts.remove {
            self.acks.sweep(*id);
        }
        self.state.validate();

        let (contracts, branches) = self.coordinator.tick(&self.state, &self.acks);
        assert!(contracts.is_empty(), "second tick changed contracts: {contracts:?}");
        assert!(branches.is_empty(), "second tick changed branches: {branches:?}");
    }

    /// Asserts that the contracts for a key range match the expectation, and
    /// returns their (possibly fresh) ids.
    pub fn check_contract(
        &self,
        context: &str,
        range: &KeyRange,
        expected: &CpuContracts,
    ) -> CpuContractIds {
        let mut found: Vec<Option<ContractId>> = vec![None; CPU_SHARDS];
        for (id, (region, contract)) in &self.state.contracts {
            if region.keys == *range {
                let i = region.hash.shard_index();
                assert!(found[i].is_none(), "{context}: duplicate contract for cpu{i}");
                assert_eq!(&expected[i], contract, "{context}: cpu{i}");
                found[i] = Some(*id);
            }
        }
        let ids = found
            .into_iter()
            .enumerate()
            .map(|(i, id)| id.unwrap_or_else(|| panic!("{context}: no contract for cpu{i}")))
            .collect();
        CpuContractIds { range: range.clone(), ids }
    }

    /// Asserts that a contract survived the last tick under the same ids.
    pub fn check_same_contract(&self, contracts: &CpuContractIds) {
        for id in &contracts.ids {
            assert!(self.state.contracts.contains_key(id), "contract {id} was replaced");
        }
    }

    fn version_map(entries: &[OriginEntry], cpu: usize) -> RangeMap<Version> {
        RangeMap::from_entries(
            entries
                .iter()
                .map(|(range, parent, ts)| {
                    let version =
                        parent.map_or(Version::zero(), |p| Version::new(p.ids[cpu], *ts));
                    (range.clone(), version)
                })
                .collect(),
        )
    }
}
