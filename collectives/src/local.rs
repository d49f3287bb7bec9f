//! In-process reference backend.
//!
//! Every rank lives on its own task inside one process and collectives meet
//! at rendezvous rounds keyed by `(group, sequence)`. Members of a group are
//! required to issue the same operations in the same order, so the n-th
//! operation a rank issues on a group pairs with the n-th of every other
//! member. Mismatched operation kinds poison the round for everyone instead
//! of deadlocking.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;

use crate::{
    backend::Collectives,
    error::{CommErr, Result},
    group::{GroupId, ProcessGroup},
    handle::OpHandle,
    topology::{ProcessTopology, TopologySpec},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    ReduceSum { dst: usize },
    AllReduceSum,
    Broadcast { src: usize },
    Barrier,
}

impl OpKind {
    fn name(&self) -> &'static str {
        match self {
            OpKind::ReduceSum { .. } => "reduce_sum",
            OpKind::AllReduceSum => "all_reduce_sum",
            OpKind::Broadcast { .. } => "broadcast",
            OpKind::Barrier => "barrier",
        }
    }
}

struct Round {
    kind: OpKind,
    expected: usize,
    contributions: HashMap<usize, Vec<f32>>,
    waiters: HashMap<usize, oneshot::Sender<Result<Vec<f32>>>>,
}

#[derive(Default)]
struct ClusterState {
    rounds: Mutex<HashMap<(GroupId, u64), Round>>,
}

/// Shared state for a set of in-process ranks.
///
/// A real deployment swaps this for an implementation of `Collectives`
/// backed by the cluster's fabric; tests and the demo binary run every rank
/// as a task against one `LocalCluster`.
pub struct LocalCluster {
    world_size: usize,
    ranks_per_node: usize,
    state: Arc<ClusterState>,
}

impl LocalCluster {
    /// Creates a cluster of `world_size` ranks spread `ranks_per_node` to a node.
    ///
    /// # Returns
    /// A new `LocalCluster`, or an error when the node size does not divide
    /// the world size.
    pub fn new(world_size: usize, ranks_per_node: usize) -> Result<Self> {
        if world_size == 0 || ranks_per_node == 0 || world_size % ranks_per_node != 0 {
            return Err(CommErr::TopologyInconsistency {
                world_size,
                ranks_per_node,
            });
        }

        Ok(Self {
            world_size,
            ranks_per_node,
            state: Arc::new(ClusterState::default()),
        })
    }

    /// Returns the total number of ranks.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Derives the topology for one of this cluster's ranks.
    pub fn topology(&self, rank: usize) -> Result<ProcessTopology> {
        ProcessTopology::new(TopologySpec {
            rank,
            world_size: self.world_size,
            ranks_per_node: self.ranks_per_node,
        })
    }

    /// Creates the collectives endpoint for `rank`.
    pub fn comm(&self, rank: usize) -> Result<LocalComm> {
        if rank >= self.world_size {
            return Err(CommErr::RankOutOfRange {
                rank,
                world_size: self.world_size,
            });
        }

        Ok(LocalComm {
            rank,
            state: Arc::clone(&self.state),
            seq: Mutex::new(HashMap::new()),
        })
    }
}

/// One rank's endpoint into a `LocalCluster`.
pub struct LocalComm {
    rank: usize,
    state: Arc<ClusterState>,
    seq: Mutex<HashMap<GroupId, u64>>,
}

impl LocalComm {
    fn next_seq(&self, group: &GroupId) -> u64 {
        let mut seq = self.seq.lock().expect("seq lock poisoned");
        let counter = seq.entry(group.clone()).or_insert(0);
        let current = *counter;
        *counter += 1;
        current
    }

    /// Joins the rendezvous round for this rank's next operation on `group`.
    /// The last member to arrive resolves the round for everyone.
    fn join(&self, kind: OpKind, buf: Vec<f32>, group: &ProcessGroup) -> OpHandle<Vec<f32>> {
        if !group.contains(self.rank) {
            return OpHandle::failed(CommErr::RankNotInGroup {
                rank: self.rank,
                group: group.id().to_string(),
            });
        }

        let seq = self.next_seq(group.id());
        let key = (group.id().clone(), seq);

        let mut rounds = self.state.rounds.lock().expect("rounds lock poisoned");
        let round = rounds.entry(key.clone()).or_insert_with(|| Round {
            kind,
            expected: group.len(),
            contributions: HashMap::new(),
            waiters: HashMap::new(),
        });

        if round.kind != kind {
            let err = CommErr::CollectiveMismatch {
                got: kind.name(),
                expected: round.kind.name(),
            };
            poison(rounds.remove(&key).expect("round inserted above"));
            return OpHandle::failed(err);
        }

        if let Some(first) = round.contributions.values().next()
            && first.len() != buf.len()
        {
            let err = CommErr::BufferSizeMismatch {
                got: buf.len(),
                expected: first.len(),
            };
            poison(rounds.remove(&key).expect("round inserted above"));
            return OpHandle::failed(err);
        }

        let (tx, rx) = oneshot::channel();
        round.contributions.insert(self.rank, buf);
        round.waiters.insert(self.rank, tx);

        if round.contributions.len() == round.expected {
            let round = rounds.remove(&key).expect("round inserted above");
            resolve(round);
        }

        drop(rounds);

        OpHandle::spawn(async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(CommErr::CommunicationFailure {
                    stage: "rendezvous",
                    detail: "round dropped before resolving".to_string(),
                }),
            }
        })
    }
}

/// Delivers the round's result to every waiter.
fn resolve(mut round: Round) {
    let sum = || {
        let mut acc = vec![0.0f32; round.contributions.values().next().map_or(0, Vec::len)];
        for buf in round.contributions.values() {
            for (a, b) in acc.iter_mut().zip(buf) {
                *a += b;
            }
        }
        acc
    };

    match round.kind {
        OpKind::AllReduceSum => {
            let sum = sum();
            for (_, tx) in round.waiters.drain() {
                let _ = tx.send(Ok(sum.clone()));
            }
        }
        OpKind::ReduceSum { dst } => {
            let sum = sum();
            for (rank, tx) in round.waiters.drain() {
                let result = if rank == dst {
                    sum.clone()
                } else {
                    round.contributions[&rank].clone()
                };
                let _ = tx.send(Ok(result));
            }
        }
        OpKind::Broadcast { src } => {
            if !round.contributions.contains_key(&src) {
                for (rank, tx) in round.waiters.drain() {
                    let _ = tx.send(Err(CommErr::RankNotInGroup {
                        rank,
                        group: format!("broadcast source {src}"),
                    }));
                }
                return;
            }
            let source = round.contributions[&src].clone();
            for (_, tx) in round.waiters.drain() {
                let _ = tx.send(Ok(source.clone()));
            }
        }
        OpKind::Barrier => {
            for (_, tx) in round.waiters.drain() {
                let _ = tx.send(Ok(Vec::new()));
            }
        }
    }
}

/// Fails every rank already parked in a broken round.
fn poison(mut round: Round) {
    let expected = round.kind.name();
    for (_, tx) in round.waiters.drain() {
        let _ = tx.send(Err(CommErr::CommunicationFailure {
            stage: "rendezvous",
            detail: format!("round poisoned, another rank diverged from {expected}"),
        }));
    }
}

impl Collectives for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn reduce_sum(&self, buf: Vec<f32>, dst: usize, group: &ProcessGroup) -> OpHandle<Vec<f32>> {
        self.join(OpKind::ReduceSum { dst }, buf, group)
    }

    fn all_reduce_sum(&self, buf: Vec<f32>, group: &ProcessGroup) -> OpHandle<Vec<f32>> {
        self.join(OpKind::AllReduceSum, buf, group)
    }

    fn broadcast(&self, buf: Vec<f32>, src: usize, group: &ProcessGroup) -> OpHandle<Vec<f32>> {
        self.join(OpKind::Broadcast { src }, buf, group)
    }

    fn barrier(&self, group: &ProcessGroup) -> OpHandle<()> {
        self.join(OpKind::Barrier, Vec::new(), group)
            .then(|_| async move { Ok(()) })
    }
}
