//! Two-level gradient reduction.
//!
//! Replaces a flat all-reduce with reduce-to-leader, leader all-reduce and
//! local broadcast, so the cross-node hop carries one buffer per node instead
//! of one per rank. The final division is always by the full world size: the
//! local reduce already summed within each node and the leader all-reduce
//! across nodes, so every rank contributed exactly once.

use std::sync::Arc;

use log::debug;

use crate::{
    backend::Collectives,
    bucket::GradientBucket,
    error::{CommErr, Result},
    handle::OpHandle,
    topology::ProcessTopology,
};

/// Normalizes gradient buckets across all ranks via the two-level protocol.
pub struct HierarchicalReducer<C: Collectives> {
    comm: Arc<C>,
    topology: ProcessTopology,
}

impl<C: Collectives> HierarchicalReducer<C> {
    /// Creates a reducer for one rank.
    ///
    /// # Arguments
    /// * `comm` - The rank's collectives endpoint.
    /// * `topology` - The rank's derived topology.
    pub fn new(comm: Arc<C>, topology: ProcessTopology) -> Self {
        Self { comm, topology }
    }

    /// Returns this reducer's topology.
    pub fn topology(&self) -> &ProcessTopology {
        &self.topology
    }

    /// Issues the three-stage pipeline for one bucket.
    ///
    /// Stages chain as continuations, so this never blocks: local sum-reduce
    /// into the node leader; on leaders only, an all-reduce across the leader
    /// group; a broadcast from the leader back over the node; division by
    /// world size. The returned handle resolves once the normalized bucket is
    /// consumable.
    ///
    /// # Arguments
    /// * `bucket` - A ready bucket; consumed by the round.
    ///
    /// # Returns
    /// A handle resolving to the normalized bucket, or `BucketNotReady` when
    /// the producer side had not finished writing.
    pub fn reduce(&self, bucket: GradientBucket) -> Result<OpHandle<GradientBucket>> {
        if !bucket.is_ready() {
            return Err(CommErr::BucketNotReady);
        }

        let leader = self.topology.leader_rank();
        let local = self.topology.local_group().clone();
        let leaders = self.topology.leader_group().clone();
        let world_size = self.topology.world_size() as f32;
        let is_leader = self.topology.is_leader();

        debug!(
            rank = self.comm.rank(),
            scalars = bucket.len(),
            leader = is_leader;
            "issuing hierarchical reduction"
        );

        let (lens, buffer) = bucket.into_parts();

        let local_sum = self.comm.reduce_sum(buffer, leader, &local);

        let reduced = if is_leader {
            let comm = Arc::clone(&self.comm);
            let broadcast_comm = Arc::clone(&self.comm);
            let broadcast_group = local.clone();

            local_sum
                .then(move |node_sum| {
                    let handle = comm.all_reduce_sum(node_sum, &leaders);
                    async move { handle.wait().await }
                })
                .then(move |total| {
                    let handle = broadcast_comm.broadcast(total, leader, &broadcast_group);
                    async move { handle.wait().await }
                })
        } else {
            // Non-leaders skip the cross-node stage and wait on the leader's
            // broadcast; their stale stage-1 buffer is replaced by it.
            let comm = Arc::clone(&self.comm);
            local_sum.then(move |stale| {
                let handle = comm.broadcast(stale, leader, &local);
                async move { handle.wait().await }
            })
        };

        Ok(reduced.then(move |mut total| async move {
            for v in &mut total {
                *v /= world_size;
            }
            GradientBucket::from_parts(lens, total)
        }))
    }
}
