use crate::{
    error::{CommErr, Result},
    group::{GroupId, ProcessGroup},
};

/// Externally supplied topology hints for one process.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TopologySpec {
    pub rank: usize,
    pub world_size: usize,
    pub ranks_per_node: usize,
}

/// Immutable view of where one rank sits in the cluster.
///
/// Derived once at process start from a `TopologySpec`: the node-local group
/// (ranks sharing this rank's node) and the leader group (rank 0 of every
/// node). Local groups partition `0..world_size` by construction.
#[derive(Debug, Clone)]
pub struct ProcessTopology {
    rank: usize,
    world_size: usize,
    ranks_per_node: usize,
    node_id: usize,
    local_group: ProcessGroup,
    leader_group: ProcessGroup,
    global_group: ProcessGroup,
}

impl ProcessTopology {
    /// Derives the topology for one rank.
    ///
    /// # Arguments
    /// * `spec` - The rank, world size and ranks-per-node assignment.
    ///
    /// # Returns
    /// A new `ProcessTopology`, or an error when `world_size` is zero or not
    /// divisible by `ranks_per_node`, or when `rank >= world_size`.
    pub fn new(spec: TopologySpec) -> Result<Self> {
        let TopologySpec {
            rank,
            world_size,
            ranks_per_node,
        } = spec;

        if world_size == 0 || ranks_per_node == 0 || world_size % ranks_per_node != 0 {
            return Err(CommErr::TopologyInconsistency {
                world_size,
                ranks_per_node,
            });
        }

        if rank >= world_size {
            return Err(CommErr::RankOutOfRange { rank, world_size });
        }

        let node_id = rank / ranks_per_node;

        let local_ranks = (0..ranks_per_node)
            .map(|i| node_id * ranks_per_node + i)
            .collect();
        let leader_ranks = (0..world_size).step_by(ranks_per_node).collect();
        let global_ranks = (0..world_size).collect();

        Ok(Self {
            rank,
            world_size,
            ranks_per_node,
            node_id,
            local_group: ProcessGroup::new(GroupId::Node(node_id), local_ranks),
            leader_group: ProcessGroup::new(GroupId::Leaders, leader_ranks),
            global_group: ProcessGroup::new(GroupId::Global, global_ranks),
        })
    }

    /// Returns this process's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the total number of ranks.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Returns the number of ranks co-located on each node.
    pub fn ranks_per_node(&self) -> usize {
        self.ranks_per_node
    }

    /// Returns the id of the node this rank sits on.
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    /// Returns whether this rank is its node's leader (first rank of the node).
    pub fn is_leader(&self) -> bool {
        self.rank % self.ranks_per_node == 0
    }

    /// Returns whether this rank is the run-wide primary (rank 0). Logging
    /// and parameter broadcast use this flag rather than re-deriving it.
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    /// Returns the leader rank of this rank's node.
    pub fn leader_rank(&self) -> usize {
        self.node_id * self.ranks_per_node
    }

    /// Returns the group of ranks sharing this rank's node.
    pub fn local_group(&self) -> &ProcessGroup {
        &self.local_group
    }

    /// Returns the group holding one leader rank per node.
    pub fn leader_group(&self) -> &ProcessGroup {
        &self.leader_group
    }

    /// Returns the group covering every rank.
    pub fn global_group(&self) -> &ProcessGroup {
        &self.global_group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rank: usize, world_size: usize, ranks_per_node: usize) -> TopologySpec {
        TopologySpec {
            rank,
            world_size,
            ranks_per_node,
        }
    }

    #[test]
    fn derives_groups_for_two_nodes() {
        let topo = ProcessTopology::new(spec(5, 8, 4)).unwrap();

        assert_eq!(topo.node_id(), 1);
        assert_eq!(topo.local_group().ranks(), &[4, 5, 6, 7]);
        assert_eq!(topo.leader_group().ranks(), &[0, 4]);
        assert_eq!(topo.global_group().len(), 8);
        assert_eq!(topo.leader_rank(), 4);
        assert!(!topo.is_leader());
        assert!(!topo.is_primary());
    }

    #[test]
    fn leader_flags() {
        let topo = ProcessTopology::new(spec(4, 8, 4)).unwrap();
        assert!(topo.is_leader());
        assert!(!topo.is_primary());

        let topo = ProcessTopology::new(spec(0, 8, 4)).unwrap();
        assert!(topo.is_leader());
        assert!(topo.is_primary());
    }

    #[test]
    fn local_groups_partition_the_world() {
        let world_size = 12;
        let ranks_per_node = 3;
        let mut seen = vec![0usize; world_size];

        for rank in 0..world_size {
            let topo = ProcessTopology::new(spec(rank, world_size, ranks_per_node)).unwrap();
            assert!(topo.local_group().contains(rank));
            for &r in topo.local_group().ranks() {
                if r == rank {
                    seen[r] += 1;
                }
            }
        }

        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn single_rank_world() {
        let topo = ProcessTopology::new(spec(0, 1, 1)).unwrap();
        assert!(topo.is_leader());
        assert_eq!(topo.local_group().ranks(), &[0]);
        assert_eq!(topo.leader_group().ranks(), &[0]);
    }

    #[test]
    fn rejects_indivisible_world() {
        let err = ProcessTopology::new(spec(0, 10, 4)).unwrap_err();
        assert!(matches!(err, CommErr::TopologyInconsistency { .. }));
    }

    #[test]
    fn rejects_zero_sizes() {
        assert!(ProcessTopology::new(spec(0, 0, 1)).is_err());
        assert!(ProcessTopology::new(spec(0, 4, 0)).is_err());
    }

    #[test]
    fn rejects_rank_outside_world() {
        let err = ProcessTopology::new(spec(8, 8, 4)).unwrap_err();
        assert!(matches!(err, CommErr::RankOutOfRange { .. }));
    }

    #[test]
    fn spec_round_trips_through_json() {
        let json = serde_json::to_string(&spec(5, 8, 4)).unwrap();
        let back: TopologySpec = serde_json::from_str(&json).unwrap();

        assert_eq!(back.rank, 5);
        assert_eq!(back.world_size, 8);
        assert_eq!(back.ranks_per_node, 4);
    }
}
