use std::{error::Error, fmt};

/// The collectives module's result type.
pub type Result<T> = std::result::Result<T, CommErr>;

/// Communication layer failures.
#[derive(Debug)]
pub enum CommErr {
    TopologyInconsistency {
        world_size: usize,
        ranks_per_node: usize,
    },
    RankOutOfRange {
        rank: usize,
        world_size: usize,
    },
    RankNotInGroup {
        rank: usize,
        group: String,
    },
    BufferSizeMismatch {
        got: usize,
        expected: usize,
    },
    BucketNotReady,
    CollectiveMismatch {
        got: &'static str,
        expected: &'static str,
    },
    CommunicationFailure {
        stage: &'static str,
        detail: String,
    },
}

impl fmt::Display for CommErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommErr::TopologyInconsistency {
                world_size,
                ranks_per_node,
            } => write!(
                f,
                "world size {world_size} is not divisible by ranks per node {ranks_per_node}"
            ),
            CommErr::RankOutOfRange { rank, world_size } => {
                write!(f, "rank {rank} is outside the world of size {world_size}")
            }
            CommErr::RankNotInGroup { rank, group } => {
                write!(f, "rank {rank} does not belong to group {group}")
            }
            CommErr::BufferSizeMismatch { got, expected } => write!(
                f,
                "buffer length mismatch within a collective round: got {got}, expected {expected}"
            ),
            CommErr::BucketNotReady => {
                write!(f, "gradient bucket handed to the reducer before it was marked ready")
            }
            CommErr::CollectiveMismatch { got, expected } => write!(
                f,
                "ranks disagree on the collective being issued: got {got}, expected {expected}"
            ),
            CommErr::CommunicationFailure { stage, detail } => {
                write!(f, "collective failed at {stage}: {detail}")
            }
        }
    }
}

impl Error for CommErr {}
