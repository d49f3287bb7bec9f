pub mod backend;
pub mod bucket;
pub mod error;
pub mod group;
pub mod handle;
pub mod hierarchical;
pub mod local;
pub mod topology;

pub use backend::Collectives;
pub use bucket::GradientBucket;
pub use error::{CommErr, Result};
pub use group::{GroupId, ProcessGroup};
pub use handle::OpHandle;
pub use hierarchical::HierarchicalReducer;
pub use local::{LocalCluster, LocalComm};
pub use topology::{ProcessTopology, TopologySpec};
