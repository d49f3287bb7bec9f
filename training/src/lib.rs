pub mod accumulation;
pub mod config;
pub mod error;
pub mod optimization;
pub mod param;
pub mod session;

pub use accumulation::{GradAccumulator, SyncDecision};
pub use config::TrainingConfig;
pub use error::{Result, TrainErr};
pub use optimization::{Lamb, Optimizer};
pub use param::{Gradient, ParamState, Parameter};
pub use session::TrainSession;
