mod lamb;
mod optimizer;

pub use lamb::Lamb;
pub use optimizer::Optimizer;
