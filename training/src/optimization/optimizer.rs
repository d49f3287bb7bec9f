use crate::{error::Result, param::Parameter};

/// Applies one update step to a set of parameters from their accumulated,
/// already-normalized gradients.
///
/// Implementations never trigger cross-process communication for the
/// gradient path; by the time `step` runs the gradients are assumed to hold
/// the mean over the full effective batch.
pub trait Optimizer {
    /// Mutates every parameter that carries a gradient, skipping the rest.
    ///
    /// # Arguments
    /// * `params` - The trainable parameters with their gradients attached.
    ///
    /// # Returns
    /// An error on sparse gradients or shape mismatches.
    fn step(&mut self, params: &mut [Parameter]) -> Result<()>;

    /// Overrides the learning rate. Schedule curves live in the driver.
    fn set_learning_rate(&mut self, lr: f64);

    /// Returns the current learning rate.
    fn learning_rate(&self) -> f64;
}
