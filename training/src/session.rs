//! Driver boundary.
//!
//! The training loop owns forward/backward; per micro-batch it scales the
//! loss, writes gradients into the parameters and calls `step`. Everything
//! else (the accumulate/sync decision, gradient normalization across ranks,
//! the optimizer invocation and buffer clearing) happens here. The reducer
//! runs only when the accumulator closes a window, never during accumulation.

use std::sync::Arc;

use collectives::{CommErr, Collectives, GradientBucket, HierarchicalReducer, ProcessTopology};
use log::{debug, info};

use crate::{
    accumulation::{GradAccumulator, SyncDecision},
    config::TrainingConfig,
    error::{Result, TrainErr},
    optimization::{Lamb, Optimizer},
    param::{Gradient, Parameter},
};

/// One rank's training session: parameters, optimizer, accumulator and the
/// communication path used on sync steps.
pub struct TrainSession<C: Collectives> {
    topology: ProcessTopology,
    comm: Arc<C>,
    reducer: Option<HierarchicalReducer<C>>,
    optimizer: Lamb,
    accumulator: GradAccumulator,
    params: Vec<Parameter>,
}

impl<C: Collectives> TrainSession<C> {
    /// Builds a session from a validated configuration.
    ///
    /// The hierarchical reducer is installed iff the configuration asks for
    /// it; a given run uses either the reducer or `average_gradients`, never
    /// both, since each already divides by world size.
    ///
    /// # Arguments
    /// * `config` - Hyperparameters and sync policy.
    /// * `topology` - This rank's derived topology.
    /// * `comm` - This rank's collectives endpoint.
    /// * `params` - The trainable parameters, identically ordered on every rank.
    ///
    /// # Returns
    /// A new session, or a validation error.
    pub fn configure(
        config: TrainingConfig,
        topology: ProcessTopology,
        comm: Arc<C>,
        params: Vec<Parameter>,
    ) -> Result<Self> {
        config.validate()?;

        if config.ranks_per_node.get() != topology.ranks_per_node() {
            return Err(TrainErr::Comm(CommErr::TopologyInconsistency {
                world_size: topology.world_size(),
                ranks_per_node: config.ranks_per_node.get(),
            }));
        }

        let optimizer = Lamb::new(&config)?;
        let accumulator = GradAccumulator::new(config.accumulation_frequency);
        let reducer = config
            .hierarchical
            .then(|| HierarchicalReducer::new(Arc::clone(&comm), topology.clone()));

        if topology.is_primary() {
            info!(
                world_size = topology.world_size(),
                ranks_per_node = topology.ranks_per_node(),
                accumulation_frequency = accumulator.frequency(),
                hierarchical = reducer.is_some();
                "training session configured"
            );
        }

        Ok(Self {
            topology,
            comm,
            reducer,
            optimizer,
            accumulator,
            params,
        })
    }

    /// Returns this rank's topology.
    pub fn topology(&self) -> &ProcessTopology {
        &self.topology
    }

    /// Returns whether this rank is the run-wide primary.
    pub fn is_primary(&self) -> bool {
        self.topology.is_primary()
    }

    /// Returns the parameters.
    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Returns the parameters mutably, for the backward pass to write
    /// gradients into.
    pub fn params_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    /// Returns the optimizer, for state inspection and learning-rate control.
    pub fn optimizer(&self) -> &Lamb {
        &self.optimizer
    }

    /// Returns the optimizer mutably.
    pub fn optimizer_mut(&mut self) -> &mut Lamb {
        &mut self.optimizer
    }

    /// Divides a micro-batch loss for accumulation; apply before backward.
    pub fn scale_loss(&self, loss: f32) -> f32 {
        self.accumulator.scale_loss(loss)
    }

    /// Advances the session past one micro-batch.
    ///
    /// # Arguments
    /// * `loss` - The (already scaled) loss of this micro-batch, checked for
    ///   divergence.
    ///
    /// # Returns
    /// `true` when a sync step ran, `false` when the gradients only
    /// accumulated locally. `NumericDivergence` stops the run on a
    /// non-finite loss or gradient.
    pub async fn step(&mut self, loss: f32) -> Result<bool> {
        if !loss.is_finite() {
            return Err(TrainErr::NumericDivergence {
                what: "loss",
                param: None,
            });
        }

        match self.accumulator.advance() {
            SyncDecision::Accumulate => {
                debug!(
                    micro_batch = self.accumulator.micro_batches();
                    "accumulating locally"
                );
                Ok(false)
            }
            SyncDecision::SyncStep => {
                self.sync_and_step().await?;
                Ok(true)
            }
        }
    }

    /// Forces a sync step for a trailing partial window. Call at the end of
    /// every epoch whose micro-batch count is not a multiple of the
    /// accumulation frequency.
    ///
    /// # Returns
    /// `true` when pending gradients were flushed and stepped.
    pub async fn flush(&mut self) -> Result<bool> {
        if !self.accumulator.flush() {
            return Ok(false);
        }

        debug!("flushing trailing partial accumulation window");
        self.sync_and_step().await?;
        Ok(true)
    }

    /// Rank 0 broadcasts every parameter's value to all ranks. Run once at
    /// startup so replicas begin identical; no-op in a single-rank world.
    pub async fn broadcast_parameters(&mut self) -> Result<()> {
        if self.topology.world_size() == 1 {
            return Ok(());
        }

        let group = self.topology.global_group().clone();
        for i in 0..self.params.len() {
            let buf = self.params[i].values_f32();
            let out = self.comm.broadcast(buf, 0, &group).wait().await?;
            self.params[i].set_from_f32(&out)?;
        }

        // No rank starts its loop before every replica is aligned.
        self.comm.barrier(&group).wait().await?;

        if self.is_primary() {
            info!(params = self.params.len(); "broadcast initial parameters");
        }
        Ok(())
    }

    /// Flat fallback path: all-reduce every gradient, then divide by world
    /// size. Mutually exclusive with the hierarchical reducer within a run.
    pub async fn average_gradients(&mut self) -> Result<()> {
        let world_size = self.topology.world_size();
        if world_size == 1 {
            return Ok(());
        }

        let group = self.topology.global_group().clone();
        for i in 0..self.params.len() {
            let grad = match self.params[i].grad() {
                None => continue,
                Some(Gradient::Sparse { .. }) => {
                    return Err(TrainErr::UnsupportedGradientLayout {
                        param: self.params[i].name().to_string(),
                    });
                }
                Some(Gradient::Dense(g)) => g.clone(),
            };

            let mut summed = self.comm.all_reduce_sum(grad, &group).wait().await?;
            for v in &mut summed {
                *v /= world_size as f32;
            }

            let dest = self.params[i]
                .dense_grad_mut()
                .expect("layout checked above");
            dest.copy_from_slice(&summed);
        }
        Ok(())
    }

    /// Waits for every rank at an epoch boundary; used for timing alignment.
    pub async fn epoch_barrier(&self) -> Result<()> {
        self.comm
            .barrier(self.topology.global_group())
            .wait()
            .await?;
        Ok(())
    }

    /// Normalizes gradients across ranks, runs the optimizer once and clears
    /// every gradient buffer.
    async fn sync_and_step(&mut self) -> Result<()> {
        self.check_gradients_finite()?;

        if self.topology.world_size() > 1 {
            if self.reducer.is_some() {
                self.reduce_hierarchical().await?;
            } else {
                self.average_gradients().await?;
            }
        }

        self.optimizer.step(&mut self.params)?;

        for param in &mut self.params {
            param.clear_grad();
        }
        Ok(())
    }

    /// Runs one bucketed round of the two-level reducer over every dense
    /// gradient and scatters the normalized buffer back.
    async fn reduce_hierarchical(&mut self) -> Result<()> {
        let reducer = self.reducer.as_ref().expect("caller checked the reducer");

        let mut bucket = GradientBucket::new();
        let mut have_grads = false;

        for param in &self.params {
            match param.grad() {
                None => continue,
                Some(Gradient::Sparse { .. }) => {
                    return Err(TrainErr::UnsupportedGradientLayout {
                        param: param.name().to_string(),
                    });
                }
                Some(Gradient::Dense(g)) => {
                    bucket.push(g);
                    have_grads = true;
                }
            }
        }

        if !have_grads {
            return Ok(());
        }
        bucket.mark_ready();

        let normalized = reducer.reduce(bucket)?.wait().await?;

        // Scatter order matches push order: params with dense gradients, in
        // parameter order.
        let slices = self
            .params
            .iter_mut()
            .filter_map(|param| param.dense_grad_mut());
        normalized.scatter(slices)?;

        Ok(())
    }

    fn check_gradients_finite(&self) -> Result<()> {
        for param in &self.params {
            let values = match param.grad() {
                None => continue,
                Some(Gradient::Dense(g)) => g.as_slice(),
                Some(Gradient::Sparse { values, .. }) => values.as_slice(),
            };
            if values.iter().any(|v| !v.is_finite()) {
                return Err(TrainErr::NumericDivergence {
                    what: "gradient",
                    param: Some(param.name().to_string()),
                });
            }
        }
        Ok(())
    }
}
