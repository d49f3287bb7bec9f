//! Multi-rank linear-regression demo on the in-process cluster.
//!
//! Four ranks over two simulated nodes fit `y = 2x + 1` with the
//! hierarchical reducer and a two-micro-batch accumulation window.

use std::{num::NonZeroUsize, sync::Arc};

use collectives::LocalCluster;
use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::task::JoinSet;
use training::{Parameter, TrainSession, TrainingConfig};

const WORLD_SIZE: usize = 4;
const RANKS_PER_NODE: usize = 2;
const EPOCHS: usize = 30;
// Odd on purpose: the last window is partial and exercises the forced flush.
const MICRO_BATCHES: usize = 5;
const BATCH: usize = 8;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cluster = LocalCluster::new(WORLD_SIZE, RANKS_PER_NODE)?;
    let mut ranks = JoinSet::new();

    for rank in 0..WORLD_SIZE {
        let comm = Arc::new(cluster.comm(rank)?);
        let topology = cluster.topology(rank)?;
        ranks.spawn(run_rank(rank, comm, topology));
    }

    while let Some(result) = ranks.join_next().await {
        result??;
    }
    Ok(())
}

async fn run_rank(
    rank: usize,
    comm: Arc<collectives::LocalComm>,
    topology: collectives::ProcessTopology,
) -> training::Result<()> {
    let config = TrainingConfig {
        learning_rate: 0.05,
        weight_decay: 0.01,
        accumulation_frequency: NonZeroUsize::new(2).expect("2 is non-zero"),
        ranks_per_node: NonZeroUsize::new(RANKS_PER_NODE).expect("non-zero"),
        hierarchical: true,
        ..Default::default()
    };

    // Only rank 0's initialization survives the startup broadcast.
    let init = if rank == 0 { vec![0.5, -0.5] } else { vec![9.0, 9.0] };
    let params = vec![Parameter::from_f32("wb", init)];

    let mut session = TrainSession::configure(config, topology, comm, params)?;
    session.broadcast_parameters().await?;

    // Each rank sees its own shard of the data.
    let mut rng = StdRng::seed_from_u64(42 + rank as u64);

    for epoch in 0..EPOCHS {
        let mut epoch_loss = 0.0f32;

        for _ in 0..MICRO_BATCHES {
            let (loss, grad) = micro_batch(&mut rng, session.params()[0].values_f32());

            // Scale the loss (and therefore its gradient) by the window size
            // before "backward".
            let loss = session.scale_loss(loss);
            epoch_loss += loss;

            let scaled: Vec<f32> = grad.iter().map(|g| session.scale_loss(*g)).collect();
            session.params_mut()[0].accumulate_grad(&scaled)?;
            session.step(loss).await?;
        }

        session.flush().await?;
        session.epoch_barrier().await?;

        if session.is_primary() {
            let wb = session.params()[0].values_f32();
            info!(
                epoch = epoch,
                loss = epoch_loss as f64,
                w = wb[0] as f64,
                b = wb[1] as f64;
                "epoch finished"
            );
        }
    }

    Ok(())
}

/// Mean-squared-error micro-batch for `y = 2x + 1`: returns the loss and the
/// gradient with respect to `[w, b]`.
fn micro_batch(rng: &mut StdRng, wb: Vec<f32>) -> (f32, Vec<f32>) {
    let (w, b) = (wb[0], wb[1]);
    let mut loss = 0.0;
    let mut grad = vec![0.0f32; 2];

    for _ in 0..BATCH {
        let x: f32 = rng.random_range(-1.0..1.0);
        let y = 2.0 * x + 1.0;
        let err = w * x + b - y;

        loss += err * err / BATCH as f32;
        grad[0] += 2.0 * err * x / BATCH as f32;
        grad[1] += 2.0 * err / BATCH as f32;
    }

    (loss, grad)
}
