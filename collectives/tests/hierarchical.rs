use std::sync::Arc;

use tokio::task::JoinSet;

use collectives::{GradientBucket, HierarchicalReducer, LocalCluster};

/// Runs the two-level pipeline at every rank of an in-process cluster and
/// returns each rank's normalized buffer.
async fn run_hierarchical(
    world_size: usize,
    ranks_per_node: usize,
    inputs: Vec<Vec<f32>>,
) -> Vec<Vec<f32>> {
    let cluster = LocalCluster::new(world_size, ranks_per_node).unwrap();
    let mut tasks = JoinSet::new();

    for (rank, input) in inputs.into_iter().enumerate() {
        let comm = Arc::new(cluster.comm(rank).unwrap());
        let topology = cluster.topology(rank).unwrap();

        tasks.spawn(async move {
            let reducer = HierarchicalReducer::new(comm, topology);
            let bucket = GradientBucket::collect([&input[..]]);
            let normalized = reducer.reduce(bucket).unwrap().wait().await.unwrap();
            (rank, normalized.buffer().to_vec())
        });
    }

    let mut results = vec![Vec::new(); world_size];
    while let Some(result) = tasks.join_next().await {
        let (rank, buf) = result.unwrap();
        results[rank] = buf;
    }
    results
}

/// Flat reference: sum every rank's input and divide by world size.
fn flat_average(inputs: &[Vec<f32>]) -> Vec<f32> {
    let mut avg = vec![0.0f32; inputs[0].len()];
    for input in inputs {
        for (a, b) in avg.iter_mut().zip(input) {
            *a += b;
        }
    }
    for v in &mut avg {
        *v /= inputs.len() as f32;
    }
    avg
}

fn assert_close(got: &[f32], expected: &[f32]) {
    assert_eq!(got.len(), expected.len());
    for (g, e) in got.iter().zip(expected) {
        assert!((g - e).abs() <= 1e-5, "got {g}, expected {e}");
    }
}

#[tokio::test]
async fn matches_flat_all_reduce_two_nodes() {
    let inputs: Vec<Vec<f32>> = (0..4)
        .map(|r| vec![r as f32, r as f32 * 0.5 - 1.0, 0.25])
        .collect();
    let expected = flat_average(&inputs);

    for buf in run_hierarchical(4, 2, inputs).await {
        assert_close(&buf, &expected);
    }
}

#[tokio::test]
async fn matches_flat_all_reduce_three_nodes() {
    let inputs: Vec<Vec<f32>> = (0..6)
        .map(|r| vec![(r * r) as f32 * 0.1, -(r as f32)])
        .collect();
    let expected = flat_average(&inputs);

    for buf in run_hierarchical(6, 2, inputs).await {
        assert_close(&buf, &expected);
    }
}

#[tokio::test]
async fn degenerate_one_rank_per_node() {
    // Every rank is its own leader; stage 1 and 3 are node-local no-ops and
    // stage 2 does all the work.
    let inputs: Vec<Vec<f32>> = (0..3).map(|r| vec![r as f32 + 1.0]).collect();
    let expected = flat_average(&inputs);

    for buf in run_hierarchical(3, 1, inputs).await {
        assert_close(&buf, &expected);
    }
}

#[tokio::test]
async fn degenerate_single_node() {
    // One leader; the cross-node all-reduce has a single member.
    let inputs: Vec<Vec<f32>> = (0..4).map(|r| vec![r as f32, 2.0]).collect();
    let expected = flat_average(&inputs);

    for buf in run_hierarchical(4, 4, inputs).await {
        assert_close(&buf, &expected);
    }
}

#[tokio::test]
async fn preserves_bucket_layout() {
    let cluster = LocalCluster::new(2, 2).unwrap();
    let mut tasks = JoinSet::new();

    for rank in 0..2 {
        let comm = Arc::new(cluster.comm(rank).unwrap());
        let topology = cluster.topology(rank).unwrap();

        tasks.spawn(async move {
            let a = vec![1.0f32, 2.0];
            let b = vec![10.0f32];
            let reducer = HierarchicalReducer::new(comm, topology);
            let bucket = GradientBucket::collect([&a[..], &b[..]]);
            let normalized = reducer.reduce(bucket).unwrap().wait().await.unwrap();

            let mut out_a = [0.0f32; 2];
            let mut out_b = [0.0f32; 1];
            normalized.scatter([&mut out_a[..], &mut out_b[..]]).unwrap();
            (out_a, out_b)
        });
    }

    while let Some(result) = tasks.join_next().await {
        let (a, b) = result.unwrap();
        assert_eq!(a, [1.0, 2.0]);
        assert_eq!(b, [10.0]);
    }
}

#[tokio::test]
async fn rejects_unready_bucket() {
    let cluster = LocalCluster::new(1, 1).unwrap();
    let comm = Arc::new(cluster.comm(0).unwrap());
    let topology = cluster.topology(0).unwrap();
    let reducer = HierarchicalReducer::new(comm, topology);

    let mut bucket = GradientBucket::new();
    bucket.push(&[1.0]);

    assert!(reducer.reduce(bucket).is_err());
}
