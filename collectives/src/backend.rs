use crate::{group::ProcessGroup, handle::OpHandle};

/// Boundary to the collective-communication primitive library.
///
/// One instance exists per rank and knows which rank it speaks for. Every
/// operation is issued in non-blocking form and returns an `OpHandle`; the
/// buffer travels by value and comes back through the handle. Failures are
/// fatal to the run, implementations do not retry.
pub trait Collectives: Send + Sync + 'static {
    /// Returns the rank this instance issues operations for.
    fn rank(&self) -> usize;

    /// Sum-reduces `buf` across `group` into `dst`.
    ///
    /// The handle resolves to the element-wise sum at `dst` and to the
    /// caller's own buffer, unchanged, at every other rank.
    fn reduce_sum(&self, buf: Vec<f32>, dst: usize, group: &ProcessGroup) -> OpHandle<Vec<f32>>;

    /// Sum-reduces `buf` across `group` and hands the identical sum back to
    /// every member.
    fn all_reduce_sum(&self, buf: Vec<f32>, group: &ProcessGroup) -> OpHandle<Vec<f32>>;

    /// Replaces every member's buffer with `src`'s buffer.
    fn broadcast(&self, buf: Vec<f32>, src: usize, group: &ProcessGroup) -> OpHandle<Vec<f32>>;

    /// Blocks until every member of `group` has arrived.
    fn barrier(&self, group: &ProcessGroup) -> OpHandle<()>;
}
