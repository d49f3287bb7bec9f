use std::num::NonZeroUsize;

/// What the training loop should do with the micro-batch just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Keep gradients local; no cross-rank traffic, no optimizer step.
    Accumulate,
    /// Synchronize gradients across ranks and run the optimizer once.
    SyncStep,
}

/// Decides, per micro-batch, whether to synchronize and step or merely
/// accumulate locally.
///
/// The window closes every `frequency` micro-batches. A trailing partial
/// window at the end of an epoch must be flushed explicitly or its gradients
/// would be dropped silently.
#[derive(Debug)]
pub struct GradAccumulator {
    frequency: NonZeroUsize,
    micro_batch: usize,
    pending: usize,
}

impl GradAccumulator {
    /// Creates an accumulator closing its window every `frequency`
    /// micro-batches.
    pub fn new(frequency: NonZeroUsize) -> Self {
        Self {
            frequency,
            micro_batch: 0,
            pending: 0,
        }
    }

    /// Returns the configured accumulation frequency.
    pub fn frequency(&self) -> usize {
        self.frequency.get()
    }

    /// Returns the number of micro-batches seen so far.
    pub fn micro_batches(&self) -> usize {
        self.micro_batch
    }

    /// Returns how many micro-batches sit in the currently open window.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Divides a micro-batch loss by the frequency, so summed local
    /// gradients approximate the gradient of the mean loss over the window.
    /// Applied in every state, before backward.
    pub fn scale_loss(&self, loss: f32) -> f32 {
        loss / self.frequency.get() as f32
    }

    /// Advances past one micro-batch.
    ///
    /// # Returns
    /// `SyncStep` on the micro-batch that fills the current window,
    /// `Accumulate` otherwise. Windows are counted from the last close,
    /// so a flushed partial window does not shorten the one after it.
    pub fn advance(&mut self) -> SyncDecision {
        self.micro_batch += 1;
        self.pending += 1;

        if self.pending == self.frequency.get() {
            self.pending = 0;
            SyncDecision::SyncStep
        } else {
            SyncDecision::Accumulate
        }
    }

    /// Closes a partial window at an epoch boundary. The next window starts
    /// empty and runs its full length.
    ///
    /// # Returns
    /// `true` when unsynchronized micro-batches were pending and the caller
    /// must run a forced sync step; `false` when the last window closed
    /// naturally.
    pub fn flush(&mut self) -> bool {
        if self.pending == 0 {
            return false;
        }
        self.pending = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator(frequency: usize) -> GradAccumulator {
        GradAccumulator::new(NonZeroUsize::new(frequency).unwrap())
    }

    #[test]
    fn fires_once_per_window_of_four() {
        let mut acc = accumulator(4);
        let decisions: Vec<_> = (0..4).map(|_| acc.advance()).collect();

        assert_eq!(
            decisions,
            vec![
                SyncDecision::Accumulate,
                SyncDecision::Accumulate,
                SyncDecision::Accumulate,
                SyncDecision::SyncStep,
            ]
        );
    }

    #[test]
    fn partial_window_requires_flush() {
        let mut acc = accumulator(4);
        let steps = (0..10)
            .filter(|_| acc.advance() == SyncDecision::SyncStep)
            .count();

        assert_eq!(steps, 2); // indices 3 and 7
        assert_eq!(acc.pending(), 2); // indices 8 and 9
        assert!(acc.flush());
        assert!(!acc.flush());
    }

    #[test]
    fn window_after_flush_runs_full_length() {
        let mut acc = accumulator(4);
        for _ in 0..10 {
            acc.advance();
        }
        assert!(acc.flush());

        // The next epoch's first sync must come after four micro-batches,
        // not after the two that would complete the flushed window.
        let next_sync = (0..8)
            .position(|_| acc.advance() == SyncDecision::SyncStep)
            .unwrap();
        assert_eq!(next_sync, 3);
    }

    #[test]
    fn no_flush_after_complete_window() {
        let mut acc = accumulator(2);
        acc.advance();
        acc.advance();
        assert!(!acc.flush());
    }

    #[test]
    fn frequency_one_always_syncs() {
        let mut acc = accumulator(1);
        for _ in 0..3 {
            assert_eq!(acc.advance(), SyncDecision::SyncStep);
        }
        assert_eq!(acc.scale_loss(2.0), 2.0);
    }

    #[test]
    fn loss_scaling_uses_frequency() {
        let acc = accumulator(4);
        assert_eq!(acc.scale_loss(2.0), 0.5);
    }
}
