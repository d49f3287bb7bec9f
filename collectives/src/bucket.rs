use crate::error::{CommErr, Result};

/// Ordered, flattened view over one or more gradient tensors, collected for
/// a single communication round.
///
/// A bucket is created per round, consumed exactly once by the reducer and
/// then scattered back; it is never reused across rounds.
#[derive(Debug)]
pub struct GradientBucket {
    lens: Vec<usize>,
    buffer: Vec<f32>,
    ready: bool,
}

impl GradientBucket {
    /// Creates an empty bucket awaiting gradients.
    pub fn new() -> Self {
        Self {
            lens: Vec::new(),
            buffer: Vec::new(),
            ready: false,
        }
    }

    /// Flattens `parts` into a single ready bucket, preserving order.
    pub fn collect<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let mut bucket = Self::new();
        for part in parts {
            bucket.push(part);
        }
        bucket.mark_ready();
        bucket
    }

    /// Appends one gradient slice to the bucket.
    pub fn push(&mut self, part: &[f32]) {
        self.lens.push(part.len());
        self.buffer.extend_from_slice(part);
    }

    /// Marks the producer side as done writing.
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Returns whether the producer side has finished writing.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Returns the total number of scalars in the bucket.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether the bucket holds no scalars.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns the flattened contents.
    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    /// Splits the bucket into its layout and flat buffer.
    pub fn into_parts(self) -> (Vec<usize>, Vec<f32>) {
        (self.lens, self.buffer)
    }

    /// Rebuilds a ready bucket from a layout and a flat buffer.
    ///
    /// # Returns
    /// An error when the buffer length does not match the layout.
    pub fn from_parts(lens: Vec<usize>, buffer: Vec<f32>) -> Result<Self> {
        let expected: usize = lens.iter().sum();
        if buffer.len() != expected {
            return Err(CommErr::BufferSizeMismatch {
                got: buffer.len(),
                expected,
            });
        }

        Ok(Self {
            lens,
            buffer,
            ready: true,
        })
    }

    /// Writes the bucket's contents back, slice by slice, in push order.
    ///
    /// # Arguments
    /// * `parts` - Destination slices, one per pushed gradient.
    ///
    /// # Returns
    /// An error when the slice count or any slice length disagrees with the
    /// bucket layout.
    pub fn scatter<'a, I>(&self, parts: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a mut [f32]>,
    {
        let mut offset = 0;
        let mut count = 0;

        for (part, &len) in parts.into_iter().zip(&self.lens) {
            if part.len() != len {
                return Err(CommErr::BufferSizeMismatch {
                    got: part.len(),
                    expected: len,
                });
            }
            part.copy_from_slice(&self.buffer[offset..offset + len]);
            offset += len;
            count += 1;
        }

        if count != self.lens.len() {
            return Err(CommErr::BufferSizeMismatch {
                got: count,
                expected: self.lens.len(),
            });
        }

        Ok(())
    }
}

impl Default for GradientBucket {
    fn default() -> Self {
        Self::new()
    }
}
