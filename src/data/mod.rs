/// Data feeding for training loops
pub mod batch_iterator;
pub mod stream_set;
pub mod training_iterator;

pub use batch_iterator::BatchIterator;
pub use stream_set::{StreamManifest, StreamSet};
pub use training_iterator::TrainingIterator;

use candle_core::Tensor;

/// One side (inputs or targets) of a batch
///
/// A single stream is handed out bare, several streams as a list.
#[derive(Debug, Clone)]
pub enum Batch {
    Single(Tensor),
    Multi(Vec<Tensor>),
}

impl Batch {
    /// Wrap stream tensors, unwrapping a lone stream
    pub fn from_streams(mut streams: Vec<Tensor>) -> Self {
        if streams.len() == 1 {
            Batch::Single(streams.remove(0))
        } else {
            Batch::Multi(streams)
        }
    }

    /// View as a slice of stream tensors regardless of variant
    pub fn tensors(&self) -> &[Tensor] {
        match self {
            Batch::Single(t) => std::slice::from_ref(t),
            Batch::Multi(ts) => ts,
        }
    }

    pub fn len(&self) -> usize {
        self.tensors().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors().is_empty()
    }
}

/// An input batch with its (optional) targets
pub type BatchPair = (Batch, Option<Batch>);

/// Datasets that can reorder their samples between epochs
pub trait Shuffle {
    fn shuffle(&mut self) -> crate::Result<()>;
}

/// Iteration protocol driven once per epoch by a training loop
pub trait DataIterator {
    /// Number of logical samples
    fn ndata(&self) -> usize;

    /// Number of batches the next epoch will yield
    fn nbatches(&self) -> usize;

    /// Rewind to the first batch without reshuffling
    fn reset(&mut self);

    /// Lazy, finite sequence of batches for one epoch
    fn epoch(&mut self) -> Box<dyn Iterator<Item = crate::Result<BatchPair>> + '_>;

    /// Shuffle capability, if this dataset has one
    fn as_shuffle(&mut self) -> Option<&mut dyn Shuffle> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_batch_unwraps_single_stream() -> candle_core::Result<()> {
        let t = Tensor::zeros((2, 3), candle_core::DType::F32, &Device::Cpu)?;

        let single = Batch::from_streams(vec![t.clone()]);
        assert!(matches!(single, Batch::Single(_)));
        assert_eq!(single.len(), 1);

        let multi = Batch::from_streams(vec![t.clone(), t]);
        assert!(matches!(multi, Batch::Multi(_)));
        assert_eq!(multi.tensors().len(), 2);

        Ok(())
    }
}
