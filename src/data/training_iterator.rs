/// Pairs each input sample with its target, one pair per pull
///
/// Inputs and targets are independent sequences of the same length. Without
/// targets the inputs double as targets (autoencoder style).
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{Batch, BatchPair, DataIterator, Shuffle};

pub struct TrainingIterator<T> {
    inputs: Vec<T>,
    targets: Option<Vec<T>>,
    rng: StdRng,
}

impl<T> TrainingIterator<T> {
    /// Create an iterator, failing if targets and inputs differ in length
    pub fn new(inputs: Vec<T>, targets: Option<Vec<T>>) -> crate::Result<Self> {
        Self::with_rng(inputs, targets, StdRng::from_entropy())
    }

    /// Same as [`TrainingIterator::new`] with a reproducible shuffle order
    pub fn with_seed(inputs: Vec<T>, targets: Option<Vec<T>>, seed: u64) -> crate::Result<Self> {
        Self::with_rng(inputs, targets, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inputs: Vec<T>, targets: Option<Vec<T>>, rng: StdRng) -> crate::Result<Self> {
        if let Some(ref targets) = targets {
            if targets.len() != inputs.len() {
                return Err(crate::ZmlError::LengthMismatch {
                    inputs: inputs.len(),
                    targets: targets.len(),
                });
            }
        }

        Ok(Self {
            inputs,
            targets,
            rng,
        })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Pairs in current order; a fresh pass every call
    pub fn produce(&self) -> impl Iterator<Item = (&T, &T)> + '_ {
        let targets = self.targets.as_ref().unwrap_or(&self.inputs);
        self.inputs.iter().zip(targets.iter())
    }

    /// Nothing to rewind: every `produce` starts from the first pair
    pub fn reset(&mut self) {}

    /// Reorder inputs and targets under one random permutation
    pub fn shuffle(&mut self) {
        let mut order: Vec<usize> = (0..self.inputs.len()).collect();
        order.shuffle(&mut self.rng);

        self.inputs = apply_order(std::mem::take(&mut self.inputs), &order);
        if let Some(targets) = self.targets.take() {
            self.targets = Some(apply_order(targets, &order));
        }
    }
}

/// Rearrange so that position `j` holds the element previously at `order[j]`
fn apply_order<T>(items: Vec<T>, order: &[usize]) -> Vec<T> {
    let mut destination = vec![0; order.len()];
    for (j, &i) in order.iter().enumerate() {
        destination[i] = j;
    }

    let mut keyed: Vec<(usize, T)> = destination.into_iter().zip(items).collect();
    keyed.sort_unstable_by_key(|(slot, _)| *slot);
    keyed.into_iter().map(|(_, item)| item).collect()
}

impl<T> Shuffle for TrainingIterator<T> {
    fn shuffle(&mut self) -> crate::Result<()> {
        TrainingIterator::shuffle(self);
        Ok(())
    }
}

// One pair is one batch, already shaped by the caller
impl DataIterator for TrainingIterator<Tensor> {
    fn ndata(&self) -> usize {
        self.len()
    }

    fn nbatches(&self) -> usize {
        self.len()
    }

    fn reset(&mut self) {
        TrainingIterator::reset(self)
    }

    fn epoch(&mut self) -> Box<dyn Iterator<Item = crate::Result<BatchPair>> + '_> {
        Box::new(self.produce().map(|(x, y)| {
            Ok((Batch::Single(x.clone()), Some(Batch::Single(y.clone()))))
        }))
    }

    fn as_shuffle(&mut self) -> Option<&mut dyn Shuffle> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_mismatch_rejected() {
        let result = TrainingIterator::new(vec![1, 2, 3], Some(vec![1, 2]));
        assert!(matches!(
            result,
            Err(crate::ZmlError::LengthMismatch { inputs: 3, targets: 2 })
        ));
    }

    #[test]
    fn test_produce_pairs_in_order() -> crate::Result<()> {
        let it = TrainingIterator::new(vec!['a', 'b', 'c'], Some(vec!['1', '2', '3']))?;

        let pairs: Vec<(char, char)> = it.produce().map(|(x, y)| (*x, *y)).collect();
        assert_eq!(pairs, vec![('a', '1'), ('b', '2'), ('c', '3')]);
        assert_eq!(it.len(), 3);

        // Restartable
        assert_eq!(it.produce().count(), 3);

        Ok(())
    }

    #[test]
    fn test_inputs_double_as_targets() -> crate::Result<()> {
        let it = TrainingIterator::new(vec![5, 6], None)?;
        let pairs: Vec<(i32, i32)> = it.produce().map(|(x, y)| (*x, *y)).collect();
        assert_eq!(pairs, vec![(5, 5), (6, 6)]);
        Ok(())
    }

    #[test]
    fn test_shuffle_keeps_pairs_together() -> crate::Result<()> {
        let inputs: Vec<u32> = (0..100).collect();
        let targets: Vec<u32> = (0..100).map(|i| i * 7).collect();
        let mut it = TrainingIterator::with_seed(inputs, Some(targets), 17)?;

        it.shuffle();

        let pairs: Vec<(u32, u32)> = it.produce().map(|(x, y)| (*x, *y)).collect();
        assert!(pairs.iter().all(|(x, y)| *y == x * 7));

        let mut seen: Vec<u32> = pairs.iter().map(|(x, _)| *x).collect();
        assert_ne!(seen, (0..100).collect::<Vec<_>>());
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());

        Ok(())
    }

    #[test]
    fn test_apply_order() {
        let reordered = apply_order(vec!["a", "b", "c", "d"], &[2, 0, 3, 1]);
        assert_eq!(reordered, vec!["c", "a", "d", "b"]);
    }

    #[test]
    fn test_epoch_yields_every_pair() -> crate::Result<()> {
        let device = candle_core::Device::Cpu;
        let inputs = (0..4)
            .map(|i| Tensor::new(&[i as f32], &device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let mut it = TrainingIterator::new(inputs, None)?;

        assert!(it.as_shuffle().is_some());
        let batches = it.epoch().collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|(_, y)| y.is_some()));

        Ok(())
    }
}
