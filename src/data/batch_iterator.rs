/// Batched iterator over several aligned input streams
///
/// Every stream is stored on the backend device with its sample axis last.
/// A stream with `steps > 1` holds `steps` consecutive recurrent elements per
/// logical sample, so its cursor advances `steps` times faster than a plain
/// stream while both point at the same logical samples.
use std::ops::RangeInclusive;

use candle_core::{DType, Tensor};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{Batch, BatchPair, DataIterator, Shuffle};
use crate::backend::{ArrayBackend, CandleBackend};

/// Tensor ranks the slicing and marker paths accept
pub const SUPPORTED_RANKS: RangeInclusive<usize> = 2..=5;

fn check_rank(rank: usize) -> crate::Result<()> {
    if SUPPORTED_RANKS.contains(&rank) {
        Ok(())
    } else {
        Err(crate::ZmlError::UnsupportedRank(rank))
    }
}

/// Fold the recurrent steps of a batch window into its leading dimension
///
/// The window is `[d0, d1, ..., steps * batch]` with columns ordered sample
/// major, step minor. The result is `[steps * d0, d1, ..., batch]`, step major
/// on the first axis: row `t * d0 + i` holds feature `i` of step `t`.
pub fn fold_steps(window: &Tensor, steps: usize, batch_size: usize) -> crate::Result<Tensor> {
    let rank = window.rank();
    check_rank(rank)?;

    let dims = window.dims();
    let last = rank - 1;
    if dims[last] != steps * batch_size {
        return Err(crate::ZmlError::Config(format!(
            "window of width {} cannot hold {} steps x {} samples",
            dims[last], steps, batch_size
        )));
    }

    if steps == 1 {
        return Ok(window.contiguous()?);
    }

    let lead = &dims[..last];

    // [lead..., batch, steps]
    let mut split = lead.to_vec();
    split.push(batch_size);
    split.push(steps);
    let split = window.contiguous()?.reshape(split)?;

    // [steps, lead..., batch]
    let mut perm = vec![rank];
    perm.extend(0..last);
    perm.push(last);
    let moved = split.permute(perm)?.contiguous()?;

    let mut folded = lead.to_vec();
    folded[0] *= steps;
    folded.push(batch_size);
    Ok(moved.reshape(folded)?)
}

#[derive(Clone)]
pub struct BatchIterator<B = CandleBackend> {
    backend: B,
    inputs: Vec<Tensor>,
    targets: Option<Vec<Tensor>>,
    steps: Vec<usize>,
    start: Vec<usize>,
    ndata: usize,
    rng: StdRng,
}

impl<B: ArrayBackend + Clone> BatchIterator<B> {
    /// Create an iterator from host arrays with samples on axis 0
    ///
    /// # Arguments
    /// * `backend` - Device and batch size provider
    /// * `inputs` - One array per input stream, `ndata * steps[i]` rows each
    /// * `targets` - Optional target streams with `ndata` rows each
    /// * `steps` - Recurrent steps per stream, defaults to 1 everywhere
    pub fn new(
        backend: &B,
        inputs: Vec<ArrayD<f32>>,
        targets: Option<Vec<ArrayD<f32>>>,
        steps: Option<Vec<usize>>,
    ) -> crate::Result<Self> {
        if inputs.is_empty() {
            return Err(crate::ZmlError::Config(
                "at least one input stream is required".to_string(),
            ));
        }

        let steps = steps.unwrap_or_else(|| vec![1; inputs.len()]);
        if steps.len() != inputs.len() {
            return Err(crate::ZmlError::Config(format!(
                "{} step counts for {} input streams",
                steps.len(),
                inputs.len()
            )));
        }
        if steps.iter().any(|&s| s == 0) {
            return Err(crate::ZmlError::Config(
                "step counts must be > 0".to_string(),
            ));
        }

        for x in &inputs {
            check_rank(x.ndim())?;
        }

        let rows = inputs[0].shape()[0];
        if rows % steps[0] != 0 {
            return Err(crate::ZmlError::Config(format!(
                "input stream 0 has {} rows, not a multiple of its {} steps",
                rows, steps[0]
            )));
        }
        let ndata = rows / steps[0];

        // Every stream must describe the same logical samples
        for (i, (x, &s)) in inputs.iter().zip(&steps).enumerate() {
            if x.shape()[0] != ndata * s {
                return Err(crate::ZmlError::Config(format!(
                    "input stream {} has {} rows, expected {} samples x {} steps",
                    i,
                    x.shape()[0],
                    ndata,
                    s
                )));
            }
        }

        if let Some(ref targets) = targets {
            for y in targets {
                if y.ndim() == 0 {
                    return Err(crate::ZmlError::UnsupportedRank(0));
                }
                if y.shape()[0] != ndata {
                    return Err(crate::ZmlError::LengthMismatch {
                        inputs: ndata,
                        targets: y.shape()[0],
                    });
                }
            }
        }

        let inputs = inputs
            .iter()
            .map(|x| backend.array(x))
            .collect::<crate::Result<Vec<_>>>()?;
        let targets = targets
            .map(|ys| {
                ys.iter()
                    .map(|y| backend.array(y))
                    .collect::<crate::Result<Vec<_>>>()
            })
            .transpose()?;

        let iterator = Self {
            backend: backend.clone(),
            start: vec![0; inputs.len()],
            inputs,
            targets,
            steps,
            ndata,
            rng: StdRng::from_entropy(),
        };

        log::info!(
            "BatchIterator: {} input streams, {} target streams, ndata={}, steps={:?}, nbatches={}",
            iterator.inputs.len(),
            iterator.targets.as_ref().map_or(0, |t| t.len()),
            iterator.ndata,
            iterator.steps,
            iterator.nbatches()
        );

        Ok(iterator)
    }

    /// Single stream convenience constructor
    pub fn single(
        backend: &B,
        input: ArrayD<f32>,
        target: Option<ArrayD<f32>>,
        steps: usize,
    ) -> crate::Result<Self> {
        Self::new(backend, vec![input], target.map(|y| vec![y]), Some(vec![steps]))
    }
}

impl<B: ArrayBackend> BatchIterator<B> {
    /// Use a reproducible shuffle order
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn ndata(&self) -> usize {
        self.ndata
    }

    pub fn batch_size(&self) -> usize {
        self.backend.batch_size()
    }

    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    /// Raw per-stream cursors into the sample axis
    pub fn cursors(&self) -> &[usize] {
        &self.start
    }

    /// Device-resident input streams, sample axis last
    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    pub fn targets(&self) -> Option<&[Tensor]> {
        self.targets.as_deref()
    }

    /// Full batches left before the cursors wrap, counted on stream 0
    pub fn nbatches(&self) -> usize {
        let consumed = self.start[0] / self.steps[0];
        self.ndata.saturating_sub(consumed) / self.batch_size()
    }

    /// Rewind every cursor without reshuffling
    pub fn reset(&mut self) {
        self.start.iter_mut().for_each(|s| *s = 0);
    }

    /// Pull the next batch; `None` (after rewinding) once the epoch is exhausted
    pub fn next_batch(&mut self) -> crate::Result<Option<BatchPair>> {
        let batch_size = self.batch_size();
        let pos = self.start[0] / self.steps[0];

        if pos + batch_size > self.ndata {
            self.reset();
            return Ok(None);
        }

        let targets = match self.targets {
            Some(ref ys) => Some(
                ys.iter()
                    .map(|y| y.narrow(y.rank() - 1, pos, batch_size)?.contiguous())
                    .collect::<candle_core::Result<Vec<_>>>()?,
            ),
            None => None,
        };

        let mut x = Vec::with_capacity(self.inputs.len());
        for (i, a) in self.inputs.iter().enumerate() {
            let inc = self.steps[i] * batch_size;
            let window = a.narrow(a.rank() - 1, self.start[i], inc)?;
            x.push(fold_steps(&window, self.steps[i], batch_size)?);
            self.start[i] += inc;
        }

        Ok(Some((Batch::from_streams(x), targets.map(Batch::from_streams))))
    }

    /// Lazy sequence of the batches left in this epoch
    pub fn produce(&mut self) -> Batches<'_, B> {
        Batches {
            iterator: self,
            done: false,
        }
    }

    /// Reorder samples of every stream under one random permutation
    ///
    /// Input streams are gathered in blocks of `steps` so recurrent elements
    /// stay with their sample. Meant to run between epochs.
    pub fn shuffle(&mut self) -> crate::Result<()> {
        if self.start.iter().any(|&s| s != 0) {
            log::warn!("Shuffling mid-epoch at cursors {:?}", self.start);
        }

        let mut order: Vec<u32> = (0..self.ndata as u32).collect();
        order.shuffle(&mut self.rng);

        for (x, &s) in self.inputs.iter_mut().zip(&self.steps) {
            let s = s as u32;
            let expanded: Vec<u32> = order
                .iter()
                .flat_map(|&v| (0..s).map(move |j| v * s + j))
                .collect();
            *x = self.backend.take(x, &expanded, x.rank() - 1)?;
        }

        if let Some(ref mut targets) = self.targets {
            for y in targets.iter_mut() {
                *y = self.backend.take(y, &order, y.rank() - 1)?;
            }
        }

        log::debug!("Shuffled {} samples across {} streams", self.ndata, self.inputs.len());

        Ok(())
    }

    /// Verify that shuffling keeps every stream aligned with the targets
    ///
    /// Works on a copy: each element is stamped with the index of the logical
    /// sample it belongs to, the copy is shuffled, and every input window and
    /// target column must then carry the marker found in the first target
    /// stream at that position. Target streams are reported after the inputs
    /// in [`crate::ZmlError::ShuffleMismatch`].
    pub fn check_shuffle_alignment(&self) -> crate::Result<()>
    where
        B: Clone,
    {
        if self.targets.as_ref().map_or(true, |t| t.is_empty()) {
            return Err(crate::ZmlError::Config(
                "shuffle alignment check needs at least one target stream".to_string(),
            ));
        }

        let mut stamped = self.clone();
        for (x, &s) in stamped.inputs.iter_mut().zip(&self.steps) {
            check_rank(x.rank())?;
            *x = stamp_markers(x, s)?;
        }
        if let Some(ref mut targets) = stamped.targets {
            for y in targets.iter_mut() {
                *y = stamp_markers(y, 1)?;
            }
        }

        stamped.shuffle()?;

        let targets = stamped.targets.as_deref().unwrap_or_default();
        let first = host_markers(&targets[0])?;
        // first row of the first target stream holds one marker per sample
        let expected: Vec<u32> = first[..stamped.ndata].to_vec();

        let mut sorted = expected.clone();
        sorted.sort_unstable();
        if let Some(index) = sorted.iter().enumerate().position(|(i, &m)| m != i as u32) {
            return Err(crate::ZmlError::ShuffleMismatch {
                index,
                stream: stamped.inputs.len(),
            });
        }

        let streams = stamped
            .inputs
            .iter()
            .zip(stamped.steps.iter().copied())
            .chain(targets.iter().map(|y| (y, 1)));

        for (stream, (x, s)) in streams.enumerate() {
            let cols = x.dim(x.rank() - 1)?;
            let values = host_markers(x)?;
            if let Some(p) = values
                .iter()
                .enumerate()
                .position(|(p, &m)| m != expected[(p % cols) / s])
            {
                return Err(crate::ZmlError::ShuffleMismatch {
                    index: (p % cols) / s,
                    stream,
                });
            }
        }

        log::debug!("Shuffle alignment verified for {} samples", stamped.ndata);

        Ok(())
    }
}

/// Replace `x` with a `u32` tensor of the same shape whose every element is
/// the index of the logical sample owning it
///
/// Integer markers stay exact for any sample count an index can address;
/// `f32` would merge neighbours above 2^24.
fn stamp_markers(x: &Tensor, steps: usize) -> crate::Result<Tensor> {
    let cols = x.dim(x.rank() - 1)?;
    let markers: Vec<u32> = (0..cols).map(|c| (c / steps) as u32).collect();
    let row = Tensor::from_vec(markers, cols, x.device())?;
    Ok(row.broadcast_as(x.shape())?.contiguous()?)
}

fn host_markers(x: &Tensor) -> crate::Result<Vec<u32>> {
    Ok(x.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?)
}

/// Batches left in the current epoch of a [`BatchIterator`]
pub struct Batches<'a, B> {
    iterator: &'a mut BatchIterator<B>,
    done: bool,
}

impl<B: ArrayBackend> Iterator for Batches<'_, B> {
    type Item = crate::Result<BatchPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.iterator.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<B: ArrayBackend> Shuffle for BatchIterator<B> {
    fn shuffle(&mut self) -> crate::Result<()> {
        BatchIterator::shuffle(self)
    }
}

impl<B: ArrayBackend> DataIterator for BatchIterator<B> {
    fn ndata(&self) -> usize {
        self.ndata
    }

    fn nbatches(&self) -> usize {
        BatchIterator::nbatches(self)
    }

    fn reset(&mut self) {
        BatchIterator::reset(self)
    }

    fn epoch(&mut self) -> Box<dyn Iterator<Item = crate::Result<BatchPair>> + '_> {
        Box::new(self.produce())
    }

    fn as_shuffle(&mut self) -> Option<&mut dyn Shuffle> {
        Some(self)
    }
}
