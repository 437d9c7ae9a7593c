/// Array storage and movement capability consumed by the iterators
use candle_core::{Device, Tensor};
use ndarray::ArrayD;

use crate::config::IteratorConfig;

/// Tensor allocation, gather and the configured batch size
///
/// Iterators take the backend by reference instead of reaching for a global,
/// so tests can run everything on `Device::Cpu` with small batches.
pub trait ArrayBackend {
    /// Samples per batch
    fn batch_size(&self) -> usize;

    /// Device that owns every tensor this backend creates
    fn device(&self) -> &Device;

    /// Upload a host array whose samples lie on axis 0, rotating that axis
    /// to the last position. Rank and the order of the other axes are kept.
    fn array(&self, host: &ArrayD<f32>) -> crate::Result<Tensor>;

    /// Gather `indices` along `axis`, producing a fresh tensor
    fn take(&self, tensor: &Tensor, indices: &[u32], axis: usize) -> crate::Result<Tensor>;
}

/// Permutation moving axis 0 to the end: [1, 2, ..., rank - 1, 0]
pub fn samples_last(rank: usize) -> Vec<usize> {
    (1..rank).chain(std::iter::once(0)).collect()
}

/// Candle-backed implementation of [`ArrayBackend`]
#[derive(Debug, Clone)]
pub struct CandleBackend {
    device: Device,
    batch_size: usize,
}

impl CandleBackend {
    /// Create a backend on the given device
    pub fn new(device: Device, config: IteratorConfig) -> crate::Result<Self> {
        if config.batch_size == 0 {
            return Err(crate::ZmlError::Config(
                "batch_size must be > 0".to_string(),
            ));
        }

        log::debug!(
            "Backend on {:?} with batch size {}",
            device,
            config.batch_size
        );

        Ok(Self {
            device,
            batch_size: config.batch_size,
        })
    }

    /// CPU backend, mostly for tests and tools
    pub fn cpu(batch_size: usize) -> crate::Result<Self> {
        Self::new(Device::Cpu, IteratorConfig { batch_size })
    }

    /// Try CUDA first, fall back to CPU
    pub fn preferred(config: IteratorConfig) -> crate::Result<Self> {
        let device = if candle_core::utils::cuda_is_available() {
            Device::new_cuda(0)?
        } else {
            Device::Cpu
        };
        Self::new(device, config)
    }
}

impl ArrayBackend for CandleBackend {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn array(&self, host: &ArrayD<f32>) -> crate::Result<Tensor> {
        let rank = host.ndim();
        if rank == 0 {
            return Err(crate::ZmlError::UnsupportedRank(rank));
        }

        // iter() walks in logical (row-major) order whatever the memory layout
        let data: Vec<f32> = host.iter().copied().collect();
        let tensor = Tensor::from_vec(data, host.shape().to_vec(), &self.device)?;

        Ok(tensor.permute(samples_last(rank))?.contiguous()?)
    }

    fn take(&self, tensor: &Tensor, indices: &[u32], axis: usize) -> crate::Result<Tensor> {
        let ids = Tensor::from_vec(indices.to_vec(), indices.len(), &self.device)?;
        Ok(tensor.index_select(&ids, axis)?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    #[test]
    fn test_samples_last() {
        assert_eq!(samples_last(1), vec![0]);
        assert_eq!(samples_last(2), vec![1, 0]);
        assert_eq!(samples_last(4), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_array_moves_sample_axis_last() -> crate::Result<()> {
        let backend = CandleBackend::cpu(2)?;

        // 3 samples of 2x4 features
        let host = Array::from_shape_fn(IxDyn(&[3, 2, 4]), |ix| {
            (ix[0] * 100 + ix[1] * 10 + ix[2]) as f32
        });
        let tensor = backend.array(&host)?;

        assert_eq!(tensor.dims(), &[2, 4, 3]);
        let value = tensor.get(1)?.get(3)?.get(2)?.to_scalar::<f32>()?;
        assert_eq!(value, 213.0);

        Ok(())
    }

    #[test]
    fn test_take_gathers_along_axis() -> crate::Result<()> {
        let backend = CandleBackend::cpu(2)?;
        let tensor = Tensor::new(&[[0f32, 1., 2., 3.], [10., 11., 12., 13.]], backend.device())?;

        let taken = backend.take(&tensor, &[3, 0, 0], 1)?;

        assert_eq!(
            taken.to_vec2::<f32>()?,
            vec![vec![3., 0., 0.], vec![13., 10., 10.]]
        );

        Ok(())
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(CandleBackend::cpu(0).is_err());
    }
}
