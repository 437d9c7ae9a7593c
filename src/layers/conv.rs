/// 2D convolution with rectangular kernels and per-axis strides
use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Init, VarBuilder};
use serde::{Deserialize, Serialize};

use super::Activation;

/// Kernel geometry: `kernel` is (height, width, filters)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub kernel: (usize, usize, usize),
    /// (height, width)
    pub stride: (usize, usize),
    pub padding: usize,
    pub activation: Activation,
}

impl ConvSpec {
    pub const fn new(kernel: (usize, usize, usize), activation: Activation) -> Self {
        Self {
            kernel,
            stride: (1, 1),
            padding: 0,
            activation,
        }
    }

    pub fn stride(mut self, height: usize, width: usize) -> Self {
        self.stride = (height, width);
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Output (channels, height, width) for an input of (channels, height, width)
    pub fn output_shape(&self, input: (usize, usize, usize)) -> Option<(usize, usize, usize)> {
        let (_, h, w) = input;
        let (kh, kw, filters) = self.kernel;
        let (sh, sw) = self.stride;
        let padded_h = h + 2 * self.padding;
        let padded_w = w + 2 * self.padding;

        if padded_h < kh || padded_w < kw || sh == 0 || sw == 0 {
            return None;
        }

        Some((filters, (padded_h - kh) / sh + 1, (padded_w - kw) / sw + 1))
    }
}

/// Every `stride`-th index of an axis of length `len`
fn strided_indices(len: usize, stride: usize, device: &candle_core::Device) -> Result<Tensor> {
    let ids: Vec<u32> = (0..len as u32).step_by(stride).collect();
    let n = ids.len();
    Tensor::from_vec(ids, n, device)
}

/// Convolution + activation + optional dropout over [batch, channels, height, width]
pub struct Conv {
    weight: Tensor,
    bias: Tensor,
    spec: ConvSpec,
    dropout: Option<Dropout>,
}

impl Conv {
    pub fn new(in_channels: usize, spec: ConvSpec, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let (kh, kw, filters) = spec.kernel;
        let weight = vb.get_with_hints(
            (filters, in_channels, kh, kw),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(filters, "bias", Init::Const(0.0))?;

        let dropout = if dropout > 0.0 {
            Some(Dropout::new(dropout))
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            spec,
            dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (sh, sw) = self.spec.stride;
        let padding = self.spec.padding;

        let y = if sh == sw {
            x.conv2d(&self.weight, padding, sh, 1, 1)?
        } else {
            // candle strides both axes alike; subsample a unit-stride result
            let full = x.conv2d(&self.weight, padding, 1, 1, 1)?;
            let (_, _, h, w) = full.dims4()?;
            let full = if sh > 1 {
                full.index_select(&strided_indices(h, sh, x.device())?, 2)?
            } else {
                full
            };
            if sw > 1 {
                full.index_select(&strided_indices(w, sw, x.device())?, 3)?
            } else {
                full
            }
        };

        let filters = self.spec.kernel.2;
        let y = y.broadcast_add(&self.bias.reshape((1, filters, 1, 1))?)?;
        let y = self.spec.activation.apply(&y)?;

        match self.dropout {
            Some(ref dropout) => dropout.forward(&y, train),
            None => Ok(y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_output_shape() {
        let spec = ConvSpec::new((3, 1, 12), Activation::leaky()).stride(2, 1);
        assert_eq!(spec.output_shape((6, 26, 8)), Some((12, 12, 8)));

        let spec = ConvSpec::new((1, 3, 108), Activation::Logistic)
            .stride(1, 2)
            .padding(1);
        assert_eq!(spec.output_shape((54, 4, 9)), Some((108, 6, 5)));

        let spec = ConvSpec::new((5, 1, 6), Activation::leaky());
        assert_eq!(spec.output_shape((4, 3, 8)), None);
    }

    #[test]
    fn test_forward_matches_output_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        for spec in [
            ConvSpec::new((3, 1, 4), Activation::leaky()),
            ConvSpec::new((3, 3, 36), Activation::leaky()).stride(2, 1).padding(1),
            ConvSpec::new((1, 3, 8), Activation::Logistic).stride(1, 2).padding(1),
            ConvSpec::new((2, 2, 5), Activation::Tanh).stride(2, 2),
        ] {
            let conv = Conv::new(3, spec, 0.0, vb.pp(format!("conv_{}", spec.kernel.2)))?;
            let x = Tensor::randn(0f32, 1.0, (2, 3, 9, 7), &device)?;
            let y = conv.forward(&x, false)?;

            let (c, h, w) = spec.output_shape((3, 9, 7)).expect("valid geometry");
            assert_eq!(y.dims(), &[2, c, h, w], "spec {:?}", spec);
        }

        Ok(())
    }

    #[test]
    fn test_dropout_only_in_training() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let conv = Conv::new(1, ConvSpec::new((1, 1, 2), Activation::Identity), 0.5, vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 1, 4, 4), &device)?;

        let a = conv.forward(&x, false)?.flatten_all()?.to_vec1::<f32>()?;
        let b = conv.forward(&x, false)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        assert!(a.iter().all(|v| *v != 0.0));

        // 32 activations at p = 0.5: some are dropped, the rest are scaled by 2
        let trained = conv.forward(&x, true)?.flatten_all()?.to_vec1::<f32>()?;
        let dropped = trained.iter().filter(|v| **v == 0.0).count();
        assert!(dropped > 0 && dropped < trained.len());
        for (t, e) in trained.iter().zip(&a) {
            if *t != 0.0 {
                assert!((t - 2.0 * e).abs() < 1e-5);
            }
        }

        Ok(())
    }
}
