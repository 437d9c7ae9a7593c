/// Fully connected layer with Glorot-uniform weights
use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

use super::Activation;

/// Glorot (Xavier) uniform bound for a fan-in/fan-out pair
pub fn glorot_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Affine transform followed by an activation
pub struct Dense {
    linear: Linear,
    activation: Activation,
    out_features: usize,
}

impl Dense {
    /// Create new Dense layer
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `activation` - Applied after the affine transform
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_features, in_features),
            "weight",
            glorot_uniform(in_features, out_features),
        )?;
        let bias = vb.get_with_hints(out_features, "bias", Init::Const(0.0))?;

        Ok(Self {
            linear: Linear::new(weight, Some(bias)),
            activation,
            out_features,
        })
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Affine transform only, for losses that fuse the activation
    pub fn logits(&self, x: &Tensor) -> Result<Tensor> {
        self.linear.forward(x)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.activation.apply(&self.logits(x)?)
    }
}
