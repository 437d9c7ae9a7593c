/// Activation functions used by the classifier
use candle_core::{Result, Tensor, D};
use serde::{Deserialize, Serialize};

/// Activation applied after a layer's affine transform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activation {
    /// Leaky rectifier: x for x > 0, slope * x otherwise
    Rectlin { slope: f64 },
    Tanh,
    /// Sigmoid
    Logistic,
    /// Exponential linear unit (alpha = 1)
    Explin,
    /// Normalized over the last axis
    Softmax,
    Identity,
}

impl Activation {
    /// Rectlin with the near-zero leak used throughout the network
    pub const fn leaky() -> Self {
        Activation::Rectlin { slope: 1e-5 }
    }

    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match *self {
            Activation::Rectlin { slope } => candle_nn::ops::leaky_relu(x, slope),
            Activation::Tanh => x.tanh(),
            Activation::Logistic => candle_nn::ops::sigmoid(x),
            Activation::Explin => x.elu(1.0),
            Activation::Softmax => candle_nn::ops::softmax(x, D::Minus1),
            Activation::Identity => Ok(x.clone()),
        }
    }
}
