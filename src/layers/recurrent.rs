/// LSTM stage and recurrent summation
use candle_core::{Result, Tensor};
use candle_nn::rnn::{LSTMConfig, LSTM, RNN};
use candle_nn::VarBuilder;

use super::dense::glorot_uniform;

/// LSTM over [batch, steps, features], returning every step's hidden state
pub struct Lstm {
    inner: LSTM,
    hidden: usize,
}

impl Lstm {
    pub fn new(in_features: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        let config = LSTMConfig {
            w_ih_init: glorot_uniform(in_features, 4 * hidden),
            w_hh_init: glorot_uniform(hidden, 4 * hidden),
            ..Default::default()
        };
        let inner = candle_nn::lstm(in_features, hidden, config, vb)?;
        Ok(Self { inner, hidden })
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Hidden states as [batch, steps, hidden]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let states = self.inner.seq(x)?;
        self.inner.states_to_tensor(&states)
    }
}

/// Sum hidden states over the step axis: [batch, steps, hidden] -> [batch, hidden]
pub fn recurrent_sum(states: &Tensor) -> Result<Tensor> {
    states.sum(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_lstm_then_sum_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let lstm = Lstm::new(12, 30, vb)?;
        assert_eq!(lstm.hidden(), 30);
        let x = Tensor::randn(0f32, 1.0, (4, 6, 12), &device)?;

        let states = lstm.forward(&x)?;
        assert_eq!(states.dims(), &[4, 6, 30]);
        assert_eq!(recurrent_sum(&states)?.dims(), &[4, 30]);

        Ok(())
    }

    #[test]
    fn test_recurrent_sum_adds_steps() -> Result<()> {
        let states = Tensor::new(&[[[1f32, 2.], [3., 4.], [5., 6.]]], &Device::Cpu)?;
        assert_eq!(recurrent_sum(&states)?.to_vec2::<f32>()?, vec![vec![9., 12.]]);
        Ok(())
    }
}
