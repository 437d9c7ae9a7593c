/// Epoch driver for ClassifierNetwork
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{loss, ops, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap, SGD};
use std::path::Path;

use crate::config::{ClassifierConfig, OptimizerKind};
use crate::data::{Batch, DataIterator};
use crate::models::{ClassifierNetwork, Topology};

/// Optimizer chosen by the configuration
enum ModelOptimizer {
    Adam(AdamW),
    Sgd(SGD),
}

impl ModelOptimizer {
    fn new(kind: OptimizerKind, varmap: &VarMap) -> candle_core::Result<Self> {
        match kind {
            // AdamW without decay is plain Adam
            OptimizerKind::Adam { lr } => Ok(ModelOptimizer::Adam(AdamW::new(
                varmap.all_vars(),
                ParamsAdamW {
                    lr,
                    beta1: 0.9,
                    beta2: 0.999,
                    eps: 1e-8,
                    weight_decay: 0.0,
                },
            )?)),
            OptimizerKind::Sgd { lr } => Ok(ModelOptimizer::Sgd(SGD::new(varmap.all_vars(), lr)?)),
        }
    }

    fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        match self {
            ModelOptimizer::Adam(opt) => opt.backward_step(loss),
            ModelOptimizer::Sgd(opt) => opt.backward_step(loss),
        }
    }

    fn learning_rate(&self) -> f64 {
        match self {
            ModelOptimizer::Adam(opt) => opt.learning_rate(),
            ModelOptimizer::Sgd(opt) => opt.learning_rate(),
        }
    }
}

/// Move a target tensor from [classes, batch] to [batch, classes]
fn batch_first(target: &Tensor) -> candle_core::Result<Tensor> {
    target.t()?.contiguous()
}

/// Trainer for ClassifierNetwork
pub struct Trainer {
    network: ClassifierNetwork,
    varmap: VarMap,
    optimizer: ModelOptimizer,
    step: usize,
}

impl Trainer {
    /// Assemble the network described by `config` and its optimizer
    pub fn new(config: &ClassifierConfig, device: &Device) -> crate::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let network = ClassifierNetwork::new(Topology::classifier(config)?, vb)?;
        let optimizer = ModelOptimizer::new(config.optimizer, &varmap)?;

        Ok(Self {
            network,
            varmap,
            optimizer,
            step: 0,
        })
    }

    pub fn network(&self) -> &ClassifierNetwork {
        &self.network
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Cross-entropy on the exclusive head plus logistic loss on the overlapping head
    ///
    /// Targets follow the iterator layout: exclusive one-hot `[classes, batch]`
    /// first, overlapping `[classes, batch]` second when that head exists.
    fn compute_loss(&self, inputs: &Batch, targets: &Batch) -> crate::Result<Tensor> {
        let logits = self.network.forward_logits(inputs.tensors(), true)?;
        let targets = targets.tensors();

        let exclusive = batch_first(&targets[0])?;
        let batch_size = exclusive.dim(0)? as f64;
        let log_probs = ops::log_softmax(&logits.exclusive, D::Minus1)?;
        let mut total = (log_probs * exclusive)?
            .sum_all()?
            .affine(-1.0 / batch_size, 0.0)?;

        if let Some(ref overlapping) = logits.overlapping {
            let target = targets.get(1).ok_or_else(|| {
                crate::ZmlError::Config(
                    "overlapping head needs a second target stream".to_string(),
                )
            })?;
            let bce = loss::binary_cross_entropy_with_logit(overlapping, &batch_first(target)?)?;
            total = (total + bce)?;
        }

        Ok(total)
    }

    /// Training step
    pub fn train_step(&mut self, inputs: &Batch, targets: &Batch) -> crate::Result<f32> {
        let loss = self.compute_loss(inputs, targets)?;
        let loss_val = loss.to_scalar::<f32>()?;

        self.optimizer.backward_step(&loss)?;
        self.step += 1;

        Ok(loss_val)
    }

    /// Train for one epoch, shuffling first when the dataset supports it
    pub fn train_epoch(&mut self, dataset: &mut dyn DataIterator) -> crate::Result<f32> {
        if let Some(shuffler) = dataset.as_shuffle() {
            shuffler.shuffle()?;
        }

        let mut total_loss = 0.0;
        let mut num_batches = 0;

        for batch in dataset.epoch() {
            let (inputs, targets) = batch?;
            let targets = targets.ok_or_else(|| {
                crate::ZmlError::Config("training needs target streams".to_string())
            })?;

            let loss = self.train_step(&inputs, &targets)?;
            total_loss += loss;
            num_batches += 1;

            log::debug!("Batch {} loss: {:.4}", num_batches, loss);
        }

        if num_batches == 0 {
            log::warn!("Epoch produced no full batches");
            return Ok(0.0);
        }

        Ok(total_loss / num_batches as f32)
    }

    /// Train for `epochs` epochs, returning the mean loss of each
    pub fn fit(&mut self, dataset: &mut dyn DataIterator, epochs: usize) -> crate::Result<Vec<f32>> {
        log::info!(
            "Starting training for {} epochs, {} batches per epoch",
            epochs,
            dataset.nbatches()
        );

        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let avg_loss = self.train_epoch(dataset)?;
            log::info!(
                "Epoch {}/{} complete: avg_loss={:.4}, step={}, lr={:.6}",
                epoch + 1,
                epochs,
                avg_loss,
                self.step,
                self.optimizer.learning_rate()
            );
            history.push(avg_loss);
        }

        Ok(history)
    }

    /// Fraction of samples whose exclusive prediction matches the one-hot target
    pub fn evaluate(&self, dataset: &mut dyn DataIterator) -> crate::Result<f32> {
        let mut correct = 0usize;
        let mut seen = 0usize;

        for batch in dataset.epoch() {
            let (inputs, targets) = batch?;
            let targets = targets.ok_or_else(|| {
                crate::ZmlError::Config("evaluation needs target streams".to_string())
            })?;

            let out = self.network.forward(inputs.tensors(), false)?;
            let predicted = out.exclusive.argmax(D::Minus1)?.to_vec1::<u32>()?;
            let expected = batch_first(&targets.tensors()[0])?
                .argmax(D::Minus1)?
                .to_vec1::<u32>()?;

            correct += predicted.iter().zip(&expected).filter(|(p, e)| p == e).count();
            seen += predicted.len();
        }

        if seen == 0 {
            return Ok(0.0);
        }
        Ok(correct as f32 / seen as f32)
    }

    /// Save weights as safetensors
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        log::info!("Saving weights to {:?}", path.as_ref());
        Ok(self.varmap.save(path)?)
    }

    /// Load weights saved by [`Trainer::save`] for the same configuration
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> crate::Result<()> {
        log::info!("Loading weights from {:?}", path.as_ref());
        Ok(self.varmap.load(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ArrayBackend, CandleBackend};
    use crate::data::{BatchIterator, Shuffle, TrainingIterator};
    use ndarray::{Array, ArrayD, IxDyn};

    fn small_config() -> ClassifierConfig {
        ClassifierConfig {
            exclusive_classes: vec!["a".into(), "b".into()],
            width: 2,
            num_words: 3,
            analytics_features: 2,
            ..Default::default()
        }
    }

    /// Words for 2 steps, analytics, and one-hot labels that follow analytics[0]
    fn fixture(ndata: usize) -> (Vec<ArrayD<f32>>, Vec<ArrayD<f32>>) {
        let words = Array::from_shape_fn(IxDyn(&[ndata * 2, 3]), |ix| ((ix[0] + ix[1]) % 3) as f32);
        let analytics = Array::from_shape_fn(IxDyn(&[ndata, 2]), |ix| ((ix[0] + ix[1]) % 2) as f32);
        let labels = Array::from_shape_fn(IxDyn(&[ndata, 2]), |ix| (ix[0] % 2 == ix[1]) as u8 as f32);
        (vec![words, analytics], vec![labels])
    }

    /// Counts shuffle calls made by the epoch hook
    struct CountingShuffle {
        inner: BatchIterator,
        shuffles: usize,
    }

    impl Shuffle for CountingShuffle {
        fn shuffle(&mut self) -> crate::Result<()> {
            self.shuffles += 1;
            self.inner.shuffle()
        }
    }

    impl DataIterator for CountingShuffle {
        fn ndata(&self) -> usize {
            self.inner.ndata()
        }

        fn nbatches(&self) -> usize {
            self.inner.nbatches()
        }

        fn reset(&mut self) {
            self.inner.reset()
        }

        fn epoch(&mut self) -> Box<dyn Iterator<Item = crate::Result<crate::data::BatchPair>> + '_> {
            Box::new(self.inner.produce())
        }

        fn as_shuffle(&mut self) -> Option<&mut dyn Shuffle> {
            Some(self)
        }
    }

    #[test]
    fn test_fit_shuffles_every_epoch() -> crate::Result<()> {
        let backend = CandleBackend::cpu(4)?;
        let (inputs, targets) = fixture(8);
        let inner = BatchIterator::new(&backend, inputs, Some(targets), Some(vec![2, 1]))?.with_seed(3);
        let mut counted = CountingShuffle { inner, shuffles: 0 };

        let mut trainer = Trainer::new(&small_config(), backend.device())?;
        let history = trainer.fit(&mut counted, 3)?;

        assert_eq!(counted.shuffles, 3);
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|l| l.is_finite() && *l > 0.0));
        assert_eq!(trainer.step(), 6);

        Ok(())
    }

    #[test]
    fn test_overlapping_head_trains() -> crate::Result<()> {
        let backend = CandleBackend::cpu(2)?;
        let (inputs, mut targets) = fixture(4);
        targets.push(Array::from_shape_fn(IxDyn(&[4, 3]), |ix| (ix[1] <= ix[0]) as u8 as f32));
        let mut it = BatchIterator::new(&backend, inputs, Some(targets), Some(vec![2, 1]))?;

        let config = ClassifierConfig {
            overlapping_classes: Some(vec!["x".into(), "y".into(), "z".into()]),
            optimizer: OptimizerKind::Sgd { lr: 0.05 },
            ..small_config()
        };
        let mut trainer = Trainer::new(&config, backend.device())?;
        let loss = trainer.train_epoch(&mut it)?;

        assert!(loss.is_finite());
        let accuracy = trainer.evaluate(&mut it)?;
        assert!((0.0..=1.0).contains(&accuracy));

        Ok(())
    }

    #[test]
    fn test_convolutional_word_grid_trains() -> crate::Result<()> {
        let backend = CandleBackend::cpu(2)?;
        let config = ClassifierConfig {
            network_type: crate::config::NetworkType::Convolutional,
            ..small_config()
        };
        let [channels, height, width] = config.conv_input;

        let grid = Array::from_shape_fn(IxDyn(&[4, channels, height, width]), |ix| {
            ((ix[0] + ix[2] + ix[3]) % 3) as f32
        });
        let (mut inputs, targets) = fixture(4);
        inputs[0] = grid;
        let mut it = BatchIterator::new(&backend, inputs, Some(targets), None)?;

        let mut trainer = Trainer::new(&config, backend.device())?;
        let loss = trainer.train_epoch(&mut it)?;

        assert!(loss.is_finite());
        assert_eq!(trainer.step(), 2);

        Ok(())
    }

    #[test]
    fn test_missing_targets_rejected() -> crate::Result<()> {
        let backend = CandleBackend::cpu(2)?;
        let (inputs, _) = fixture(4);
        let mut it = BatchIterator::new(&backend, inputs, None, Some(vec![2, 1]))?;

        let mut trainer = Trainer::new(&small_config(), backend.device())?;
        assert!(matches!(
            trainer.train_epoch(&mut it),
            Err(crate::ZmlError::Config(_))
        ));

        Ok(())
    }

    #[test]
    fn test_pairing_iterator_feeds_trainer() -> crate::Result<()> {
        let device = Device::Cpu;
        let config = ClassifierConfig {
            analytics_input: false,
            ..small_config()
        };

        // Pre-shaped batches of 2 samples: 2 steps x 3 features, one-hot labels
        let inputs = (0..3)
            .map(|_| Tensor::randn(0f32, 1.0, (6, 2), &device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let targets = (0..3)
            .map(|_| Tensor::new(&[[1f32, 0.], [0., 1.]], &device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let mut it = TrainingIterator::with_seed(inputs, Some(targets), 5)?;

        let mut trainer = Trainer::new(&config, &device)?;
        trainer.train_epoch(&mut it)?;
        assert_eq!(trainer.step(), 3);

        Ok(())
    }

    #[test]
    fn test_save_and_load() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.safetensors");

        let backend = CandleBackend::cpu(4)?;
        let (inputs, targets) = fixture(4);
        let mut it = BatchIterator::new(&backend, inputs, Some(targets), Some(vec![2, 1]))?;
        let (x, y) = it.next_batch()?.expect("one batch");
        let y = y.expect("targets");

        let mut trainer = Trainer::new(&small_config(), backend.device())?;
        trainer.train_step(&x, &y)?;
        trainer.save(&path)?;

        let exclusive = |t: &Trainer| -> crate::Result<Vec<Vec<f32>>> {
            Ok(t.network().forward(x.tensors(), false)?.exclusive.to_vec2::<f32>()?)
        };
        let trained = exclusive(&trainer)?;

        let mut restored = Trainer::new(&small_config(), backend.device())?;
        assert_ne!(exclusive(&restored)?, trained);

        restored.load(&path)?;
        assert_eq!(exclusive(&restored)?, trained);

        Ok(())
    }
}
