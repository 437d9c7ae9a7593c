/// Configuration for the classifier network and the batch iterators
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Input stage of the content branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// LSTM over the word sequence, summed over time
    Recurrent,
    /// Fixed pipeline of narrowing/widening convolutions
    Convolutional,
}

/// Optimizer handed to the training driver
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam { lr: f64 },
    Sgd { lr: f64 },
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Adam { lr: 1e-3 }
    }
}

/// Configuration for the classifier network
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Non-exclusive labels; adds a logistic head when present
    pub overlapping_classes: Option<Vec<String>>,

    /// Mutually exclusive labels for the softmax head
    pub exclusive_classes: Vec<String>,

    /// Merge an analytics feature branch with the content branch
    pub analytics_input: bool,

    /// Content branch input stage
    pub network_type: NetworkType,

    /// Base width of the recurrent stage
    pub width: usize,

    /// Word feature width per recurrent step
    pub num_words: usize,

    /// Width of the analytics feature vector
    pub analytics_features: usize,

    /// Convolutional input as (channels, height, width)
    pub conv_input: [usize; 3],

    /// Dropout probability after each convolution
    pub dropout: f32,

    pub optimizer: OptimizerKind,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            overlapping_classes: None,
            exclusive_classes: ["finance", "promos", "social", "forums", "updates"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            analytics_input: true,
            network_type: NetworkType::Recurrent,
            width: 100,
            num_words: 64,
            analytics_features: 16,
            conv_input: [1, 32, 8],
            dropout: 0.0,
            optimizer: OptimizerKind::default(),
        }
    }
}

impl ClassifierConfig {
    /// Load configuration from a JSON file, filling unspecified fields with defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.exclusive_classes.is_empty() {
            return Err(crate::ZmlError::Config(
                "exclusive_classes must not be empty".to_string(),
            ));
        }

        if let Some(ref overlapping) = self.overlapping_classes {
            if overlapping.is_empty() {
                return Err(crate::ZmlError::Config(
                    "overlapping_classes must not be empty when given".to_string(),
                ));
            }
        }

        if self.width == 0 || self.num_words == 0 {
            return Err(crate::ZmlError::Config(
                "width and num_words must be > 0".to_string(),
            ));
        }

        if self.analytics_input && self.analytics_features == 0 {
            return Err(crate::ZmlError::Config(
                "analytics_features must be > 0 with analytics_input".to_string(),
            ));
        }

        if self.conv_input.iter().any(|&d| d == 0) {
            return Err(crate::ZmlError::Config(format!(
                "conv_input dimensions must be > 0, got {:?}",
                self.conv_input
            )));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(crate::ZmlError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }

        Ok(())
    }

    /// LSTM hidden size: narrower when it shares the merge with analytics
    pub fn recurrent_hidden(&self) -> usize {
        if self.analytics_input {
            self.width * 3
        } else {
            self.width * 6
        }
    }

    pub fn num_exclusive(&self) -> usize {
        self.exclusive_classes.len()
    }

    pub fn num_overlapping(&self) -> Option<usize> {
        self.overlapping_classes.as_ref().map(|c| c.len())
    }
}

/// Configuration for batch iteration
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct IteratorConfig {
    /// Samples per batch, fixed for the lifetime of the backend
    pub batch_size: usize,
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self { batch_size: 32 }
    }
}
