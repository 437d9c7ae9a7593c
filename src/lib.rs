//! zmlcore - data feeding and network assembly for message classification
//!
//! Two independent pieces live here:
//!
//! - **Iterators**: a simple pairing iterator over opaque samples, and a batched
//!   multi-stream iterator that slices device-resident tensors (sample axis last)
//!   into fixed-size batches, with optional recurrent step counts per stream and
//!   shuffling that keeps every stream aligned.
//! - **Classifier network**: a declarative topology (recurrent or convolutional
//!   content stage, optional analytics branch, exclusive and overlapping heads)
//!   built on candle-nn.
//!
//! # Example
//!
//! ```ignore
//! use zmlcore::backend::CandleBackend;
//! use zmlcore::data::BatchIterator;
//!
//! let backend = CandleBackend::cpu(32);
//! let mut it = BatchIterator::new(&backend, vec![words, analytics], Some(vec![labels]), Some(vec![8, 1]))?;
//! it.shuffle()?;
//! for batch in it.produce() {
//!     let (inputs, targets) = batch?;
//! }
//! ```

pub mod backend;
pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod training;

// Re-export commonly used items
pub use config::{ClassifierConfig, IteratorConfig, NetworkType, OptimizerKind};
pub use data::{Batch, BatchIterator, DataIterator, Shuffle, TrainingIterator};
pub use models::{ClassifierNetwork, ClassifierOutput, Topology};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum ZmlError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Length mismatch: {inputs} inputs but {targets} targets")]
    LengthMismatch { inputs: usize, targets: usize },

    #[error("Unsupported tensor rank {0}, expected 2 to 5")]
    UnsupportedRank(usize),

    #[error("Shuffle misaligned sample {index} in input stream {stream}")]
    ShuffleMismatch { index: usize, stream: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NumPy error: {0}")]
    Npy(String),
}

pub type Result<T> = std::result::Result<T, ZmlError>;
