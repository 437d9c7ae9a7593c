/// Neural network layer blocks
///
/// The fixed catalog the classifier topologies are assembled from:
/// - Activations (Rectlin, Tanh, Logistic, Explin, Softmax)
/// - Dense (Glorot-uniform affine)
/// - Conv (rectangular kernels, per-axis strides, optional dropout)
/// - Lstm and recurrent summation

pub mod activations;
pub mod conv;
pub mod dense;
pub mod recurrent;

pub use activations::Activation;
pub use conv::{Conv, ConvSpec};
pub use dense::Dense;
pub use recurrent::{recurrent_sum, Lstm};
