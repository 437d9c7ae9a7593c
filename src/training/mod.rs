/// Training driver for the classifier network
///
/// The epoch loop asks the dataset for its shuffle capability before every
/// epoch and uses it when present.
pub mod trainer;

pub use trainer::Trainer;
