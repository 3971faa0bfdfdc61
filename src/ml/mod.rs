pub mod features;
pub mod model;
pub mod signal;

pub use features::{build_features, MIN_ALIGNED_ROWS};
pub use signal::{SignalModel, SignalReading};
