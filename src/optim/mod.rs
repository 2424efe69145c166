pub mod optimizer;
pub mod scheme;

pub use optimizer::OptimizerState;
pub use scheme::{LayerParams, TrainScheme};
