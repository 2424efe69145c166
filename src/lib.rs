pub mod activation;
pub mod error;
pub mod layers;
pub mod loss;
pub mod math;
pub mod network;
pub mod optim;
pub mod serial;
pub mod train;

// Convenience re-exports
pub use activation::Activation;
pub use error::{NetError, Result};
pub use layers::{Layer, NodeId};
pub use loss::{OutputLayer, OutputType};
pub use math::Matrix;
pub use network::{FeedContext, Graph, Hyperparams, NetContainer, NetDna};
pub use optim::TrainScheme;
pub use train::{train_loop, TrainConfig, TrainReport, TrainingSet};
