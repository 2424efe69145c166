pub mod batches;
pub mod iteration_stats;
pub mod loop_fn;
pub mod train_config;

pub use batches::TrainingSet;
pub use iteration_stats::{IterationStats, TrainReport};
pub use loop_fn::train_loop;
pub use train_config::TrainConfig;
