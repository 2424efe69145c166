pub mod mean_square;
pub mod output;
pub mod softmax;

pub use mean_square::MeanSquare;
pub use output::{Checkpoint, OutputLayer, OutputType};
pub use softmax::Softmax;
