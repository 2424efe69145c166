pub mod config;
pub mod container;
pub mod dna;
pub mod graph;
pub mod persist;

pub use config::Hyperparams;
pub use container::NetContainer;
pub use dna::{NetDna, WeightSlot};
pub use graph::{FeedContext, Graph};
pub use persist::{load_graph, save_graph};
