use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::optim::{LayerParams, TrainScheme};

/// Defaults handed to every Dense layer a [`Graph`](crate::network::Graph)
/// builds.
///
/// Layers copy these values at construction. Changing a graph's defaults
/// afterwards only affects layers added later; use the container's setters to
/// rewrite existing layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparams {
    pub learn_rate: f64,
    pub momentum: f64,
    pub rms_prop: f64,
    /// Dropout keep probability.
    pub keep_rate: f64,
    pub weight_decay: Option<f64>,
    pub scheme: TrainScheme,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Hyperparams {
            learn_rate: 1e-4,
            momentum: 0.999,
            rms_prop: 0.999,
            keep_rate: 0.8,
            weight_decay: None,
            scheme: TrainScheme::default(),
        }
    }
}

impl Hyperparams {
    pub fn layer_params(&self) -> LayerParams {
        LayerParams {
            learn_rate: self.learn_rate,
            momentum: self.momentum,
            rms_prop: self.rms_prop,
            keep_rate: self.keep_rate,
            weight_decay: self.weight_decay,
        }
    }

    /// Serializes the defaults to a pretty-printed JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Reads defaults from JSON; missing fields fall back to [`Hyperparams::default`].
    pub fn load_json(path: impl AsRef<Path>) -> Result<Hyperparams> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}
