use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// Update rule a Dense layer applies to its weights.
///
/// The discriminant is the code stored in saved files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainScheme {
    /// RMS-normalized gradient fed through momentum. Not bias-corrected.
    Adam = 0,
    RMSprop = 1,
    Momentum = 2,
    AdaGrad = 3,
    Sgd = 4,
}

impl TrainScheme {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<TrainScheme> {
        match code {
            0 => Ok(TrainScheme::Adam),
            1 => Ok(TrainScheme::RMSprop),
            2 => Ok(TrainScheme::Momentum),
            3 => Ok(TrainScheme::AdaGrad),
            4 => Ok(TrainScheme::Sgd),
            other => Err(NetError::format(format!("unknown train scheme code {other}"))),
        }
    }
}

impl Default for TrainScheme {
    fn default() -> Self {
        TrainScheme::Adam
    }
}

/// Hyperparameters captured by value into each Dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    pub learn_rate: f64,
    /// Momentum β; the fresh gradient is weighted by `1 - β`.
    pub momentum: f64,
    /// RMS accumulator β.
    pub rms_prop: f64,
    /// Dropout keep probability; `1.0` disables dropout for the layer.
    pub keep_rate: f64,
    /// Multiplicative decay applied to the weights before each increment.
    pub weight_decay: Option<f64>,
}
