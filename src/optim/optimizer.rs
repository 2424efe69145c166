use ndarray::Zip;

use crate::math::Matrix;
use crate::optim::scheme::{LayerParams, TrainScheme};

const EPSILON: f64 = 1e-8;

/// Per-layer optimizer buffers.
///
/// `delta` matches the weight matrix and carries momentum. `rms` matches the
/// pre-activation gradient (outputs × batch) and is re-seeded with ones
/// whenever the batch width changes.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    delta: Matrix,
    rms: Matrix,
}

impl OptimizerState {
    pub fn new(rows: usize, cols: usize) -> OptimizerState {
        OptimizerState {
            delta: Matrix::zeros((rows, cols)),
            rms: Matrix::ones((rows, 1)),
        }
    }

    pub fn reset(&mut self) {
        self.delta.fill(0.0);
        self.rms.fill(1.0);
    }

    pub fn delta(&self) -> &Matrix {
        &self.delta
    }

    pub fn rms(&self) -> &Matrix {
        &self.rms
    }

    /// Applies one update to `weights`.
    ///
    /// `grad` is the pre-activation gradient (`target - output` convention,
    /// so it points downhill) and `prev` the augmented input the layer saw.
    pub fn step(
        &mut self,
        scheme: TrainScheme,
        params: &LayerParams,
        weights: &mut Matrix,
        grad: &Matrix,
        prev: &Matrix,
    ) {
        let lr = params.learn_rate;
        let increment = match scheme {
            TrainScheme::Sgd => grad.dot(&prev.t()) * lr,
            TrainScheme::Momentum => self.momentum(params, grad, prev),
            TrainScheme::RMSprop => {
                let normalized = self.normalize(grad, Some(params.rms_prop));
                normalized.dot(&prev.t()) * lr
            }
            TrainScheme::AdaGrad => {
                let normalized = self.normalize(grad, None);
                normalized.dot(&prev.t()) * lr
            }
            TrainScheme::Adam => {
                let normalized = self.normalize(grad, Some(params.rms_prop));
                self.momentum(params, &normalized, prev)
            }
        };

        if let Some(decay) = params.weight_decay {
            *weights *= decay;
        }
        *weights += &increment;
    }

    fn momentum(&mut self, params: &LayerParams, grad: &Matrix, prev: &Matrix) -> Matrix {
        let fresh = grad.dot(&prev.t()) * (params.learn_rate * (1.0 - params.momentum));
        self.delta = fresh + &self.delta * params.momentum;
        self.delta.clone()
    }

    /// Divides the gradient by its running RMS. `beta == None` accumulates
    /// without decay (AdaGrad).
    fn normalize(&mut self, grad: &Matrix, beta: Option<f64>) -> Matrix {
        if self.rms.dim() != grad.dim() {
            self.rms = Matrix::ones(grad.dim());
        }
        let squared = grad.mapv(|g| g * g);
        match beta {
            Some(beta) => self.rms = &self.rms * beta + &(squared * (1.0 - beta)),
            None => self.rms += &squared,
        }
        Zip::from(grad)
            .and(&self.rms)
            .map_collect(|&g, &r| g / (r.sqrt() + EPSILON))
    }
}
