use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};
use crate::math::Matrix;

/// Closed set of element-wise activations available to Dense and Activation
/// layers.
///
/// The discriminant is the code stored in saved files, so variants must not
/// be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Tanh = 0,
    /// `tanh` squashed into `(0, 1)`: `0.5·tanh(x) + 0.5`.
    TanhBias = 1,
    ReLU = 2,
    Sigmoid = 3,
    Linear = 4,
}

/// Slope used for non-positive ReLU outputs so dead units can recover.
const RELU_LEAK: f64 = 0.0001;

impl Activation {
    pub fn function(&self, x: f64) -> f64 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::TanhBias => x.tanh() * 0.5 + 0.5,
            Activation::ReLU => if x > 0.0 { x } else { 0.0 },
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Linear => x,
        }
    }

    /// Derivative expressed in terms of the activated value `y = f(x)`.
    ///
    /// Layers keep only their activated output, so backpropagation evaluates
    /// the slope from `y` rather than from the pre-activation.
    pub fn derivative(&self, y: f64) -> f64 {
        match self {
            Activation::Tanh => 1.0 - y * y,
            Activation::TanhBias => {
                let t = 2.0 * y - 1.0;
                0.5 * (1.0 - t * t)
            }
            Activation::ReLU => if y > 0.0 { 1.0 } else { RELU_LEAK },
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Linear => 1.0,
        }
    }

    pub fn activate(&self, x: &Matrix) -> Matrix {
        x.mapv(|v| self.function(v))
    }

    pub fn derive(&self, y: &Matrix) -> Matrix {
        y.mapv(|v| self.derivative(v))
    }

    /// Whether weights feeding this activation use the narrower Xavier scale.
    pub fn saturates(&self) -> bool {
        matches!(self, Activation::Tanh | Activation::TanhBias | Activation::Sigmoid)
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<Activation> {
        match code {
            0 => Ok(Activation::Tanh),
            1 => Ok(Activation::TanhBias),
            2 => Ok(Activation::ReLU),
            3 => Ok(Activation::Sigmoid),
            4 => Ok(Activation::Linear),
            other => Err(NetError::format(format!("unknown activation code {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Activation; 5] = [
        Activation::Tanh,
        Activation::TanhBias,
        Activation::ReLU,
        Activation::Sigmoid,
        Activation::Linear,
    ];

    #[test]
    fn derivative_from_output_matches_finite_difference() {
        let h = 1e-6;
        for act in ALL {
            for &x in &[-1.3, -0.2, 0.4, 1.7] {
                if act == Activation::ReLU && x <= 0.0 {
                    continue;
                }
                let numeric = (act.function(x + h) - act.function(x - h)) / (2.0 * h);
                let analytic = act.derivative(act.function(x));
                assert!((numeric - analytic).abs() < 1e-5, "{act:?} at {x}");
            }
        }
    }

    #[test]
    fn relu_leaks_below_zero() {
        assert_eq!(Activation::ReLU.derivative(0.0), RELU_LEAK);
    }

    #[test]
    fn codes_are_stable() {
        for act in ALL {
            assert_eq!(Activation::from_code(act.code()).unwrap(), act);
        }
        assert!(matches!(Activation::from_code(9), Err(NetError::Format(_))));
    }
}
