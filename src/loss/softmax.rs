use ndarray::Axis;

use crate::math::Matrix;

/// Column-wise softmax and its cross-entropy loss.
pub struct Softmax;

impl Softmax {
    /// `exp(x) / Σ exp(x)` per column, with no overflow protection: logits in
    /// the hundreds already overflow to `inf / inf = NaN`.
    pub fn naive(logits: &Matrix) -> Matrix {
        let mut out = logits.mapv(f64::exp);
        normalize_columns(&mut out);
        out
    }

    /// Softmax after subtracting each column's maximum, finite for any
    /// finite input.
    pub fn stable(logits: &Matrix) -> Matrix {
        let mut out = logits.clone();
        for mut col in out.axis_iter_mut(Axis(1)) {
            let max = col.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            col.mapv_inplace(|v| (v - max).exp());
        }
        normalize_columns(&mut out);
        out
    }

    /// `-Σ target · ln(output) / batch`. Entries with a zero target do not
    /// contribute, so a saturated zero probability there costs nothing.
    pub fn cross_entropy(output: &Matrix, target: &Matrix) -> f64 {
        let batch = output.ncols().max(1) as f64;
        let sum: f64 = output
            .iter()
            .zip(target.iter())
            .filter(|&(_, &t)| t != 0.0)
            .map(|(&o, &t)| t * o.ln())
            .sum();
        -sum / batch
    }

    /// Gradient w.r.t. the logits of softmax followed by cross-entropy.
    pub fn gradient(output: &Matrix, target: &Matrix) -> Matrix {
        target - output
    }
}

fn normalize_columns(m: &mut Matrix) {
    for mut col in m.axis_iter_mut(Axis(1)) {
        let total = col.sum();
        col.mapv_inplace(|v| v / total);
    }
}
