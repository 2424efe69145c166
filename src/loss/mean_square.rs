use crate::math::Matrix;

pub struct MeanSquare;

impl MeanSquare {
    /// `0.5 · Σ (target - output)² / batch`
    pub fn loss(output: &Matrix, target: &Matrix) -> f64 {
        let batch = output.ncols().max(1) as f64;
        let sum: f64 = output
            .iter()
            .zip(target.iter())
            .map(|(o, t)| (t - o).powi(2))
            .sum();
        0.5 * sum / batch
    }

    /// `target - output`, the direction that lowers the loss.
    pub fn gradient(output: &Matrix, target: &Matrix) -> Matrix {
        target - output
    }
}
