use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::prelude::*;

use crate::error::{NetError, Result};

/// Dense column-per-sample buffer used by every layer.
///
/// Rows are features, columns are batch entries. Layer outputs are kept
/// *augmented*: one extra trailing row fixed to `1.0` so the bias weight can be
/// folded into the weight matrix multiply.
pub type Matrix = Array2<f64>;

pub fn ones(rows: usize, cols: usize) -> Matrix {
    Matrix::ones((rows, cols))
}

/// Uniform samples on `[-scale, scale]`.
pub fn random(rows: usize, cols: usize, scale: f64) -> Matrix {
    Matrix::random((rows, cols), Uniform::new_inclusive(-1.0, 1.0)) * scale
}

/// He-style initialization: uniform on `[-1, 1]` scaled by `sqrt(2 / cols)`.
///
/// Used in front of ReLU and Linear units. `cols` is the fan-in including the
/// bias column.
pub fn he(rows: usize, cols: usize) -> Matrix {
    random(rows, cols, (2.0 / cols as f64).sqrt())
}

/// Xavier-style initialization: uniform on `[-1, 1]` scaled by `sqrt(1 / cols)`.
///
/// Used in front of Tanh, TanhBias and Sigmoid units.
pub fn xavier(rows: usize, cols: usize) -> Matrix {
    random(rows, cols, (1.0 / cols as f64).sqrt())
}

/// Appends the constant bias row to raw feature data.
pub fn augment(data: &Matrix) -> Matrix {
    let mut ret = ones(data.nrows() + 1, data.ncols());
    ret.slice_mut(s![..data.nrows(), ..]).assign(data);
    ret
}

/// The feature rows of an augmented buffer (everything but the bias row).
pub fn real_part(data: &Matrix) -> Matrix {
    real_view(data).to_owned()
}

pub fn real_view(data: &Matrix) -> ArrayView2<'_, f64> {
    let rows = data.nrows().saturating_sub(1);
    data.slice(s![..rows, ..])
}

/// Resets the trailing bias row to ones.
pub fn fix_bias_row(data: &mut Matrix) {
    if let Some(last) = data.nrows().checked_sub(1) {
        data.row_mut(last).fill(1.0);
    }
}

/// Inverted-dropout mask: each entry is `1 / keep_rate` with probability
/// `keep_rate`, otherwise `0`.
pub fn keep_mask(rows: usize, cols: usize, keep_rate: f64) -> Matrix {
    let mut rng = rand::thread_rng();
    let scale = 1.0 / keep_rate;
    Matrix::from_shape_simple_fn((rows, cols), || {
        if rng.gen::<f64>() < keep_rate {
            scale
        } else {
            0.0
        }
    })
}

pub fn select_columns(data: &Matrix, order: &[usize]) -> Matrix {
    data.select(Axis(1), order)
}

/// Joins matrices side by side (batch axis).
pub fn hstack(parts: &[Matrix]) -> Result<Matrix> {
    let views: Vec<_> = parts.iter().map(|m| m.view()).collect();
    Ok(concatenate(Axis(1), &views)?)
}

/// Stacks matrices on top of each other (feature axis).
pub fn vstack(parts: &[ArrayView2<'_, f64>]) -> Result<Matrix> {
    Ok(concatenate(Axis(0), parts)?)
}

/// Builds a `rows × n` matrix from column-major data: every `rows`
/// consecutive values form one sample.
pub fn from_columns(data: &[f64], rows: usize) -> Result<Matrix> {
    if rows == 0 || data.len() % rows != 0 {
        return Err(NetError::shape("column-major data", rows, data.len()));
    }
    let cols = data.len() / rows;
    let transposed = Matrix::from_shape_vec((cols, rows), data.to_vec())?;
    Ok(transposed.reversed_axes().as_standard_layout().to_owned())
}

/// Flattens a matrix sample by sample (column-major).
pub fn to_columns(data: &Matrix) -> Vec<f64> {
    data.t().iter().copied().collect()
}
