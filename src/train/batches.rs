use rand::seq::SliceRandom;

use crate::error::{NetError, Result};
use crate::math::matrix::{self, Matrix};

/// Accumulated training examples, one column per example.
///
/// Inputs are kept augmented, one matrix per network input. Each call to
/// [`TrainingSet::next_batch`] hands out the next `batch_size` examples of a
/// shuffled order; when the order runs out it is reshuffled and the batch is
/// topped up from the fresh order.
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    inputs: Vec<Matrix>,
    targets: Option<Matrix>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
}

impl TrainingSet {
    pub fn new() -> TrainingSet {
        TrainingSet::default()
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `0` (the default) trains on every example at once.
    pub fn set_batch_size(&mut self, size: usize) {
        self.batch_size = size;
    }

    /// Appends already augmented inputs and their targets.
    pub fn add_raw(&mut self, inputs: Vec<Matrix>, target: Matrix) -> Result<()> {
        let batch = inputs
            .first()
            .map(|m| m.ncols())
            .ok_or_else(|| NetError::shape("input matrices", 1, 0))?;
        for m in inputs.iter().chain(std::iter::once(&target)) {
            if m.ncols() != batch {
                return Err(NetError::BatchSizeMismatch {
                    expected: batch,
                    found: m.ncols(),
                });
            }
        }

        match &mut self.targets {
            None => {
                self.inputs = inputs;
                self.targets = Some(target);
            }
            Some(targets) => {
                if inputs.len() != self.inputs.len() {
                    return Err(NetError::shape("input matrices", self.inputs.len(), inputs.len()));
                }
                for (stored, fresh) in self.inputs.iter().zip(&inputs) {
                    if stored.nrows() != fresh.nrows() {
                        return Err(NetError::shape("training input rows", stored.nrows(), fresh.nrows()));
                    }
                }
                if targets.nrows() != target.nrows() {
                    return Err(NetError::shape("training target rows", targets.nrows(), target.nrows()));
                }
                for (stored, fresh) in self.inputs.iter_mut().zip(inputs) {
                    *stored = matrix::hstack(&[stored.clone(), fresh])?;
                }
                *targets = matrix::hstack(&[targets.clone(), target])?;
            }
        }

        let start = self.order.len();
        self.order.extend(start..start + batch);
        self.order.shuffle(&mut rand::thread_rng());
        self.cursor = 0;
        Ok(())
    }

    /// The inputs and targets of the next batch.
    pub fn next_batch(&mut self) -> Result<(Vec<Matrix>, Matrix)> {
        let targets = self.targets.as_ref().ok_or(NetError::EmptyTrainingSet)?;
        if self.order.is_empty() {
            return Err(NetError::EmptyTrainingSet);
        }
        if self.batch_size == 0 || self.batch_size >= self.order.len() {
            return Ok((self.inputs.clone(), targets.clone()));
        }

        let mut picked = Vec::with_capacity(self.batch_size);
        while picked.len() < self.batch_size {
            if self.cursor == self.order.len() {
                self.order.shuffle(&mut rand::thread_rng());
                self.cursor = 0;
            }
            picked.push(self.order[self.cursor]);
            self.cursor += 1;
        }
        let inputs = self
            .inputs
            .iter()
            .map(|m| matrix::select_columns(m, &picked))
            .collect();
        Ok((inputs, matrix::select_columns(targets, &picked)))
    }
}
