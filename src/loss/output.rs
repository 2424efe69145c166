use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};
use crate::layers::NodeId;
use crate::loss::mean_square::MeanSquare;
use crate::loss::softmax::Softmax;
use crate::math::Matrix;
use crate::network::NetDna;

/// How the terminal node's output is turned into predictions and a loss.
///
/// The discriminant is the code stored in saved files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    MeanSquare = 0,
    SoftMax = 1,
    StableSoftMax = 2,
}

impl OutputType {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<OutputType> {
        match code {
            0 => Ok(OutputType::MeanSquare),
            1 => Ok(OutputType::SoftMax),
            2 => Ok(OutputType::StableSoftMax),
            other => Err(NetError::format(format!("unknown output type code {other}"))),
        }
    }

    /// Maps the terminal node's real output to predictions.
    pub fn transform(&self, logits: &Matrix) -> Matrix {
        match self {
            OutputType::MeanSquare => logits.clone(),
            OutputType::SoftMax => Softmax::naive(logits),
            OutputType::StableSoftMax => Softmax::stable(logits),
        }
    }

    pub fn loss(&self, output: &Matrix, target: &Matrix) -> f64 {
        match self {
            OutputType::MeanSquare => MeanSquare::loss(output, target),
            OutputType::SoftMax | OutputType::StableSoftMax => Softmax::cross_entropy(output, target),
        }
    }

    pub fn gradient(&self, output: &Matrix, target: &Matrix) -> Matrix {
        match self {
            OutputType::MeanSquare => MeanSquare::gradient(output, target),
            OutputType::SoftMax | OutputType::StableSoftMax => Softmax::gradient(output, target),
        }
    }
}

/// Weights and error captured by a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub weights: Vec<f64>,
    pub error: f64,
}

/// Loss node wrapping the terminal layer of a graph.
#[derive(Debug, Clone)]
pub struct OutputLayer {
    last: NodeId,
    kind: OutputType,
    output: Matrix,
    error: f64,
    version: u64,
    dna: Option<NetDna>,
    checkpoint: Option<Checkpoint>,
}

impl OutputLayer {
    pub fn new(last: NodeId, kind: OutputType) -> OutputLayer {
        OutputLayer {
            last,
            kind,
            output: Matrix::zeros((0, 0)),
            error: 0.0,
            version: 0,
            dna: None,
            checkpoint: None,
        }
    }

    pub fn last(&self) -> NodeId {
        self.last
    }

    pub fn kind(&self) -> OutputType {
        self.kind
    }

    /// Predictions of the last evaluation.
    pub fn output(&self) -> &Matrix {
        &self.output
    }

    /// Error recorded by the last loss computation.
    pub fn error(&self) -> f64 {
        self.error
    }

    /// Feed version the cached predictions belong to.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_output(&mut self, logits: &Matrix, version: u64) {
        self.output = self.kind.transform(logits);
        self.version = version;
    }

    /// Computes and records the loss of the cached predictions.
    pub(crate) fn compute_error(&mut self, target: &Matrix) -> Result<f64> {
        self.check_target(target)?;
        self.error = self.kind.loss(&self.output, target);
        Ok(self.error)
    }

    pub(crate) fn gradient(&self, target: &Matrix) -> Result<Matrix> {
        self.check_target(target)?;
        Ok(self.kind.gradient(&self.output, target))
    }

    fn check_target(&self, target: &Matrix) -> Result<()> {
        if target.nrows() != self.output.nrows() {
            return Err(NetError::shape("target rows", self.output.nrows(), target.nrows()));
        }
        if target.ncols() != self.output.ncols() {
            return Err(NetError::BatchSizeMismatch {
                expected: self.output.ncols(),
                found: target.ncols(),
            });
        }
        Ok(())
    }

    pub(crate) fn dna(&self) -> Option<&NetDna> {
        self.dna.as_ref()
    }

    pub(crate) fn set_dna(&mut self, dna: NetDna) {
        self.dna = Some(dna);
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    pub(crate) fn store_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoint = Some(checkpoint);
    }

    pub(crate) fn restore_error(&mut self, error: f64) {
        self.error = error;
    }
}
