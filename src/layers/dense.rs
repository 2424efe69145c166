use crate::activation::Activation;
use crate::error::{NetError, Result};
use crate::layers::{Layer, LinkIndex, LoadedLayer, NodeId};
use crate::math::matrix::{self, Matrix};
use crate::optim::{LayerParams, OptimizerState, TrainScheme};
use crate::serial::{required, tag, Chunk, ChunkWriter, Dispatch};

/// Gradient contribution waiting for the next weight update.
#[derive(Debug, Clone)]
struct PendingGradient {
    /// Feed version of the forward pass the gradient belongs to.
    version: u64,
    /// Pre-activation gradient, outputs × batch.
    grad: Matrix,
    /// Augmented input seen by that forward pass.
    prev: Matrix,
}

/// Fully connected layer: `f(W · x)` with the bias folded into the last
/// column of `W`.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    input: NodeId,
    weights: Matrix,
    activation: Activation,
    scheme: TrainScheme,
    params: LayerParams,
    state: OptimizerState,
    activated: Matrix, // f(W · x) before the dropout mask
    mask: Option<Matrix>,
    /// Mask forced on the next forward pass, consumed by it.
    pinned: Option<Matrix>,
    pending: Vec<PendingGradient>,
}

impl DenseLayer {
    pub fn new(
        input: NodeId,
        n_input: usize,
        n_output: usize,
        activation: Activation,
        scheme: TrainScheme,
        params: LayerParams,
    ) -> DenseLayer {
        let weights = if activation.saturates() {
            matrix::xavier(n_output, n_input + 1)
        } else {
            matrix::he(n_output, n_input + 1)
        };
        DenseLayer::with_weights(input, weights, activation, scheme, params)
    }

    pub fn with_weights(
        input: NodeId,
        weights: Matrix,
        activation: Activation,
        scheme: TrainScheme,
        params: LayerParams,
    ) -> DenseLayer {
        let (rows, cols) = weights.dim();
        DenseLayer {
            input,
            weights,
            activation,
            scheme,
            params,
            state: OptimizerState::new(rows, cols),
            activated: Matrix::zeros((rows, 1)),
            mask: None,
            pinned: None,
            pending: Vec::new(),
        }
    }

    pub fn input(&self) -> NodeId {
        self.input
    }

    pub(crate) fn set_input(&mut self, input: NodeId) {
        self.input = input;
    }

    pub fn n_input(&self) -> usize {
        self.weights.ncols() - 1
    }

    pub fn n_output(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &Matrix {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Matrix {
        &mut self.weights
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn scheme(&self) -> TrainScheme {
        self.scheme
    }

    pub fn params(&self) -> &LayerParams {
        &self.params
    }

    pub fn optimizer(&self) -> &OptimizerState {
        &self.state
    }

    pub fn set_learn_rate(&mut self, rate: f64) {
        self.params.learn_rate = rate;
    }

    pub fn set_momentum(&mut self, beta: f64) {
        self.params.momentum = beta;
    }

    pub fn set_rms_prop(&mut self, beta: f64) {
        self.params.rms_prop = beta;
    }

    pub fn reset_momentum(&mut self) {
        self.state.reset();
    }

    pub(crate) fn forward(&mut self, outputs: &[Matrix], dropout: bool) -> Result<Matrix> {
        let inp = &outputs[self.input.0];
        if inp.nrows() != self.weights.ncols() {
            return Err(NetError::shape(
                "dense input rows",
                self.weights.ncols(),
                inp.nrows(),
            ));
        }
        let activated = self.activation.activate(&self.weights.dot(inp));
        let mask = match self.pinned.take() {
            Some(mask) => {
                if mask.nrows() != activated.nrows() {
                    return Err(NetError::shape("dropout mask rows", activated.nrows(), mask.nrows()));
                }
                if mask.ncols() != activated.ncols() {
                    return Err(NetError::BatchSizeMismatch {
                        expected: activated.ncols(),
                        found: mask.ncols(),
                    });
                }
                Some(mask)
            }
            None if dropout && self.params.keep_rate < 1.0 => Some(matrix::keep_mask(
                activated.nrows(),
                activated.ncols(),
                self.params.keep_rate,
            )),
            None => None,
        };
        let shown = match &mask {
            Some(mask) => &activated * mask,
            None => activated.clone(),
        };
        self.mask = mask;
        self.activated = activated;
        Ok(matrix::augment(&shown))
    }

    /// Dropout mask drawn by the last forward pass, if any.
    pub fn mask(&self) -> Option<&Matrix> {
        self.mask.as_ref()
    }

    /// Makes the next forward pass reuse `mask` instead of drawing one.
    pub(crate) fn pin_mask(&mut self, mask: Matrix) {
        self.pinned = Some(mask);
    }

    pub(crate) fn unpin_mask(&mut self) {
        self.pinned = None;
    }

    /// Records the gradient for the deferred update and returns the gradient
    /// for the predecessor. Contributions from the same forward pass are
    /// summed; contributions from different passes are kept side by side.
    pub(crate) fn backward(
        &mut self,
        outputs: &[Matrix],
        grad: &Matrix,
        version: u64,
    ) -> Result<Vec<(NodeId, Matrix)>> {
        if grad.dim() != self.activated.dim() {
            return Err(NetError::shape("dense gradient rows", self.activated.nrows(), grad.nrows()));
        }
        let mut pre = grad * &self.activation.derive(&self.activated);
        if let Some(mask) = &self.mask {
            pre *= mask;
        }
        let prop = matrix::real_part(&self.weights.t().dot(&pre));

        match self.pending.last_mut() {
            Some(last) if last.version == version => last.grad += &pre,
            _ => self.pending.push(PendingGradient {
                version,
                grad: pre,
                prev: outputs[self.input.0].clone(),
            }),
        }
        Ok(vec![(self.input, prop)])
    }

    /// Weight-space step direction accumulated since the last update
    /// (`Σ grad · prevᵗ`), or `None` when nothing is pending.
    pub fn weight_gradient(&self) -> Option<Matrix> {
        self.pending
            .iter()
            .map(|p| p.grad.dot(&p.prev.t()))
            .reduce(|acc, g| acc + g)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn clear_gradients(&mut self) {
        self.pending.clear();
    }

    /// Applies the optimizer to everything gathered by `backward` and clears it.
    pub fn update_weights(&mut self) -> Result<()> {
        let mut pending = std::mem::take(&mut self.pending);
        let (grad, prev) = match pending.len() {
            0 => return Ok(()),
            1 => {
                let p = pending.remove(0);
                (p.grad, p.prev)
            }
            _ => {
                let grads: Vec<Matrix> = pending.iter().map(|p| p.grad.clone()).collect();
                let prevs: Vec<Matrix> = pending.into_iter().map(|p| p.prev).collect();
                (matrix::hstack(&grads)?, matrix::hstack(&prevs)?)
            }
        };
        self.state
            .step(self.scheme, &self.params, &mut self.weights, &grad, &prev);
        Ok(())
    }

    pub(crate) fn save<L: LinkIndex>(&self, w: &mut ChunkWriter, links: &L) -> Result<()> {
        w.write_i32(tag::ROWS, self.weights.nrows() as i32)?;
        w.write_i32(tag::COLS, self.weights.ncols() as i32)?;
        w.write_f64s(tag::WGHT, self.weights.iter())?;
        w.write_f64(tag::RATE, self.params.learn_rate)?;
        w.write_f64(tag::MMNT, self.params.momentum)?;
        w.write_f64(tag::RMSP, self.params.rms_prop)?;
        w.write_f64(tag::DRPT, self.params.keep_rate)?;
        if let Some(decay) = self.params.weight_decay {
            w.write_f64(tag::WDCY, decay)?;
        }
        w.write_i32(tag::ACTV, self.activation.code())?;
        w.write_i32(tag::TRNS, self.scheme.code())?;
        w.write_i32(tag::INPT, links.index_of(self.input)?)
    }

    pub(crate) fn load(chunk: Chunk<'_>) -> Result<LoadedLayer> {
        let mut name = None;
        let (mut rows, mut cols, mut weights) = (None, None, None);
        let (mut rate, mut momentum, mut rms, mut keep, mut decay) = (None, None, None, None, None);
        let (mut act, mut train, mut prev) = (None, None, None);
        Dispatch::new()
            .on(tag::NAME, |c| {
                name = Some(c.read_string()?);
                Ok(())
            })
            .on(tag::ROWS, |c| {
                rows = Some(c.read_usize()?);
                Ok(())
            })
            .on(tag::COLS, |c| {
                cols = Some(c.read_usize()?);
                Ok(())
            })
            .on(tag::WGHT, |c| {
                weights = Some(c.read_f64s()?);
                Ok(())
            })
            .on(tag::RATE, |c| {
                rate = Some(c.read_f64()?);
                Ok(())
            })
            .on(tag::MMNT, |c| {
                momentum = Some(c.read_f64()?);
                Ok(())
            })
            .on(tag::RMSP, |c| {
                rms = Some(c.read_f64()?);
                Ok(())
            })
            .on(tag::DRPT, |c| {
                keep = Some(c.read_f64()?);
                Ok(())
            })
            .on(tag::WDCY, |c| {
                decay = Some(c.read_f64()?);
                Ok(())
            })
            .on(tag::ACTV, |c| {
                act = Some(Activation::from_code(c.read_i32()?)?);
                Ok(())
            })
            .on(tag::TRNS, |c| {
                train = Some(TrainScheme::from_code(c.read_i32()?)?);
                Ok(())
            })
            .on(tag::INPT, |c| {
                prev = Some(c.read_i32()?);
                Ok(())
            })
            .execute(chunk)?;

        let scope = tag::DENS;
        let rows = required(rows, scope, tag::ROWS)?;
        let cols = required(cols, scope, tag::COLS)?;
        if cols == 0 {
            return Err(NetError::format("dense layer without bias column"));
        }
        let data = required(weights, scope, tag::WGHT)?;
        if data.len() != rows * cols {
            return Err(NetError::format(format!(
                "dense weights hold {} values, expected {rows}x{cols}",
                data.len()
            )));
        }
        let params = LayerParams {
            learn_rate: required(rate, scope, tag::RATE)?,
            momentum: required(momentum, scope, tag::MMNT)?,
            rms_prop: required(rms, scope, tag::RMSP)?,
            keep_rate: required(keep, scope, tag::DRPT)?,
            weight_decay: decay,
        };
        let layer = DenseLayer::with_weights(
            NodeId::UNLINKED,
            Matrix::from_shape_vec((rows, cols), data)?,
            required(act, scope, tag::ACTV)?,
            required(train, scope, tag::TRNS)?,
            params,
        );
        Ok(LoadedLayer {
            layer: Layer::Dense(layer),
            name,
            links: vec![required(prev, scope, tag::INPT)?],
        })
    }
}
