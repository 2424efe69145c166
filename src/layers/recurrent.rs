//! Recurrent entry and exit nodes.
//!
//! A recurrent loop is the subgraph between a [`RecurrentInput`] and the node
//! a [`RecurrentLayer`] wraps. The graph drives the loop one batch column
//! (timestep) at a time, writing `[features; state; 1]` into the entry node's
//! buffer before each step and reading the new state back from the wrapped
//! node.

use ndarray::{s, Axis};

use crate::error::{NetError, Result};
use crate::layers::{Layer, LinkIndex, LoadedLayer, NodeId};
use crate::math::matrix::{self, Matrix};
use crate::serial::{required, tag, Chunk, ChunkWriter, Dispatch};

/// Entry of a recurrent loop: the external input's features followed by
/// `recurrent` state rows.
#[derive(Debug, Clone)]
pub struct RecurrentInput {
    input: NodeId,
    features: usize,
    recurrent: usize,
    capture: bool,
    captured: Option<Matrix>,
}

impl RecurrentInput {
    pub fn new(input: NodeId, features: usize, recurrent: usize) -> RecurrentInput {
        RecurrentInput {
            input,
            features,
            recurrent,
            capture: false,
            captured: None,
        }
    }

    pub fn input(&self) -> NodeId {
        self.input
    }

    pub(crate) fn set_input(&mut self, input: NodeId) {
        self.input = input;
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn recurrent(&self) -> usize {
        self.recurrent
    }

    /// Feature plus state rows, bias excluded.
    pub fn size(&self) -> usize {
        self.features + self.recurrent
    }

    /// Evaluated outside a loop: the state rows are zero.
    pub(crate) fn forward(&self, outputs: &[Matrix]) -> Result<Matrix> {
        let inp = &outputs[self.input.0];
        if inp.nrows() != self.features + 1 {
            return Err(NetError::shape("recurrent input rows", self.features + 1, inp.nrows()));
        }
        let mut out = Matrix::zeros((self.size() + 1, inp.ncols()));
        out.slice_mut(s![..self.features, ..])
            .assign(&matrix::real_view(inp));
        matrix::fix_bias_row(&mut out);
        Ok(out)
    }

    /// Builds one timestep's buffer from column `t` of the external input
    /// and the carried state.
    pub(crate) fn step_input(&self, external: &Matrix, t: usize, state: &Matrix) -> Result<Matrix> {
        if state.nrows() != self.recurrent {
            return Err(NetError::shape("recurrent state rows", self.recurrent, state.nrows()));
        }
        let mut out = matrix::ones(self.size() + 1, 1);
        out.slice_mut(s![..self.features, ..])
            .assign(&external.slice(s![..self.features, t..t + 1]));
        out.slice_mut(s![self.features..self.size(), ..]).assign(state);
        Ok(out)
    }

    /// While capturing, gradients are kept here for the owning recurrent
    /// layer instead of flowing to the external input.
    pub(crate) fn set_capture(&mut self, capture: bool) {
        self.capture = capture;
        self.captured = None;
    }

    pub(crate) fn take_captured(&mut self) -> Option<Matrix> {
        self.captured.take()
    }

    pub(crate) fn backward(&mut self, grad: &Matrix) -> Result<Vec<(NodeId, Matrix)>> {
        if grad.nrows() != self.size() {
            return Err(NetError::shape("recurrent input gradient rows", self.size(), grad.nrows()));
        }
        if self.capture {
            match &mut self.captured {
                Some(sum) => *sum += grad,
                None => self.captured = Some(grad.clone()),
            }
            return Ok(Vec::new());
        }
        let features = grad.slice(s![..self.features, ..]).to_owned();
        Ok(vec![(self.input, features)])
    }

    pub(crate) fn save<L: LinkIndex>(&self, w: &mut ChunkWriter, links: &L) -> Result<()> {
        w.write_i32(tag::ICNT, self.features as i32)?;
        w.write_i32(tag::RCNT, self.recurrent as i32)?;
        w.write_i32(tag::INPT, links.index_of(self.input)?)
    }

    pub(crate) fn load(chunk: Chunk<'_>) -> Result<LoadedLayer> {
        let mut name = None;
        let mut features = None;
        let mut recurrent = None;
        let mut prev = None;
        Dispatch::new()
            .on(tag::NAME, |c| {
                name = Some(c.read_string()?);
                Ok(())
            })
            .on(tag::ICNT, |c| {
                features = Some(c.read_usize()?);
                Ok(())
            })
            .on(tag::RCNT, |c| {
                recurrent = Some(c.read_usize()?);
                Ok(())
            })
            .on(tag::INPT, |c| {
                prev = Some(c.read_i32()?);
                Ok(())
            })
            .execute(chunk)?;
        let scope = tag::RNN_START;
        let layer = RecurrentInput::new(
            NodeId::UNLINKED,
            required(features, scope, tag::ICNT)?,
            required(recurrent, scope, tag::RCNT)?,
        );
        Ok(LoadedLayer {
            layer: Layer::RecurrentInput(layer),
            name,
            links: vec![required(prev, scope, tag::INPT)?],
        })
    }
}

/// Dropout masks of the Dense nodes evaluated in one timestep.
pub(crate) type StepMasks = Vec<(NodeId, Matrix)>;

/// Exit of a recurrent loop. Owns the hidden state carried between timesteps
/// and between calls, plus the step inputs of the last pass for replay during
/// backpropagation.
#[derive(Debug, Clone)]
pub struct RecurrentLayer {
    input: NodeId,
    rnn_input: NodeId,
    state: Matrix,
    steps: Vec<Matrix>,
    masks: Vec<StepMasks>,
}

impl RecurrentLayer {
    pub fn new(input: NodeId, rnn_input: NodeId, recurrent: usize) -> RecurrentLayer {
        RecurrentLayer {
            input,
            rnn_input,
            state: Matrix::zeros((recurrent, 1)),
            steps: Vec::new(),
            masks: Vec::new(),
        }
    }

    /// The wrapped node whose output becomes the next state.
    pub fn input(&self) -> NodeId {
        self.input
    }

    pub fn rnn_input(&self) -> NodeId {
        self.rnn_input
    }

    pub(crate) fn set_links(&mut self, input: NodeId, rnn_input: NodeId) {
        self.input = input;
        self.rnn_input = rnn_input;
    }

    pub fn state(&self) -> &Matrix {
        &self.state
    }

    pub(crate) fn resize_state(&mut self, rows: usize) {
        if self.state.nrows() != rows {
            self.state = Matrix::zeros((rows, 1));
        }
    }

    pub(crate) fn set_state(&mut self, state: Matrix) {
        self.state = state;
    }

    pub fn reset(&mut self) {
        self.state.fill(0.0);
        self.steps.clear();
        self.masks.clear();
    }

    pub(crate) fn begin_pass(&mut self) {
        self.steps.clear();
        self.masks.clear();
    }

    /// Records one timestep's input and the dropout masks its loop body drew.
    pub(crate) fn push_step(&mut self, step: Matrix, masks: StepMasks) {
        self.steps.push(step);
        self.masks.push(masks);
    }

    pub(crate) fn step(&self, t: usize) -> Option<&Matrix> {
        self.steps.get(t)
    }

    pub(crate) fn step_masks(&self, t: usize) -> Option<&StepMasks> {
        self.masks.get(t)
    }

    pub fn n_steps(&self) -> usize {
        self.steps.len()
    }

    /// Assembles per-step state columns into this node's augmented output.
    pub(crate) fn collect(columns: &[Matrix]) -> Result<Matrix> {
        let views: Vec<_> = columns.iter().map(|c| c.view()).collect();
        let stacked = ndarray::concatenate(Axis(1), &views)?;
        Ok(matrix::augment(&stacked))
    }

    pub(crate) fn save<L: LinkIndex>(&self, w: &mut ChunkWriter, links: &L) -> Result<()> {
        w.write_i32(tag::INPT, links.index_of(self.input)?)?;
        w.write_i32(tag::RINP, links.index_of(self.rnn_input)?)
    }

    pub(crate) fn load(chunk: Chunk<'_>) -> Result<LoadedLayer> {
        let mut name = None;
        let mut last = None;
        let mut rin = None;
        Dispatch::new()
            .on(tag::NAME, |c| {
                name = Some(c.read_string()?);
                Ok(())
            })
            .on(tag::INPT, |c| {
                last = Some(c.read_i32()?);
                Ok(())
            })
            .on(tag::RINP, |c| {
                rin = Some(c.read_i32()?);
                Ok(())
            })
            .execute(chunk)?;
        let scope = tag::RNN_END;
        let links = vec![required(last, scope, tag::INPT)?, required(rin, scope, tag::RINP)?];
        Ok(LoadedLayer {
            // state is sized by the first forward pass
            layer: Layer::Recurrent(RecurrentLayer::new(NodeId::UNLINKED, NodeId::UNLINKED, 0)),
            name,
            links,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn standalone_forward_zeroes_state_rows() {
        let rin = RecurrentInput::new(NodeId(0), 2, 1);
        let outputs = vec![array![[1.0, 2.0], [3.0, 4.0], [1.0, 1.0]]];
        let out = rin.forward(&outputs).unwrap();
        assert_eq!(out, array![[1.0, 2.0], [3.0, 4.0], [0.0, 0.0], [1.0, 1.0]]);
    }

    #[test]
    fn step_input_splices_state() {
        let rin = RecurrentInput::new(NodeId(0), 1, 2);
        let external = array![[5.0, 6.0], [1.0, 1.0]];
        let step = rin.step_input(&external, 1, &array![[0.25], [-0.5]]).unwrap();
        assert_eq!(step, array![[6.0], [0.25], [-0.5], [1.0]]);
        assert!(rin.step_input(&external, 0, &array![[0.0]]).is_err());
    }

    #[test]
    fn capture_sums_and_withholds_gradient() {
        let mut rin = RecurrentInput::new(NodeId(3), 1, 1);
        rin.set_capture(true);
        assert!(rin.backward(&array![[1.0], [2.0]]).unwrap().is_empty());
        assert!(rin.backward(&array![[1.0], [2.0]]).unwrap().is_empty());
        assert_eq!(rin.take_captured(), Some(array![[2.0], [4.0]]));

        rin.set_capture(false);
        let routed = rin.backward(&array![[1.0], [2.0]]).unwrap();
        assert_eq!(routed, vec![(NodeId(3), array![[1.0]])]);
    }
}
