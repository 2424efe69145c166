use crate::activation::Activation;
use crate::error::{NetError, Result};
use crate::layers::{Layer, LinkIndex, LoadedLayer, NodeId};
use crate::math::matrix::{self, Matrix};
use crate::serial::{required, tag, Chunk, ChunkWriter, Dispatch};

/// Applies an activation element-wise to another node's output.
#[derive(Debug, Clone)]
pub struct ActivationLayer {
    input: NodeId,
    activation: Activation,
    size: usize,
}

impl ActivationLayer {
    pub fn new(input: NodeId, size: usize, activation: Activation) -> ActivationLayer {
        ActivationLayer {
            input,
            activation,
            size,
        }
    }

    pub fn input(&self) -> NodeId {
        self.input
    }

    pub(crate) fn set_input(&mut self, input: NodeId) {
        self.input = input;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub(crate) fn forward(&self, outputs: &[Matrix]) -> Result<Matrix> {
        let inp = &outputs[self.input.0];
        if inp.nrows() != self.size + 1 {
            return Err(NetError::shape("activation input rows", self.size + 1, inp.nrows()));
        }
        let mut out = inp.mapv(|x| self.activation.function(x));
        matrix::fix_bias_row(&mut out);
        Ok(out)
    }

    /// `own` is this node's augmented output; the derivative is taken from it.
    pub(crate) fn backward(&self, own: &Matrix, grad: &Matrix) -> Result<Vec<(NodeId, Matrix)>> {
        let y = matrix::real_view(own);
        if y.dim() != grad.dim() {
            return Err(NetError::shape("activation gradient rows", y.nrows(), grad.nrows()));
        }
        let prop = grad * &y.mapv(|v| self.activation.derivative(v));
        Ok(vec![(self.input, prop)])
    }

    pub(crate) fn save<L: LinkIndex>(&self, w: &mut ChunkWriter, links: &L) -> Result<()> {
        w.write_i32(tag::OUTC, self.size as i32)?;
        w.write_i32(tag::ACTV, self.activation.code())?;
        w.write_i32(tag::INPT, links.index_of(self.input)?)
    }

    pub(crate) fn load(chunk: Chunk<'_>) -> Result<LoadedLayer> {
        let mut name = None;
        let mut size = None;
        let mut act = None;
        let mut prev = None;
        Dispatch::new()
            .on(tag::NAME, |c| {
                name = Some(c.read_string()?);
                Ok(())
            })
            .on(tag::OUTC, |c| {
                size = Some(c.read_usize()?);
                Ok(())
            })
            .on(tag::ACTV, |c| {
                act = Some(Activation::from_code(c.read_i32()?)?);
                Ok(())
            })
            .on(tag::INPT, |c| {
                prev = Some(c.read_i32()?);
                Ok(())
            })
            .execute(chunk)?;
        let scope = tag::ACTV;
        let layer = ActivationLayer::new(
            NodeId::UNLINKED,
            required(size, scope, tag::OUTC)?,
            required(act, scope, tag::ACTV)?,
        );
        Ok(LoadedLayer {
            layer: Layer::Activation(layer),
            name,
            links: vec![required(prev, scope, tag::INPT)?],
        })
    }
}
