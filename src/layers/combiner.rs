use ndarray::s;

use crate::error::{NetError, Result};
use crate::layers::{common_batch, Layer, LinkIndex, LoadedLayer, NodeId};
use crate::math::matrix::{self, Matrix};
use crate::serial::{required, tag, Chunk, ChunkWriter, Dispatch};

/// Stacks the real parts of its inputs into one taller output.
#[derive(Debug, Clone)]
pub struct Combiner {
    inputs: Vec<NodeId>,
}

impl Combiner {
    pub fn new(inputs: Vec<NodeId>) -> Combiner {
        Combiner { inputs }
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub(crate) fn set_inputs(&mut self, inputs: Vec<NodeId>) {
        self.inputs = inputs;
    }

    pub(crate) fn forward(&self, outputs: &[Matrix]) -> Result<Matrix> {
        let batch = common_batch(outputs, &self.inputs)?;
        let bias = matrix::ones(1, batch);
        let mut parts: Vec<_> = self
            .inputs
            .iter()
            .map(|id| matrix::real_view(&outputs[id.0]))
            .collect();
        parts.push(bias.view());
        matrix::vstack(&parts)
    }

    /// Splits the gradient into row bands, one per input, in input order.
    pub(crate) fn backward(&self, outputs: &[Matrix], grad: &Matrix) -> Result<Vec<(NodeId, Matrix)>> {
        let total: usize = self
            .inputs
            .iter()
            .map(|id| outputs[id.0].nrows().saturating_sub(1))
            .sum();
        if grad.nrows() != total {
            return Err(NetError::shape("combiner gradient rows", total, grad.nrows()));
        }
        let mut start = 0;
        let mut routed = Vec::with_capacity(self.inputs.len());
        for &id in &self.inputs {
            let rows = outputs[id.0].nrows() - 1;
            routed.push((id, grad.slice(s![start..start + rows, ..]).to_owned()));
            start += rows;
        }
        Ok(routed)
    }

    pub(crate) fn save<L: LinkIndex>(&self, w: &mut ChunkWriter, links: &L) -> Result<()> {
        let indices = self
            .inputs
            .iter()
            .map(|&id| links.index_of(id))
            .collect::<Result<Vec<_>>>()?;
        w.write_i32s(tag::LYRS, &indices)
    }

    pub(crate) fn load(chunk: Chunk<'_>) -> Result<LoadedLayer> {
        let mut name = None;
        let mut links = None;
        Dispatch::new()
            .on(tag::NAME, |c| {
                name = Some(c.read_string()?);
                Ok(())
            })
            .on(tag::LYRS, |c| {
                links = Some(c.read_i32s()?);
                Ok(())
            })
            .execute(chunk)?;
        Ok(LoadedLayer {
            layer: Layer::Combiner(Combiner::new(Vec::new())),
            name,
            links: required(links, tag::CMBN, tag::LYRS)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn stacks_real_parts_and_splits_gradient() {
        let comb = Combiner::new(vec![NodeId(0), NodeId(1)]);
        let outputs = vec![
            array![[1.0, 2.0], [1.0, 1.0]],
            array![[3.0, 4.0], [5.0, 6.0], [1.0, 1.0]],
        ];
        let out = comb.forward(&outputs).unwrap();
        assert_eq!(
            out,
            array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [1.0, 1.0]]
        );

        let grad = array![[0.1, 0.2], [0.3, 0.4], [0.5, 0.6]];
        let routed = comb.backward(&outputs, &grad).unwrap();
        assert_eq!(routed[0], (NodeId(0), array![[0.1, 0.2]]));
        assert_eq!(routed[1], (NodeId(1), array![[0.3, 0.4], [0.5, 0.6]]));
    }
}
