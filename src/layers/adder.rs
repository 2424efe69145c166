use crate::error::{NetError, Result};
use crate::layers::{common_batch, Layer, LinkIndex, LoadedLayer, NodeId};
use crate::math::matrix::{self, Matrix};
use crate::serial::{required, tag, Chunk, ChunkWriter, Dispatch};

/// Element-wise sum of equally sized inputs.
#[derive(Debug, Clone)]
pub struct Adder {
    inputs: Vec<NodeId>,
    size: usize,
}

impl Adder {
    pub fn new(inputs: Vec<NodeId>, size: usize) -> Adder {
        Adder { inputs, size }
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub(crate) fn set_inputs(&mut self, inputs: Vec<NodeId>) {
        self.inputs = inputs;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn forward(&self, outputs: &[Matrix]) -> Result<Matrix> {
        let batch = common_batch(outputs, &self.inputs)?;
        let mut sum = Matrix::zeros((self.size + 1, batch));
        for id in &self.inputs {
            let part = &outputs[id.0];
            if part.nrows() != self.size + 1 {
                return Err(NetError::shape("adder input rows", self.size + 1, part.nrows()));
            }
            sum += part;
        }
        matrix::fix_bias_row(&mut sum);
        Ok(sum)
    }

    pub(crate) fn backward(&self, grad: &Matrix) -> Result<Vec<(NodeId, Matrix)>> {
        Ok(self.inputs.iter().map(|&id| (id, grad.clone())).collect())
    }

    pub(crate) fn save<L: LinkIndex>(&self, w: &mut ChunkWriter, links: &L) -> Result<()> {
        w.write_i32(tag::INPC, self.size as i32)?;
        let indices = self
            .inputs
            .iter()
            .map(|&id| links.index_of(id))
            .collect::<Result<Vec<_>>>()?;
        w.write_i32s(tag::LYRS, &indices)
    }

    pub(crate) fn load(chunk: Chunk<'_>) -> Result<LoadedLayer> {
        let mut name = None;
        let mut size = None;
        let mut links = None;
        Dispatch::new()
            .on(tag::NAME, |c| {
                name = Some(c.read_string()?);
                Ok(())
            })
            .on(tag::INPC, |c| {
                size = Some(c.read_usize()?);
                Ok(())
            })
            .on(tag::LYRS, |c| {
                links = Some(c.read_i32s()?);
                Ok(())
            })
            .execute(chunk)?;
        let adder = Adder::new(Vec::new(), required(size, tag::ADDR, tag::INPC)?);
        Ok(LoadedLayer {
            layer: Layer::Adder(adder),
            name,
            links: required(links, tag::ADDR, tag::LYRS)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn sums_inputs_and_restores_bias() {
        let adder = Adder::new(vec![NodeId(0), NodeId(1)], 2);
        let outputs = vec![
            array![[1.0, 2.0], [3.0, 4.0], [1.0, 1.0]],
            array![[0.5, 0.5], [-3.0, 1.0], [1.0, 1.0]],
        ];
        let out = adder.forward(&outputs).unwrap();
        assert_eq!(out, array![[1.5, 2.5], [0.0, 5.0], [1.0, 1.0]]);

        let routed = adder.backward(&array![[1.0, 1.0], [2.0, 2.0]]).unwrap();
        assert_eq!(routed.len(), 2);
        assert!(routed.iter().all(|(_, g)| g == &array![[1.0, 1.0], [2.0, 2.0]]));
    }

    #[test]
    fn differing_batches_are_rejected() {
        let adder = Adder::new(vec![NodeId(0), NodeId(1)], 1);
        let outputs = vec![array![[1.0], [1.0]], array![[1.0, 2.0], [1.0, 1.0]]];
        assert!(matches!(
            adder.forward(&outputs),
            Err(NetError::BatchSizeMismatch { expected: 1, found: 2 })
        ));
    }
}
