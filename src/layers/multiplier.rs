use crate::error::{NetError, Result};
use crate::layers::{common_batch, Layer, LinkIndex, LoadedLayer, NodeId};
use crate::math::matrix::{self, Matrix};
use crate::serial::{required, tag, Chunk, ChunkWriter, Dispatch};

/// Element-wise (Hadamard) product of equally sized inputs.
#[derive(Debug, Clone)]
pub struct Multiplier {
    inputs: Vec<NodeId>,
}

impl Multiplier {
    pub fn new(inputs: Vec<NodeId>) -> Multiplier {
        Multiplier { inputs }
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub(crate) fn set_inputs(&mut self, inputs: Vec<NodeId>) {
        self.inputs = inputs;
    }

    fn check_rows(&self, outputs: &[Matrix]) -> Result<usize> {
        let rows = outputs[self.inputs[0].0].nrows();
        for id in &self.inputs[1..] {
            let found = outputs[id.0].nrows();
            if found != rows {
                return Err(NetError::shape("multiplier input rows", rows, found));
            }
        }
        Ok(rows)
    }

    pub(crate) fn forward(&self, outputs: &[Matrix]) -> Result<Matrix> {
        common_batch(outputs, &self.inputs)?;
        self.check_rows(outputs)?;
        let mut product = outputs[self.inputs[0].0].clone();
        for id in &self.inputs[1..] {
            product *= &outputs[id.0];
        }
        // the bias rows are all ones, so the product keeps its bias row intact
        Ok(product)
    }

    /// Product rule: each input receives the gradient times every other
    /// input's real part.
    pub(crate) fn backward(&self, outputs: &[Matrix], grad: &Matrix) -> Result<Vec<(NodeId, Matrix)>> {
        let mut routed = Vec::with_capacity(self.inputs.len());
        for (i, &id) in self.inputs.iter().enumerate() {
            let mut g = grad.clone();
            for (j, other) in self.inputs.iter().enumerate() {
                if i != j {
                    g *= &matrix::real_view(&outputs[other.0]);
                }
            }
            routed.push((id, g));
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
            layer: Layer::Multiplier(Multiplier::new(Vec::new())),
            name,
            links: required(links, tag::MULP, tag::LYRS)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn product_and_its_gradient() {
        let mul = Multiplier::new(vec![NodeId(0), NodeId(1)]);
        let outputs = vec![array![[2.0], [3.0], [1.0]], array![[5.0], [-1.0], [1.0]]];
        let out = mul.forward(&outputs).unwrap();
        assert_eq!(out, array![[10.0], [-3.0], [1.0]]);

        let routed = mul.backward(&outputs, &array![[1.0], [2.0]]).unwrap();
        assert_eq!(routed[0], (NodeId(0), array![[5.0], [-2.0]]));
        assert_eq!(routed[1], (NodeId(1), array![[2.0], [6.0]]));
    }

    #[test]
    fn unequal_widths_are_rejected() {
        let mul = Multiplier::new(vec![NodeId(0), NodeId(1)]);
        let outputs = vec![array![[2.0], [1.0]], array![[5.0], [1.0], [1.0]]];
        assert!(matches!(mul.forward(&outputs), Err(NetError::ShapeMismatch { .. })));
    }
}
