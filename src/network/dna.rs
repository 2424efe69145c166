use crate::error::{NetError, Result};
use crate::layers::{Layer, NodeId};
use crate::network::graph::Graph;

/// One Dense weight matrix inside the flat parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightSlot {
    pub node: NodeId,
    pub offset: usize,
    pub count: usize,
}

/// Maps every trainable weight buffer reachable from a node onto one
/// contiguous parameter vector.
///
/// Slots follow ascending node order and each buffer is laid out row-major.
/// Used for checkpoints and by optimizers that treat the network as a black
/// box over a flat vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetDna {
    slots: Vec<WeightSlot>,
    size: usize,
}

impl NetDna {
    pub(crate) fn build(graph: &Graph, root: NodeId) -> Result<NetDna> {
        let mut dna = NetDna::default();
        for id in graph.gather(root)? {
            if let Layer::Dense(dense) = graph.layer(id)? {
                let count = dense.weights().len();
                dna.slots.push(WeightSlot {
                    node: id,
                    offset: dna.size,
                    count,
                });
                dna.size += count;
            }
        }
        Ok(dna)
    }

    /// Total number of parameters.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn slots(&self) -> &[WeightSlot] {
        &self.slots
    }

    pub fn get_data(&self, graph: &Graph) -> Result<Vec<f64>> {
        let mut data = Vec::with_capacity(self.size);
        for slot in &self.slots {
            data.extend(graph.dense_layer(slot.node)?.weights().iter().copied());
        }
        Ok(data)
    }

    pub fn set_data(&self, graph: &mut Graph, data: &[f64]) -> Result<()> {
        if data.len() != self.size {
            return Err(NetError::shape("dna vector", self.size, data.len()));
        }
        for slot in &self.slots {
            let weights = graph.dense_layer_mut(slot.node)?.weights_mut();
            if weights.len() != slot.count {
                return Err(NetError::shape("dna slot", slot.count, weights.len()));
            }
            let values = &data[slot.offset..slot.offset + slot.count];
            for (w, &v) in weights.iter_mut().zip(values) {
                *w = v;
            }
        }
        Ok(())
    }
}
