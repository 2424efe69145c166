//! Layer kinds of the graph.
//!
//! Nodes live in one arena owned by [`Graph`](crate::network::Graph) and refer
//! to each other by [`NodeId`]. Every kind computes its forward pass from the
//! arena's output buffers and hands gradients back as `(target, gradient)`
//! pairs for the graph to route, so no layer ever holds a reference to
//! another.

pub mod activation_layer;
pub mod adder;
pub mod combiner;
pub mod dense;
pub mod input;
pub mod multiplier;
pub mod recurrent;

use std::fmt;

use crate::error::{NetError, Result};
use crate::math::Matrix;
use crate::serial::{Chunk, ChunkWriter, Tag};
use crate::serial::tag;

pub use activation_layer::ActivationLayer;
pub use adder::Adder;
pub use combiner::Combiner;
pub use dense::DenseLayer;
pub use input::InputLayer;
pub use multiplier::Multiplier;
pub use recurrent::{RecurrentInput, RecurrentLayer};

/// Position of a node in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Link of a layer read from a file whose references are not resolved yet.
    pub(crate) const UNLINKED: NodeId = NodeId(usize::MAX);

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Input(InputLayer),
    Dense(DenseLayer),
    Activation(ActivationLayer),
    Adder(Adder),
    Multiplier(Multiplier),
    Combiner(Combiner),
    RecurrentInput(RecurrentInput),
    Recurrent(RecurrentLayer),
}

/// A layer read from a file, with its links still as 1-based save indices.
#[derive(Debug)]
pub struct LoadedLayer {
    pub layer: Layer,
    pub name: Option<String>,
    pub links: Vec<i32>,
}

/// Serializes a node reference as its 1-based position in the save order.
pub trait LinkIndex {
    fn index_of(&self, id: NodeId) -> Result<i32>;
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Input(_) => "input",
            Layer::Dense(_) => "dense",
            Layer::Activation(_) => "activation",
            Layer::Adder(_) => "adder",
            Layer::Multiplier(_) => "multiplier",
            Layer::Combiner(_) => "combiner",
            Layer::RecurrentInput(_) => "recurrent-input",
            Layer::Recurrent(_) => "recurrent",
        }
    }

    /// Nodes this one reads from, in the order they are saved.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Layer::Input(_) => Vec::new(),
            Layer::Dense(l) => vec![l.input()],
            Layer::Activation(l) => vec![l.input()],
            Layer::Adder(l) => l.inputs().to_vec(),
            Layer::Multiplier(l) => l.inputs().to_vec(),
            Layer::Combiner(l) => l.inputs().to_vec(),
            Layer::RecurrentInput(l) => vec![l.input()],
            Layer::Recurrent(l) => vec![l.input(), l.rnn_input()],
        }
    }

    /// Replaces every link, in the order `inputs` reports them.
    pub(crate) fn set_inputs(&mut self, links: &[NodeId]) -> Result<()> {
        let expected = match self {
            Layer::Input(_) => 0,
            Layer::Dense(_) | Layer::Activation(_) | Layer::RecurrentInput(_) => 1,
            Layer::Recurrent(_) => 2,
            Layer::Adder(_) | Layer::Multiplier(_) | Layer::Combiner(_) => {
                if links.is_empty() {
                    return Err(NetError::format(format!("{} without inputs", self.kind())));
                }
                links.len()
            }
        };
        if links.len() != expected {
            return Err(NetError::format(format!(
                "{} expects {expected} link(s), found {}",
                self.kind(),
                links.len()
            )));
        }
        match self {
            Layer::Input(_) => {}
            Layer::Dense(l) => l.set_input(links[0]),
            Layer::Activation(l) => l.set_input(links[0]),
            Layer::Adder(l) => l.set_inputs(links.to_vec()),
            Layer::Multiplier(l) => l.set_inputs(links.to_vec()),
            Layer::Combiner(l) => l.set_inputs(links.to_vec()),
            Layer::RecurrentInput(l) => l.set_input(links[0]),
            Layer::Recurrent(l) => l.set_links(links[0], links[1]),
        }
        Ok(())
    }

    /// Computes a fresh augmented output from the arena's buffers.
    ///
    /// Returns `None` for kinds whose buffer is written from outside (inputs)
    /// or by the graph itself (recurrent).
    pub(crate) fn forward(&mut self, outputs: &[Matrix], dropout: bool) -> Result<Option<Matrix>> {
        Ok(match self {
            Layer::Input(_) | Layer::Recurrent(_) => None,
            Layer::Dense(l) => Some(l.forward(outputs, dropout)?),
            Layer::Activation(l) => Some(l.forward(outputs)?),
            Layer::Adder(l) => Some(l.forward(outputs)?),
            Layer::Multiplier(l) => Some(l.forward(outputs)?),
            Layer::Combiner(l) => Some(l.forward(outputs)?),
            Layer::RecurrentInput(l) => Some(l.forward(outputs)?),
        })
    }

    /// Turns the gradient w.r.t. this node's (de-augmented) output into
    /// gradients for its inputs.
    pub(crate) fn backward(
        &mut self,
        own: &Matrix,
        outputs: &[Matrix],
        grad: &Matrix,
        version: u64,
    ) -> Result<Vec<(NodeId, Matrix)>> {
        match self {
            Layer::Input(_) | Layer::Recurrent(_) => Ok(Vec::new()),
            Layer::Dense(l) => l.backward(outputs, grad, version),
            Layer::Activation(l) => l.backward(own, grad),
            Layer::Adder(l) => l.backward(grad),
            Layer::Multiplier(l) => l.backward(outputs, grad),
            Layer::Combiner(l) => l.backward(outputs, grad),
            Layer::RecurrentInput(l) => l.backward(grad),
        }
    }

    pub(crate) fn save<L: LinkIndex>(&self, w: &mut ChunkWriter, name: Option<&str>, links: &L) -> Result<()> {
        w.begin(self.tag());
        if let Some(name) = name {
            w.write_str(tag::NAME, name)?;
        }
        match self {
            Layer::Input(l) => l.save(w)?,
            Layer::Dense(l) => l.save(w, links)?,
            Layer::Activation(l) => l.save(w, links)?,
            Layer::Adder(l) => l.save(w, links)?,
            Layer::Multiplier(l) => l.save(w, links)?,
            Layer::Combiner(l) => l.save(w, links)?,
            Layer::RecurrentInput(l) => l.save(w, links)?,
            Layer::Recurrent(l) => l.save(w, links)?,
        }
        w.end()
    }

    /// Reads one layer chunk of any kind.
    pub(crate) fn load(chunk: Chunk<'_>) -> Result<LoadedLayer> {
        match chunk.tag() {
            t if t == tag::INPT => InputLayer::load(chunk),
            t if t == tag::DENS => DenseLayer::load(chunk),
            t if t == tag::ACTV => ActivationLayer::load(chunk),
            t if t == tag::ADDR => Adder::load(chunk),
            t if t == tag::MULP => Multiplier::load(chunk),
            t if t == tag::CMBN => Combiner::load(chunk),
            t if t == tag::RNN_START => RecurrentInput::load(chunk),
            t if t == tag::RNN_END => RecurrentLayer::load(chunk),
            other => Err(NetError::format(format!("unknown layer kind {other}"))),
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            Layer::Input(_) => tag::INPT,
            Layer::Dense(_) => tag::DENS,
            Layer::Activation(_) => tag::ACTV,
            Layer::Adder(_) => tag::ADDR,
            Layer::Multiplier(_) => tag::MULP,
            Layer::Combiner(_) => tag::CMBN,
            Layer::RecurrentInput(_) => tag::RNN_START,
            Layer::Recurrent(_) => tag::RNN_END,
        }
    }
}

/// Checks that every buffer in `ids` shares one batch width and returns it.
pub(crate) fn common_batch(outputs: &[Matrix], ids: &[NodeId]) -> Result<usize> {
    let mut batch = None;
    for id in ids {
        let cols = outputs[id.0].ncols();
        match batch {
            None => batch = Some(cols),
            Some(expected) if expected != cols => {
                return Err(NetError::BatchSizeMismatch { expected, found: cols });
            }
            Some(_) => {}
        }
    }
    batch.ok_or_else(|| NetError::format("layer without inputs"))
}
