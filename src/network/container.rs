use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::layers::{Layer, NodeId};
use crate::loss::{Checkpoint, OutputLayer, OutputType};
use crate::math::matrix::{self, Matrix};
use crate::network::config::Hyperparams;
use crate::network::dna::NetDna;
use crate::network::graph::{FeedContext, Graph};
use crate::network::persist;
use crate::train::batches::TrainingSet;

/// Caller-facing wrapper around a [`Graph`] and its loss node.
///
/// Owns the evaluation clock, the dropout switch, the checkpoint and the
/// accumulated training set. Every operation runs to completion before it
/// returns.
///
/// Methods come in two flavours: plain ones take raw feature rows and append
/// the bias row themselves, `*_raw` ones take inputs already augmented (see
/// [`NetContainer::make_raw_input`]) so prepared data can be reused without
/// copying.
#[derive(Debug, Clone)]
pub struct NetContainer {
    graph: Graph,
    output: OutputLayer,
    inputs: Vec<NodeId>,
    clock: u64,
    dropout: bool,
    training: TrainingSet,
}

impl NetContainer {
    /// Wraps `graph` with a loss of `kind` on top of `last`. The network's
    /// inputs are the input nodes reachable from `last`, in id order.
    pub fn new(graph: Graph, last: NodeId, kind: OutputType) -> Result<NetContainer> {
        NetContainer::from_parts(graph, OutputLayer::new(last, kind))
    }

    fn from_parts(graph: Graph, output: OutputLayer) -> Result<NetContainer> {
        let inputs: Vec<NodeId> = graph
            .gather(output.last())?
            .into_iter()
            .filter(|&id| matches!(graph.layer(id), Ok(Layer::Input(_))))
            .collect();
        if inputs.is_empty() {
            return Err(NetError::format("network has no input layer"));
        }
        info!(
            nodes = graph.len(),
            inputs = inputs.len(),
            output = ?output.kind(),
            "network ready"
        );
        Ok(NetContainer {
            graph,
            output,
            inputs,
            clock: 0,
            dropout: false,
            training: TrainingSet::new(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<NetContainer> {
        NetContainer::load_with(path, Hyperparams::default())
    }

    /// Loads a saved network; `defaults` seed layers added to the graph later.
    pub fn load_with(path: impl AsRef<Path>, defaults: Hyperparams) -> Result<NetContainer> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        info!(path = %path.display(), bytes = data.len(), "loading network");
        NetContainer::from_bytes_with(&data, defaults)
    }

    pub fn from_bytes(data: &[u8]) -> Result<NetContainer> {
        NetContainer::from_bytes_with(data, Hyperparams::default())
    }

    pub fn from_bytes_with(data: &[u8], defaults: Hyperparams) -> Result<NetContainer> {
        let (graph, output) = persist::load_graph(data, defaults)?;
        NetContainer::from_parts(graph, output)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = self.to_bytes()?;
        std::fs::write(path, &data)?;
        info!(path = %path.display(), bytes = data.len(), "saved network");
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        persist::save_graph(&self.graph, &self.output)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn output_layer(&self) -> &OutputLayer {
        &self.output
    }

    pub fn last(&self) -> NodeId {
        self.output.last()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Highest feed version used so far.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Error recorded by the last train or error call.
    pub fn last_error(&self) -> f64 {
        self.output.error()
    }

    /// Enables dropout for training passes. Plain evaluation never drops.
    pub fn set_dropout(&mut self, enabled: bool) {
        self.dropout = enabled;
    }

    pub fn dropout(&self) -> bool {
        self.dropout
    }

    // -----------------------------------------------------------------------
    // Input staging
    // -----------------------------------------------------------------------

    fn single_input(&self) -> Result<NodeId> {
        match self.inputs.as_slice() {
            [only] => Ok(*only),
            many => Err(NetError::shape("input matrices", many.len(), 1)),
        }
    }

    /// Appends the bias row to raw features for the (single) input.
    pub fn make_raw_input(&self, data: &Matrix) -> Result<Matrix> {
        self.graph.make_raw_input(self.single_input()?, data)
    }

    /// One raw buffer per network input, in input order.
    pub fn make_raw_inputs(&self, data: &[Matrix]) -> Result<Vec<Matrix>> {
        if data.len() != self.inputs.len() {
            return Err(NetError::shape("input matrices", self.inputs.len(), data.len()));
        }
        self.inputs
            .iter()
            .zip(data)
            .map(|(&id, m)| self.graph.make_raw_input(id, m))
            .collect()
    }

    /// Builds a raw input from column-major samples.
    pub fn make_raw_input_vec(&self, data: &[f64]) -> Result<Matrix> {
        let id = self.single_input()?;
        let rows = self.graph.n_output(id)?;
        self.graph.make_raw_input(id, &matrix::from_columns(data, rows)?)
    }

    /// Shapes column-major values into a target matrix for the output width.
    pub fn from_vector(&self, data: &[f64]) -> Result<Matrix> {
        matrix::from_columns(data, self.graph.n_output(self.last())?)
    }

    fn stage(&mut self, raw: Vec<Matrix>) -> Result<()> {
        if raw.len() != self.inputs.len() {
            return Err(NetError::shape("input matrices", self.inputs.len(), raw.len()));
        }
        let batch = raw[0].ncols();
        if let Some(bad) = raw.iter().find(|m| m.ncols() != batch) {
            return Err(NetError::BatchSizeMismatch {
                expected: batch,
                found: bad.ncols(),
            });
        }
        for (&id, m) in self.inputs.iter().zip(raw) {
            self.graph.set_input_raw(id, m)?;
        }
        Ok(())
    }

    fn forward(&mut self, training: bool) -> Result<FeedContext> {
        let mut ctx = FeedContext::new(self.clock, training && self.dropout);
        let last = self.last();
        let result = self.graph.feed_forward(last, &mut ctx);
        self.clock = ctx.clock();
        result?;
        let logits = self.graph.real_output(last)?;
        self.output.set_output(&logits, ctx.version());
        Ok(ctx)
    }

    // -----------------------------------------------------------------------
    // Process
    // -----------------------------------------------------------------------

    pub fn process(&mut self, input: &Matrix) -> Result<Matrix> {
        let raw = self.make_raw_input(input)?;
        self.process_raw(raw)
    }

    pub fn process_many(&mut self, inputs: &[Matrix]) -> Result<Matrix> {
        let raw = self.make_raw_inputs(inputs)?;
        self.process_raw_many(raw)
    }

    pub fn process_raw(&mut self, raw: Matrix) -> Result<Matrix> {
        self.process_raw_many(vec![raw])
    }

    pub fn process_raw_many(&mut self, raw: Vec<Matrix>) -> Result<Matrix> {
        self.stage(raw)?;
        self.forward(false)?;
        Ok(self.output.output().clone())
    }

    /// Column-major samples in, column-major predictions out.
    pub fn process_vec(&mut self, data: &[f64]) -> Result<Vec<f64>> {
        let raw = self.make_raw_input_vec(data)?;
        Ok(matrix::to_columns(&self.process_raw(raw)?))
    }

    // -----------------------------------------------------------------------
    // Error
    // -----------------------------------------------------------------------

    pub fn error(&mut self, input: &Matrix, target: &Matrix) -> Result<f64> {
        let raw = self.make_raw_input(input)?;
        self.error_raw(raw, target)
    }

    pub fn error_many(&mut self, inputs: &[Matrix], target: &Matrix) -> Result<f64> {
        let raw = self.make_raw_inputs(inputs)?;
        self.error_raw_many(raw, target)
    }

    pub fn error_raw(&mut self, raw: Matrix, target: &Matrix) -> Result<f64> {
        self.error_raw_many(vec![raw], target)
    }

    pub fn error_raw_many(&mut self, raw: Vec<Matrix>, target: &Matrix) -> Result<f64> {
        self.stage(raw)?;
        self.forward(false)?;
        self.output.compute_error(target)
    }

    // -----------------------------------------------------------------------
    // Train
    // -----------------------------------------------------------------------

    /// Forward, loss, backward and one weight update. Returns the loss
    /// measured before the update.
    pub fn train(&mut self, input: &Matrix, target: &Matrix) -> Result<f64> {
        let raw = self.make_raw_input(input)?;
        self.train_raw(raw, target)
    }

    pub fn train_many(&mut self, inputs: &[Matrix], target: &Matrix) -> Result<f64> {
        let raw = self.make_raw_inputs(inputs)?;
        self.train_raw_many(raw, target)
    }

    pub fn train_raw(&mut self, raw: Matrix, target: &Matrix) -> Result<f64> {
        self.train_raw_many(vec![raw], target)
    }

    pub fn train_raw_many(&mut self, raw: Vec<Matrix>, target: &Matrix) -> Result<f64> {
        let error = self.accumulate_raw_many(raw, target)?;
        self.apply_updates()?;
        Ok(error)
    }

    /// Forward, loss and backward without touching the weights. Gradients
    /// pile up in the Dense layers until [`NetContainer::apply_updates`].
    pub fn accumulate(&mut self, input: &Matrix, target: &Matrix) -> Result<f64> {
        let raw = self.make_raw_input(input)?;
        self.accumulate_raw_many(vec![raw], target)
    }

    pub fn accumulate_raw_many(&mut self, raw: Vec<Matrix>, target: &Matrix) -> Result<f64> {
        self.stage(raw)?;
        let mut ctx = self.forward(true)?;
        let error = self.output.compute_error(target)?;
        if !error.is_finite() {
            warn!(error, clock = self.clock, "non-finite training error");
        }
        let grad = self.output.gradient(target)?;
        let result = self.graph.backward_pass(self.last(), &grad, &mut ctx);
        self.clock = ctx.clock();
        result?;
        Ok(error)
    }

    pub fn apply_updates(&mut self) -> Result<()> {
        let last = self.last();
        self.graph.update_weights(last)
    }

    // -----------------------------------------------------------------------
    // Batched training set
    // -----------------------------------------------------------------------

    pub fn add_train_data(&mut self, input: &Matrix, target: &Matrix) -> Result<()> {
        let raw = self.make_raw_input(input)?;
        self.add_train_data_raw_many(vec![raw], target.clone())
    }

    pub fn add_train_data_many(&mut self, inputs: &[Matrix], target: &Matrix) -> Result<()> {
        let raw = self.make_raw_inputs(inputs)?;
        self.add_train_data_raw_many(raw, target.clone())
    }

    pub fn add_train_data_raw(&mut self, raw: Matrix, target: Matrix) -> Result<()> {
        self.add_train_data_raw_many(vec![raw], target)
    }

    pub fn add_train_data_raw_many(&mut self, raw: Vec<Matrix>, target: Matrix) -> Result<()> {
        if raw.len() != self.inputs.len() {
            return Err(NetError::shape("input matrices", self.inputs.len(), raw.len()));
        }
        for (&id, m) in self.inputs.iter().zip(&raw) {
            let expected = self.graph.n_output(id)? + 1;
            if m.nrows() != expected {
                return Err(NetError::shape("raw input rows", expected, m.nrows()));
            }
        }
        self.training.add_raw(raw, target)?;
        debug!(examples = self.training.len(), "training data added");
        Ok(())
    }

    /// Examples per [`NetContainer::iterate`] call; `0` uses all of them.
    pub fn set_batch_size(&mut self, size: usize) {
        self.training.set_batch_size(size);
    }

    pub fn training_set(&self) -> &TrainingSet {
        &self.training
    }

    /// Trains on the next batch of the accumulated training set.
    pub fn iterate(&mut self) -> Result<f64> {
        let (inputs, target) = self.training.next_batch()?;
        self.train_raw_many(inputs, &target)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// The flat view of every weight the network trains.
    pub fn dna(&self) -> Result<NetDna> {
        self.graph.dna(self.last())
    }

    fn cached_dna(&mut self) -> Result<NetDna> {
        if let Some(dna) = self.output.dna() {
            return Ok(dna.clone());
        }
        let dna = self.dna()?;
        self.output.set_dna(dna.clone());
        Ok(dna)
    }

    /// Snapshots the weights and the last error.
    pub fn save_checkpoint(&mut self) -> Result<()> {
        let dna = self.cached_dna()?;
        let weights = dna.get_data(&self.graph)?;
        let error = self.output.error();
        debug!(params = weights.len(), error, "checkpoint saved");
        self.output.store_checkpoint(Checkpoint { weights, error });
        Ok(())
    }

    /// Restores the last snapshot and returns its error. Without a snapshot
    /// nothing changes and the current error is returned.
    pub fn load_checkpoint(&mut self) -> Result<f64> {
        let Some(checkpoint) = self.output.checkpoint().cloned() else {
            warn!("no checkpoint to restore");
            return Ok(self.output.error());
        };
        let dna = self.cached_dna()?;
        dna.set_data(&mut self.graph, &checkpoint.weights)?;
        self.output.restore_error(checkpoint.error);
        debug!(error = checkpoint.error, "checkpoint restored");
        Ok(checkpoint.error)
    }

    /// Writes the current weights into `out` and returns the last error.
    pub fn save_checkpoint_into(&mut self, out: &mut Vec<f64>) -> Result<f64> {
        let dna = self.cached_dna()?;
        *out = dna.get_data(&self.graph)?;
        Ok(self.output.error())
    }

    /// Overwrites the weights from a flat vector and records `error`.
    pub fn load_checkpoint_from(&mut self, weights: &[f64], error: f64) -> Result<()> {
        let dna = self.cached_dna()?;
        dna.set_data(&mut self.graph, weights)?;
        self.output.restore_error(error);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Graph-wide setters
    // -----------------------------------------------------------------------

    pub fn set_learn_rate(&mut self, rate: f64) -> Result<()> {
        let last = self.last();
        self.graph.set_learn_rate(last, rate)
    }

    pub fn set_momentum(&mut self, beta: f64) -> Result<()> {
        let last = self.last();
        self.graph.set_momentum(last, beta)
    }

    pub fn set_rms_prop(&mut self, beta: f64) -> Result<()> {
        let last = self.last();
        self.graph.set_rms_prop(last, beta)
    }

    pub fn reset_momentum(&mut self) -> Result<()> {
        let last = self.last();
        self.graph.reset_momentum(last)
    }

    pub fn reset_rnn(&mut self) -> Result<()> {
        let last = self.last();
        self.graph.reset_rnn(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::optim::TrainScheme;
    use ndarray::array;

    fn sgd() -> Hyperparams {
        Hyperparams {
            learn_rate: 0.05,
            keep_rate: 1.0,
            scheme: TrainScheme::Sgd,
            ..Hyperparams::default()
        }
    }

    fn regression() -> NetContainer {
        let mut g = Graph::with_defaults(sgd());
        let x = g.input(2);
        let y = g.dense(x, 1, Activation::Linear).unwrap();
        NetContainer::new(g, y, OutputType::MeanSquare).unwrap()
    }

    #[test]
    fn training_lowers_the_error() {
        let mut net = regression();
        let x = array![[0.0, 1.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0]];
        let t = array![[1.0, 3.0, 0.0, 2.0]];
        let before = net.error(&x, &t).unwrap();
        for _ in 0..500 {
            net.train(&x, &t).unwrap();
        }
        let after = net.error(&x, &t).unwrap();
        assert!(after < before);
        assert!(after < 1e-3);
    }

    #[test]
    fn inputs_are_checked() {
        let mut net = regression();
        assert!(matches!(
            net.process(&array![[1.0], [2.0], [3.0]]),
            Err(NetError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            net.train(&array![[1.0, 2.0], [0.0, 0.0]], &array![[1.0]]),
            Err(NetError::BatchSizeMismatch { expected: 2, found: 1 })
        ));
        assert!(net.process_many(&[array![[1.0], [2.0]], array![[1.0], [2.0]]]).is_err());
    }

    #[test]
    fn multi_input_batches_must_agree() {
        let mut g = Graph::with_defaults(sgd());
        let a = g.input(1);
        let b = g.input(1);
        let both = g.combiner(&[a, b]).unwrap();
        let y = g.dense(both, 1, Activation::Linear).unwrap();
        let mut net = NetContainer::new(g, y, OutputType::MeanSquare).unwrap();
        assert_eq!(net.inputs(), &[a, b]);
        assert!(matches!(
            net.process_many(&[array![[1.0, 2.0]], array![[1.0]]]),
            Err(NetError::BatchSizeMismatch { expected: 2, found: 1 })
        ));
        assert_eq!(net.process_many(&[array![[1.0, 2.0]], array![[1.0, 0.0]]]).unwrap().ncols(), 2);
    }

    #[test]
    fn vectors_are_column_major() {
        let mut net = regression();
        let last = net.last();
        net.graph_mut()
            .dense_layer_mut(last)
            .unwrap()
            .weights_mut()
            .assign(&array![[1.0, 10.0, 0.5]]);
        let out = net.process_vec(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(out, vec![21.5, 43.5]);
        assert_eq!(net.from_vector(&[1.0, 2.0]).unwrap(), array![[1.0, 2.0]]);
        assert!(net.make_raw_input_vec(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn iterate_trains_on_the_accumulated_set() {
        let mut net = regression();
        assert!(matches!(net.iterate(), Err(NetError::EmptyTrainingSet)));
        net.add_train_data(&array![[0.0, 1.0], [1.0, 0.0]], &array![[1.0, 2.0]]).unwrap();
        net.add_train_data(&array![[1.0], [1.0]], &array![[3.0]]).unwrap();
        net.set_batch_size(2);
        assert_eq!(net.training_set().len(), 3);
        let mut last = f64::MAX;
        for _ in 0..2000 {
            last = net.iterate().unwrap();
        }
        assert!(last < 1e-2);
    }

    #[test]
    fn accumulate_defers_the_update() {
        let mut net = regression();
        let x = array![[1.0], [1.0]];
        let t = array![[5.0]];
        let before = net.graph().dense_layer(net.last()).unwrap().weights().clone();
        net.accumulate(&x, &t).unwrap();
        net.accumulate(&x, &t).unwrap();
        assert_eq!(net.graph().dense_layer(net.last()).unwrap().weights(), &before);
        net.apply_updates().unwrap();
        assert_ne!(net.graph().dense_layer(net.last()).unwrap().weights(), &before);
    }
}
