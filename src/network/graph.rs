//! Arena of layer nodes with memoized forward evaluation, gradient routing
//! and deferred weight updates.

use std::collections::BTreeSet;

use ndarray::s;
use tracing::debug;

use crate::activation::Activation;
use crate::error::{NetError, Result};
use crate::layers::{
    ActivationLayer, Adder, Combiner, DenseLayer, InputLayer, Layer, LoadedLayer, Multiplier,
    NodeId, RecurrentInput, RecurrentLayer,
};
use crate::layers::recurrent::StepMasks;
use crate::math::matrix::{self, Matrix};
use crate::network::config::Hyperparams;
use crate::network::dna::NetDna;
use crate::optim::TrainScheme;

/// Evaluation context threaded through one forward or backward pass.
///
/// `version` is the feed version of the pass. Recurrent layers draw further
/// versions for their timesteps with [`FeedContext::tick`]; `clock` is the
/// highest version handed out so far.
#[derive(Debug, Clone, Copy)]
pub struct FeedContext {
    version: u64,
    clock: u64,
    dropout: bool,
}

impl FeedContext {
    /// Starts a pass after everything up to `clock` has been used.
    pub fn new(clock: u64, dropout: bool) -> FeedContext {
        FeedContext {
            version: clock + 1,
            clock: clock + 1,
            dropout,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn dropout(&self) -> bool {
        self.dropout
    }

    pub(crate) fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

#[derive(Debug, Clone, Default)]
struct NodeMeta {
    name: Option<String>,
    feed_version: u64,
    consumers: usize,
    evaluations: u64,
}

/// Owns every node of a network.
///
/// Nodes are only ever appended, and a node may only link to nodes that exist
/// when it is added, so graphs built through this API are acyclic by
/// construction. Loaded graphs are checked explicitly.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    layers: Vec<Layer>,
    outputs: Vec<Matrix>,
    meta: Vec<NodeMeta>,
    defaults: Hyperparams,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn with_defaults(defaults: Hyperparams) -> Graph {
        Graph {
            defaults,
            ..Graph::default()
        }
    }

    pub fn defaults(&self) -> &Hyperparams {
        &self.defaults
    }

    /// Replaces the defaults used by layers added from now on.
    pub fn set_defaults(&mut self, defaults: Hyperparams) {
        self.defaults = defaults;
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.layers.len()).map(NodeId)
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    pub fn input(&mut self, size: usize) -> NodeId {
        let id = NodeId(self.layers.len());
        self.layers.push(Layer::Input(InputLayer::new(size)));
        self.outputs.push(matrix::augment(&Matrix::zeros((size, 0))));
        self.meta.push(NodeMeta::default());
        id
    }

    /// Dense layer using the graph's default update rule.
    pub fn dense(&mut self, input: NodeId, n_output: usize, activation: Activation) -> Result<NodeId> {
        self.dense_with(input, n_output, activation, self.defaults.scheme)
    }

    pub fn dense_with(
        &mut self,
        input: NodeId,
        n_output: usize,
        activation: Activation,
        scheme: TrainScheme,
    ) -> Result<NodeId> {
        let n_input = self.n_output(input)?;
        let layer = DenseLayer::new(
            input,
            n_input,
            n_output,
            activation,
            scheme,
            self.defaults.layer_params(),
        );
        self.push(Layer::Dense(layer))
    }

    pub fn activation(&mut self, input: NodeId, activation: Activation) -> Result<NodeId> {
        let size = self.n_output(input)?;
        self.push(Layer::Activation(ActivationLayer::new(input, size, activation)))
    }

    pub fn adder(&mut self, inputs: &[NodeId]) -> Result<NodeId> {
        let first = *inputs
            .first()
            .ok_or_else(|| NetError::format("adder without inputs"))?;
        let size = self.n_output(first)?;
        self.push(Layer::Adder(Adder::new(inputs.to_vec(), size)))
    }

    pub fn multiplier(&mut self, inputs: &[NodeId]) -> Result<NodeId> {
        if inputs.is_empty() {
            return Err(NetError::format("multiplier without inputs"));
        }
        self.push(Layer::Multiplier(Multiplier::new(inputs.to_vec())))
    }

    pub fn combiner(&mut self, inputs: &[NodeId]) -> Result<NodeId> {
        if inputs.is_empty() {
            return Err(NetError::format("combiner without inputs"));
        }
        self.push(Layer::Combiner(Combiner::new(inputs.to_vec())))
    }

    /// Entry of a recurrent loop carrying `recurrent` state rows after the
    /// features of `input`.
    pub fn recurrent_input(&mut self, input: NodeId, recurrent: usize) -> Result<NodeId> {
        let features = self.n_output(input)?;
        self.push(Layer::RecurrentInput(RecurrentInput::new(input, features, recurrent)))
    }

    /// Closes the loop opened by `rnn_input`; `last` must produce exactly the
    /// state width.
    pub fn recurrent(&mut self, last: NodeId, rnn_input: NodeId) -> Result<NodeId> {
        let recurrent = self.recurrent_input_ref(rnn_input)?.recurrent();
        self.push(Layer::Recurrent(RecurrentLayer::new(last, rnn_input, recurrent)))
    }

    /// Dense → Dense(Linear) → Adder(with `input`) → Activation, all of the
    /// input's width.
    pub fn residual_block(&mut self, input: NodeId, activation: Activation) -> Result<NodeId> {
        let width = self.n_output(input)?;
        let first = self.dense(input, width, activation)?;
        let second = self.dense(first, width, Activation::Linear)?;
        let sum = self.adder(&[second, input])?;
        self.activation(sum, activation)
    }

    fn push(&mut self, layer: Layer) -> Result<NodeId> {
        for input in layer.inputs() {
            self.check(input)?;
        }
        self.validate(&layer)?;
        let width = self.layer_width(&layer)?;
        let id = NodeId(self.layers.len());
        for input in layer.inputs() {
            self.meta[input.0].consumers += 1;
        }
        debug!(node = %id, kind = layer.kind(), width, "added node");
        self.layers.push(layer);
        self.outputs.push(matrix::augment(&Matrix::zeros((width, 0))));
        self.meta.push(NodeMeta::default());
        Ok(id)
    }

    /// Second pass of loading: resolves 1-based links into node ids and
    /// checks that the result is a well-formed graph.
    pub(crate) fn from_loaded(loaded: Vec<LoadedLayer>, defaults: Hyperparams) -> Result<Graph> {
        let len = loaded.len();
        let mut graph = Graph::with_defaults(defaults);
        for (pos, entry) in loaded.into_iter().enumerate() {
            let links = entry
                .links
                .iter()
                .map(|&link| resolve_link(link, len))
                .collect::<Result<Vec<_>>>()?;
            let mut layer = entry.layer;
            layer.set_inputs(&links)?;
            debug!(node = pos, kind = layer.kind(), ?links, "fixed inputs");
            graph.layers.push(layer);
            graph.meta.push(NodeMeta {
                name: entry.name,
                ..NodeMeta::default()
            });
        }
        for pos in 0..len {
            for input in graph.layers[pos].inputs() {
                graph.meta[input.0].consumers += 1;
            }
        }
        graph.check_acyclic()?;
        for layer in &graph.layers {
            graph.validate(layer)?;
        }
        // Declared widths come from the file, so placeholders hold no columns.
        // Recurrent state is sized by the first forward pass.
        for pos in 0..len {
            let width = graph.layer_width(&graph.layers[pos])?;
            graph.outputs.push(matrix::augment(&Matrix::zeros((width, 0))));
        }
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        const NEW: u8 = 0;
        const OPEN: u8 = 1;
        const DONE: u8 = 2;
        let mut state = vec![NEW; self.layers.len()];
        for start in 0..self.layers.len() {
            if state[start] != NEW {
                continue;
            }
            let mut stack = vec![(start, false)];
            while let Some((node, expanded)) = stack.pop() {
                if expanded {
                    state[node] = DONE;
                    continue;
                }
                if state[node] == DONE {
                    continue;
                }
                state[node] = OPEN;
                stack.push((node, true));
                for input in self.layers[node].inputs() {
                    match state[input.0] {
                        OPEN => {
                            return Err(NetError::format(format!(
                                "cycle through node {} and {input}",
                                NodeId(node)
                            )))
                        }
                        NEW => stack.push((input.0, false)),
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks that a layer's declared sizes agree with its inputs' widths.
    fn validate(&self, layer: &Layer) -> Result<()> {
        match layer {
            Layer::Input(_) => {}
            Layer::Dense(l) => {
                let found = self.n_output(l.input())?;
                if found != l.n_input() {
                    return Err(NetError::shape("dense input width", l.n_input(), found));
                }
            }
            Layer::Activation(l) => {
                let found = self.n_output(l.input())?;
                if found != l.size() {
                    return Err(NetError::shape("activation input width", l.size(), found));
                }
            }
            Layer::Adder(l) => {
                for &input in l.inputs() {
                    let found = self.n_output(input)?;
                    if found != l.size() {
                        return Err(NetError::shape("adder input width", l.size(), found));
                    }
                }
            }
            Layer::Multiplier(l) => {
                let expected = self.n_output(l.inputs()[0])?;
                for &input in &l.inputs()[1..] {
                    let found = self.n_output(input)?;
                    if found != expected {
                        return Err(NetError::shape("multiplier input width", expected, found));
                    }
                }
            }
            Layer::Combiner(_) => {}
            Layer::RecurrentInput(l) => {
                let found = self.n_output(l.input())?;
                if found != l.features() {
                    return Err(NetError::shape("recurrent input width", l.features(), found));
                }
            }
            Layer::Recurrent(l) => {
                let expected = self.recurrent_input_ref(l.rnn_input())?.recurrent();
                let found = self.n_output(l.input())?;
                if found != expected {
                    return Err(NetError::shape("recurrent state width", expected, found));
                }
            }
        }
        Ok(())
    }

    fn layer_width(&self, layer: &Layer) -> Result<usize> {
        Ok(match layer {
            Layer::Input(l) => l.size(),
            Layer::Dense(l) => l.n_output(),
            Layer::Activation(l) => l.size(),
            Layer::Adder(l) => l.size(),
            Layer::Multiplier(l) => self.n_output(l.inputs()[0])?,
            Layer::Combiner(l) => {
                let mut total = 0;
                for &input in l.inputs() {
                    total += self.n_output(input)?;
                }
                total
            }
            Layer::RecurrentInput(l) => l.size(),
            Layer::Recurrent(l) => self.n_output(l.input())?,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub(crate) fn check(&self, id: NodeId) -> Result<()> {
        if id.0 < self.layers.len() {
            Ok(())
        } else {
            Err(NetError::IndexOutOfRange {
                index: id.0,
                len: self.layers.len(),
            })
        }
    }

    /// Number of feature rows a node produces (bias excluded).
    pub fn n_output(&self, id: NodeId) -> Result<usize> {
        self.check(id)?;
        self.layer_width(&self.layers[id.0])
    }

    /// Feature rows a node reads, bias excluded.
    pub fn n_input(&self, id: NodeId) -> Result<usize> {
        match self.layer(id)? {
            Layer::Input(l) => Ok(l.size()),
            Layer::Dense(l) => Ok(l.n_input()),
            Layer::Recurrent(l) => self.n_input(l.input()),
            layer => {
                let mut total = 0;
                for input in layer.inputs() {
                    total += self.n_output(input)?;
                }
                Ok(total)
            }
        }
    }

    pub fn layer(&self, id: NodeId) -> Result<&Layer> {
        self.check(id)?;
        Ok(&self.layers[id.0])
    }

    pub fn layer_mut(&mut self, id: NodeId) -> Result<&mut Layer> {
        self.check(id)?;
        Ok(&mut self.layers[id.0])
    }

    pub fn dense_layer(&self, id: NodeId) -> Result<&DenseLayer> {
        match self.layer(id)? {
            Layer::Dense(l) => Ok(l),
            other => Err(NetError::format(format!("node {id} is {}, not dense", other.kind()))),
        }
    }

    pub fn dense_layer_mut(&mut self, id: NodeId) -> Result<&mut DenseLayer> {
        match self.layer_mut(id)? {
            Layer::Dense(l) => Ok(l),
            other => Err(NetError::format(format!("node {id} is {}, not dense", other.kind()))),
        }
    }

    fn recurrent_input_ref(&self, id: NodeId) -> Result<&RecurrentInput> {
        match self.layer(id)? {
            Layer::RecurrentInput(l) => Ok(l),
            other => Err(NetError::format(format!(
                "node {id} is {}, not a recurrent input",
                other.kind()
            ))),
        }
    }

    fn recurrent_input_mut(&mut self, id: NodeId) -> Result<&mut RecurrentInput> {
        match self.layer_mut(id)? {
            Layer::RecurrentInput(l) => Ok(l),
            other => Err(NetError::format(format!(
                "node {id} is {}, not a recurrent input",
                other.kind()
            ))),
        }
    }

    fn recurrent_mut(&mut self, id: NodeId) -> Result<&mut RecurrentLayer> {
        match self.layer_mut(id)? {
            Layer::Recurrent(l) => Ok(l),
            other => Err(NetError::format(format!("node {id} is {}, not recurrent", other.kind()))),
        }
    }

    /// Augmented output buffer of the last evaluation.
    pub fn output(&self, id: NodeId) -> Result<&Matrix> {
        self.check(id)?;
        Ok(&self.outputs[id.0])
    }

    /// Output without the bias row.
    pub fn real_output(&self, id: NodeId) -> Result<Matrix> {
        Ok(matrix::real_part(self.output(id)?))
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.meta.get(id.0).and_then(|m| m.name.as_deref())
    }

    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) -> Result<()> {
        self.check(id)?;
        self.meta[id.0].name = Some(name.into());
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.meta
            .iter()
            .position(|m| m.name.as_deref() == Some(name))
            .map(NodeId)
    }

    /// How many nodes link to `id`.
    pub fn consumers(&self, id: NodeId) -> Result<usize> {
        self.check(id)?;
        Ok(self.meta[id.0].consumers)
    }

    /// How many times `id` has recomputed its output.
    pub fn evaluations(&self, id: NodeId) -> Result<u64> {
        self.check(id)?;
        Ok(self.meta[id.0].evaluations)
    }

    pub fn feed_version(&self, id: NodeId) -> Result<u64> {
        self.check(id)?;
        Ok(self.meta[id.0].feed_version)
    }

    /// Every node reachable from `root` through input links, `root` included,
    /// in ascending id order.
    pub fn gather(&self, root: NodeId) -> Result<BTreeSet<NodeId>> {
        self.check(root)?;
        let mut seen = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.layers[id.0].inputs());
            }
        }
        Ok(seen)
    }

    pub fn dna(&self, root: NodeId) -> Result<NetDna> {
        NetDna::build(self, root)
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    fn input_layer(&self, id: NodeId) -> Result<&InputLayer> {
        match self.layer(id)? {
            Layer::Input(l) => Ok(l),
            other => Err(NetError::format(format!("node {id} is {}, not an input", other.kind()))),
        }
    }

    /// Builds the augmented buffer for raw features without touching the graph.
    pub fn make_raw_input(&self, id: NodeId, data: &Matrix) -> Result<Matrix> {
        self.input_layer(id)?.make_raw_input(data)
    }

    /// Copies raw features into an input node.
    pub fn set_input(&mut self, id: NodeId, data: &Matrix) -> Result<()> {
        let raw = self.make_raw_input(id, data)?;
        self.outputs[id.0] = raw;
        Ok(())
    }

    /// Replaces an input node's buffer with an already augmented matrix.
    pub fn set_input_raw(&mut self, id: NodeId, raw: Matrix) -> Result<()> {
        self.input_layer(id)?.check_raw(&raw)?;
        self.outputs[id.0] = raw;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Forward
    // -----------------------------------------------------------------------

    /// Brings `id` up to the context's version, evaluating stale inputs first.
    pub fn feed_forward(&mut self, id: NodeId, ctx: &mut FeedContext) -> Result<()> {
        self.check(id)?;
        let version = ctx.version();
        self.feed(id, version, ctx)
    }

    fn feed(&mut self, id: NodeId, version: u64, ctx: &mut FeedContext) -> Result<()> {
        if version <= self.meta[id.0].feed_version {
            return Ok(());
        }
        if matches!(self.layers[id.0], Layer::Recurrent(_)) {
            return self.feed_recurrent(id, version, ctx);
        }
        for input in self.layers[id.0].inputs() {
            self.feed(input, version, ctx)?;
        }
        if let Some(out) = self.layers[id.0].forward(&self.outputs, ctx.dropout())? {
            self.outputs[id.0] = out;
            self.meta[id.0].evaluations += 1;
        }
        self.meta[id.0].feed_version = version;
        Ok(())
    }

    /// Runs the loop subgraph once per batch column, carrying the state from
    /// each column to the next and from the last column into the next call.
    fn feed_recurrent(&mut self, id: NodeId, version: u64, ctx: &mut FeedContext) -> Result<()> {
        let (last, rin, external) = self.recurrent_links(id)?;
        self.feed(external, version, ctx)?;
        let ext = self.outputs[external.0].clone();
        let rows = self.recurrent_input_ref(rin)?.recurrent();

        let rec = self.recurrent_mut(id)?;
        rec.resize_state(rows);
        rec.begin_pass();
        let mut state = rec.state().clone();

        let mut columns = Vec::with_capacity(ext.ncols());
        for t in 0..ext.ncols() {
            let step = self.recurrent_input_ref(rin)?.step_input(&ext, t, &state)?;
            let step_version = ctx.tick();
            self.outputs[rin.0] = step.clone();
            self.meta[rin.0].feed_version = step_version;
            self.feed(last, step_version, ctx)?;

            state = matrix::real_part(&self.outputs[last.0]);
            if state.dim() != (rows, 1) {
                return Err(NetError::shape("recurrent state rows", rows, state.nrows()));
            }
            columns.push(state.clone());
            let masks = if ctx.dropout() {
                self.dropout_masks(last, step_version)?
            } else {
                Vec::new()
            };
            self.recurrent_mut(id)?.push_step(step, masks);
        }

        let out = if columns.is_empty() {
            matrix::augment(&Matrix::zeros((rows, 0)))
        } else {
            RecurrentLayer::collect(&columns)?
        };
        self.recurrent_mut(id)?.set_state(state);
        self.outputs[id.0] = out;
        self.meta[id.0].evaluations += 1;
        self.meta[id.0].feed_version = version;
        Ok(())
    }

    /// Masks of the Dense nodes under `root` evaluated at `version`.
    fn dropout_masks(&self, root: NodeId, version: u64) -> Result<StepMasks> {
        let mut masks = Vec::new();
        for id in self.gather(root)? {
            if self.meta[id.0].feed_version != version {
                continue;
            }
            if let Layer::Dense(dense) = &self.layers[id.0] {
                if let Some(mask) = dense.mask() {
                    masks.push((id, mask.clone()));
                }
            }
        }
        Ok(masks)
    }

    /// `(wrapped node, recurrent input, external input)` of a recurrent node.
    fn recurrent_links(&self, id: NodeId) -> Result<(NodeId, NodeId, NodeId)> {
        match self.layer(id)? {
            Layer::Recurrent(r) => {
                let external = self.recurrent_input_ref(r.rnn_input())?.input();
                Ok((r.input(), r.rnn_input(), external))
            }
            other => Err(NetError::format(format!("node {id} is {}, not recurrent", other.kind()))),
        }
    }

    // -----------------------------------------------------------------------
    // Backward
    // -----------------------------------------------------------------------

    /// Sends `grad` (feature rows × batch, `target - output` convention) into
    /// `id` and on through every path back to the inputs. Dense layers record
    /// their share for the next [`Graph::update_weights`].
    pub fn back_propagate(&mut self, id: NodeId, grad: &Matrix, ctx: &mut FeedContext) -> Result<()> {
        self.check(id)?;
        let out = &self.outputs[id.0];
        let rows = out.nrows().saturating_sub(1);
        if grad.nrows() != rows {
            return Err(NetError::shape("gradient rows", rows, grad.nrows()));
        }
        if grad.ncols() != out.ncols() {
            return Err(NetError::BatchSizeMismatch {
                expected: out.ncols(),
                found: grad.ncols(),
            });
        }
        if matches!(self.layers[id.0], Layer::Recurrent(_)) {
            return self.back_recurrent(id, grad, ctx);
        }
        let version = self.meta[id.0].feed_version;
        let routed = self.layers[id.0].backward(&self.outputs[id.0], &self.outputs, grad, version)?;
        for (target, g) in routed {
            self.back_propagate(target, &g, ctx)?;
        }
        Ok(())
    }

    /// Replays each timestep of the last pass with the dropout masks it drew
    /// and backpropagates its column.
    /// Gradients reaching the recurrent input are split: the feature part is
    /// gathered and sent to the external input once, the state part stops
    /// there.
    fn back_recurrent(&mut self, id: NodeId, grad: &Matrix, ctx: &mut FeedContext) -> Result<()> {
        let (last, rin, external) = self.recurrent_links(id)?;
        let steps = self.recurrent_mut(id)?.n_steps();
        if grad.ncols() != steps {
            return Err(NetError::BatchSizeMismatch {
                expected: steps,
                found: grad.ncols(),
            });
        }
        let features = self.recurrent_input_ref(rin)?.features();
        let mut ext_grad = Matrix::zeros((features, steps));

        self.recurrent_input_mut(rin)?.set_capture(true);
        let replay = self.replay_steps(id, last, rin, grad, &mut ext_grad, ctx);
        self.recurrent_input_mut(rin)?.set_capture(false);
        self.for_each_dense(last, |d| {
            d.unpin_mask();
            Ok(())
        })?;
        replay?;

        self.back_propagate(external, &ext_grad, ctx)
    }

    fn replay_steps(
        &mut self,
        id: NodeId,
        last: NodeId,
        rin: NodeId,
        grad: &Matrix,
        ext_grad: &mut Matrix,
        ctx: &mut FeedContext,
    ) -> Result<()> {
        let features = ext_grad.nrows();
        for t in 0..ext_grad.ncols() {
            let step = match &self.layers[id.0] {
                Layer::Recurrent(r) => r.step(t).cloned(),
                _ => None,
            }
            .ok_or_else(|| NetError::format(format!("recurrent step {t} was not recorded")))?;
            let masks = match &self.layers[id.0] {
                Layer::Recurrent(r) => r.step_masks(t).cloned().unwrap_or_default(),
                _ => Vec::new(),
            };
            for (node, mask) in masks {
                self.dense_layer_mut(node)?.pin_mask(mask);
            }
            let step_version = ctx.tick();
            self.outputs[rin.0] = step;
            self.meta[rin.0].feed_version = step_version;
            self.feed(last, step_version, ctx)?;

            let column = grad.slice(s![.., t..t + 1]).to_owned();
            self.back_propagate(last, &column, ctx)?;
            if let Some(captured) = self.recurrent_input_mut(rin)?.take_captured() {
                ext_grad
                    .slice_mut(s![.., t..t + 1])
                    .assign(&captured.slice(s![..features, ..]));
            }
        }
        Ok(())
    }

    /// [`Graph::back_propagate`] as one unit: when it fails, every pending
    /// gradient reachable from `id` is dropped so no partial pass is applied.
    pub fn backward_pass(&mut self, id: NodeId, grad: &Matrix, ctx: &mut FeedContext) -> Result<()> {
        let result = self.back_propagate(id, grad, ctx);
        if result.is_err() {
            self.clear_gradients(id)?;
        }
        result
    }

    // -----------------------------------------------------------------------
    // Updates and graph-wide setters
    // -----------------------------------------------------------------------

    fn for_each_dense(&mut self, root: NodeId, mut f: impl FnMut(&mut DenseLayer) -> Result<()>) -> Result<()> {
        for id in self.gather(root)? {
            if let Layer::Dense(dense) = &mut self.layers[id.0] {
                f(dense)?;
            }
        }
        Ok(())
    }

    /// Applies pending gradients of every Dense layer reachable from `root`,
    /// each exactly once.
    pub fn update_weights(&mut self, root: NodeId) -> Result<()> {
        self.for_each_dense(root, |d| d.update_weights())
    }

    pub fn clear_gradients(&mut self, root: NodeId) -> Result<()> {
        self.for_each_dense(root, |d| {
            d.clear_gradients();
            Ok(())
        })
    }

    pub fn set_learn_rate(&mut self, root: NodeId, rate: f64) -> Result<()> {
        self.for_each_dense(root, |d| {
            d.set_learn_rate(rate);
            Ok(())
        })
    }

    pub fn set_momentum(&mut self, root: NodeId, beta: f64) -> Result<()> {
        self.for_each_dense(root, |d| {
            d.set_momentum(beta);
            Ok(())
        })
    }

    pub fn set_rms_prop(&mut self, root: NodeId, beta: f64) -> Result<()> {
        self.for_each_dense(root, |d| {
            d.set_rms_prop(beta);
            Ok(())
        })
    }

    pub fn reset_momentum(&mut self, root: NodeId) -> Result<()> {
        self.for_each_dense(root, |d| {
            d.reset_momentum();
            Ok(())
        })
    }

    /// Zeroes the hidden state of every recurrent layer reachable from `root`.
    pub fn reset_rnn(&mut self, root: NodeId) -> Result<()> {
        for id in self.gather(root)? {
            if let Layer::Recurrent(r) = &mut self.layers[id.0] {
                r.reset();
            }
        }
        Ok(())
    }
}

pub(crate) fn resolve_link(link: i32, len: usize) -> Result<NodeId> {
    match usize::try_from(link) {
        Ok(index) if (1..=len).contains(&index) => Ok(NodeId(index - 1)),
        Ok(index) => Err(NetError::IndexOutOfRange { index, len }),
        Err(_) => Err(NetError::IndexOutOfRange { index: 0, len }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn linear_params() -> Hyperparams {
        Hyperparams {
            learn_rate: 0.1,
            keep_rate: 1.0,
            scheme: TrainScheme::Sgd,
            ..Hyperparams::default()
        }
    }

    #[test]
    fn shared_node_is_evaluated_once_per_version() {
        let mut g = Graph::with_defaults(linear_params());
        let x = g.input(2);
        let hidden = g.dense(x, 3, Activation::Tanh).unwrap();
        let sum = g.adder(&[hidden, hidden]).unwrap();
        let prod = g.multiplier(&[hidden, sum]).unwrap();
        let top = g.combiner(&[sum, prod]).unwrap();
        assert_eq!(g.consumers(hidden).unwrap(), 3);

        g.set_input(x, &array![[0.5], [-0.5]]).unwrap();
        let mut ctx = FeedContext::new(0, false);
        g.feed_forward(top, &mut ctx).unwrap();
        g.feed_forward(top, &mut ctx).unwrap();
        assert_eq!(g.evaluations(hidden).unwrap(), 1);
        assert_eq!(g.evaluations(top).unwrap(), 1);
        assert_eq!(g.n_output(top).unwrap(), 6);

        let mut next = FeedContext::new(ctx.clock(), false);
        g.feed_forward(top, &mut next).unwrap();
        assert_eq!(g.evaluations(hidden).unwrap(), 2);
    }

    #[test]
    fn forward_is_deterministic_without_dropout() {
        let mut g = Graph::new();
        let x = g.input(3);
        let h = g.dense(x, 4, Activation::ReLU).unwrap();
        let y = g.dense(h, 2, Activation::Sigmoid).unwrap();
        g.set_input(x, &array![[1.0, 0.0], [0.5, 0.2], [-1.0, 0.3]]).unwrap();

        let mut a = FeedContext::new(0, false);
        g.feed_forward(y, &mut a).unwrap();
        let first = g.real_output(y).unwrap();
        let mut b = FeedContext::new(a.clock(), false);
        g.feed_forward(y, &mut b).unwrap();
        assert_eq!(first, g.real_output(y).unwrap());
        assert_eq!(g.output(y).unwrap().row(2), array![1.0, 1.0]);
    }

    #[test]
    fn diamond_gradient_updates_once() {
        let mut g = Graph::with_defaults(linear_params());
        let x = g.input(1);
        let d = g.dense(x, 1, Activation::Linear).unwrap();
        let sum = g.adder(&[d, d]).unwrap();
        g.dense_layer_mut(d).unwrap().weights_mut().assign(&array![[1.0, 0.0]]);

        g.set_input(x, &array![[1.0]]).unwrap();
        let mut ctx = FeedContext::new(0, false);
        g.feed_forward(sum, &mut ctx).unwrap();
        g.back_propagate(sum, &array![[1.0]], &mut ctx).unwrap();
        // both paths land in one pending entry
        assert_eq!(g.dense_layer(d).unwrap().weight_gradient().unwrap(), array![[2.0, 2.0]]);

        g.update_weights(sum).unwrap();
        assert_eq!(g.dense_layer(d).unwrap().weights(), &array![[1.2, 0.2]]);
        g.update_weights(sum).unwrap();
        assert_eq!(g.dense_layer(d).unwrap().weights(), &array![[1.2, 0.2]]);
    }

    #[test]
    fn builders_reject_bad_links_and_widths() {
        let mut g = Graph::new();
        let a = g.input(2);
        let b = g.input(3);
        assert!(matches!(
            g.dense(NodeId(7), 2, Activation::ReLU),
            Err(NetError::IndexOutOfRange { index: 7, len: 2 })
        ));
        assert!(matches!(g.adder(&[a, b]), Err(NetError::ShapeMismatch { .. })));
        assert!(matches!(g.multiplier(&[a, b]), Err(NetError::ShapeMismatch { .. })));
        assert!(g.combiner(&[a, b]).is_ok());
        let rin = g.recurrent_input(a, 4).unwrap();
        let body = g.dense(rin, 3, Activation::Tanh).unwrap();
        assert!(matches!(g.recurrent(body, rin), Err(NetError::ShapeMismatch { .. })));
        assert!(g.recurrent(body, a).is_err());
    }

    #[test]
    fn recurrent_carries_state_across_columns_and_calls() {
        let mut g = Graph::with_defaults(linear_params());
        let x = g.input(1);
        let rin = g.recurrent_input(x, 1).unwrap();
        let body = g.dense(rin, 1, Activation::Linear).unwrap();
        let rnn = g.recurrent(body, rin).unwrap();
        // s' = x + s
        g.dense_layer_mut(body).unwrap().weights_mut().assign(&array![[1.0, 1.0, 0.0]]);

        g.set_input(x, &array![[1.0, 2.0, 3.0]]).unwrap();
        let mut ctx = FeedContext::new(0, false);
        g.feed_forward(rnn, &mut ctx).unwrap();
        assert_eq!(g.real_output(rnn).unwrap(), array![[1.0, 3.0, 6.0]]);

        g.set_input(x, &array![[1.0]]).unwrap();
        let mut next = FeedContext::new(ctx.clock(), false);
        g.feed_forward(rnn, &mut next).unwrap();
        assert_eq!(g.real_output(rnn).unwrap(), array![[7.0]]);

        g.reset_rnn(rnn).unwrap();
        let mut again = FeedContext::new(next.clock(), false);
        g.feed_forward(rnn, &mut again).unwrap();
        assert_eq!(g.real_output(rnn).unwrap(), array![[1.0]]);
    }

    #[test]
    fn recurrent_backward_records_one_entry_per_step() {
        let mut g = Graph::with_defaults(linear_params());
        let x = g.input(1);
        let pre = g.dense(x, 1, Activation::Linear).unwrap();
        let rin = g.recurrent_input(pre, 1).unwrap();
        let body = g.dense(rin, 1, Activation::Linear).unwrap();
        let rnn = g.recurrent(body, rin).unwrap();
        g.dense_layer_mut(pre).unwrap().weights_mut().assign(&array![[1.0, 0.0]]);
        g.dense_layer_mut(body).unwrap().weights_mut().assign(&array![[2.0, 0.5, 0.0]]);

        g.set_input(x, &array![[1.0, 1.0]]).unwrap();
        let mut ctx = FeedContext::new(0, false);
        g.feed_forward(rnn, &mut ctx).unwrap();
        g.back_propagate(rnn, &array![[1.0, 1.0]], &mut ctx).unwrap();

        // body saw [1, 0, 1] then [1, 2, 1]
        assert_eq!(
            g.dense_layer(body).unwrap().weight_gradient().unwrap(),
            array![[2.0, 2.0, 2.0]]
        );
        // each column's feature gradient is 2 (the body's input weight)
        assert_eq!(
            g.dense_layer(pre).unwrap().weight_gradient().unwrap(),
            array![[4.0, 4.0]]
        );
    }

    #[test]
    fn gather_and_dna_cover_reachable_dense_layers() {
        let mut g = Graph::new();
        let x = g.input(2);
        let a = g.dense(x, 3, Activation::ReLU).unwrap();
        let _unused = g.dense(x, 5, Activation::ReLU).unwrap();
        let b = g.dense(a, 1, Activation::Linear).unwrap();
        let nodes: Vec<_> = g.gather(b).unwrap().into_iter().collect();
        assert_eq!(nodes, vec![x, a, b]);

        let dna = g.dna(b).unwrap();
        assert_eq!(dna.len(), 3 * 3 + 4);
        let mut data = dna.get_data(&g).unwrap();
        data.iter_mut().for_each(|v| *v = 0.25);
        dna.set_data(&mut g, &data).unwrap();
        assert!(g.dense_layer(b).unwrap().weights().iter().all(|&v| v == 0.25));
        assert!(matches!(
            dna.set_data(&mut g, &data[1..]),
            Err(NetError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn residual_block_keeps_width() {
        let mut g = Graph::new();
        let x = g.input(4);
        let out = g.residual_block(x, Activation::ReLU).unwrap();
        assert_eq!(g.n_output(out).unwrap(), 4);
        assert_eq!(g.consumers(x).unwrap(), 2);
        assert_eq!(g.gather(out).unwrap().len(), 5);
    }

    #[test]
    fn names_are_searchable() {
        let mut g = Graph::new();
        let x = g.input(1);
        g.set_name(x, "features").unwrap();
        assert_eq!(g.find("features"), Some(x));
        assert_eq!(g.name(x), Some("features"));
        assert_eq!(g.find("missing"), None);
    }

    #[test]
    fn link_resolution_is_bounded() {
        assert_eq!(resolve_link(1, 3).unwrap(), NodeId(0));
        assert_eq!(resolve_link(3, 3).unwrap(), NodeId(2));
        assert!(matches!(resolve_link(0, 3), Err(NetError::IndexOutOfRange { index: 0, len: 3 })));
        assert!(matches!(resolve_link(4, 3), Err(NetError::IndexOutOfRange { index: 4, len: 3 })));
        assert!(matches!(resolve_link(-2, 3), Err(NetError::IndexOutOfRange { .. })));
    }

    #[test]
    fn gradient_must_match_the_output_shape() {
        let mut g = Graph::with_defaults(linear_params());
        let a = g.input(2);
        let b = g.input(2);
        let m = g.multiplier(&[a, b]).unwrap();
        g.set_input(a, &Matrix::ones((2, 4))).unwrap();
        g.set_input(b, &Matrix::ones((2, 4))).unwrap();
        let mut ctx = FeedContext::new(0, false);
        g.feed_forward(m, &mut ctx).unwrap();

        assert!(matches!(
            g.back_propagate(m, &Matrix::zeros((3, 4)), &mut ctx),
            Err(NetError::ShapeMismatch { expected: 2, found: 3, .. })
        ));
        assert!(matches!(
            g.back_propagate(m, &Matrix::zeros((2, 3)), &mut ctx),
            Err(NetError::BatchSizeMismatch { expected: 4, found: 3 })
        ));
        assert!(g.back_propagate(m, &Matrix::zeros((2, 4)), &mut ctx).is_ok());
    }

    #[test]
    fn failed_backward_pass_leaves_no_pending_gradient() {
        let mut g = Graph::with_defaults(linear_params());
        let x = g.input(1);
        let d = g.dense(x, 1, Activation::Linear).unwrap();
        let e = g.dense(x, 1, Activation::Linear).unwrap();
        let sum = g.adder(&[d, e]).unwrap();
        g.set_input(x, &array![[1.0, 2.0]]).unwrap();
        let mut ctx = FeedContext::new(0, false);
        g.feed_forward(sum, &mut ctx).unwrap();
        let before = g.dense_layer(d).unwrap().weights().clone();

        // d records its share before e's stale buffer is reached
        g.outputs[e.0] = matrix::augment(&Matrix::zeros((1, 5)));
        assert!(g.backward_pass(sum, &array![[1.0, 1.0]], &mut ctx).is_err());
        assert!(!g.dense_layer(d).unwrap().has_pending());
        assert!(!g.dense_layer(e).unwrap().has_pending());

        g.update_weights(sum).unwrap();
        assert_eq!(g.dense_layer(d).unwrap().weights(), &before);
    }

    #[test]
    fn recurrent_replay_reuses_forward_dropout_masks() {
        let mut g = Graph::with_defaults(Hyperparams {
            keep_rate: 0.5,
            ..linear_params()
        });
        let x = g.input(1);
        let rin = g.recurrent_input(x, 8).unwrap();
        let body = g.dense(rin, 8, Activation::Linear).unwrap();
        let rnn = g.recurrent(body, rin).unwrap();
        g.dense_layer_mut(body).unwrap().weights_mut().assign(&Matrix::ones((8, 10)));

        g.set_input(x, &array![[1.0]]).unwrap();
        let mut ctx = FeedContext::new(0, true);
        g.feed_forward(rnn, &mut ctx).unwrap();
        let out = g.real_output(rnn).unwrap();
        g.back_propagate(rnn, &Matrix::ones((8, 1)), &mut ctx).unwrap();

        let grad = g.dense_layer(body).unwrap().weight_gradient().unwrap();
        for row in 0..8 {
            let dropped = out[[row, 0]] == 0.0;
            let silent = grad.row(row).iter().all(|&v| v == 0.0);
            assert_eq!(dropped, silent, "row {row}: output {}, gradient {}", out[[row, 0]], grad.row(row));
        }

        // masks do not outlive the replay
        let mut plain = FeedContext::new(ctx.clock(), false);
        g.reset_rnn(rnn).unwrap();
        g.feed_forward(rnn, &mut plain).unwrap();
        assert!(g.real_output(rnn).unwrap().iter().all(|&v| v == 2.0));
    }
}
