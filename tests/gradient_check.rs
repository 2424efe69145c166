//! Compares the gradients collected by back-propagation with central
//! differences of the loss.
//!
//! The loss divides by the batch width and the recorded gradient points
//! downhill (`target - output`), so for every weight
//! `weight_gradient ≈ -batch · ∂loss/∂w`.
//!
//! Recurrent state is zeroed before every evaluation. Backward through a
//! recurrent layer stops at the previous state, so the recurrent cases use a
//! single column, where that truncation is exact.

use ferrite_graph::{Activation, Graph, Hyperparams, Matrix, NetContainer, OutputType, TrainScheme};
use ndarray::{array, Array2};

const STEP: f64 = 1e-6;

fn params() -> Hyperparams {
    Hyperparams {
        keep_rate: 1.0,
        scheme: TrainScheme::Sgd,
        ..Hyperparams::default()
    }
}

fn check(mut net: NetContainer, input: &Matrix, target: &Matrix) {
    let batch = input.ncols() as f64;
    net.reset_rnn().unwrap();
    net.accumulate(input, target).unwrap();

    let dna = net.dna().unwrap();
    let mut analytic = Vec::with_capacity(dna.len());
    for slot in dna.slots() {
        let grad = net
            .graph()
            .dense_layer(slot.node)
            .unwrap()
            .weight_gradient()
            .expect("every dense layer saw a gradient");
        analytic.extend(grad.iter().copied());
    }
    assert_eq!(analytic.len(), dna.len());

    let base = dna.get_data(net.graph()).unwrap();
    for (i, &a) in analytic.iter().enumerate() {
        let mut nudged = base.clone();
        nudged[i] = base[i] + STEP;
        dna.set_data(net.graph_mut(), &nudged).unwrap();
        net.reset_rnn().unwrap();
        let up = net.error(input, target).unwrap();
        nudged[i] = base[i] - STEP;
        dna.set_data(net.graph_mut(), &nudged).unwrap();
        net.reset_rnn().unwrap();
        let down = net.error(input, target).unwrap();

        let numeric = -batch * (up - down) / (2.0 * STEP);
        let scale = a.abs().max(numeric.abs()).max(1e-3);
        assert!(
            (a - numeric).abs() / scale < 1e-3,
            "weight {i}: analytic {a}, numeric {numeric}"
        );
    }
    dna.set_data(net.graph_mut(), &base).unwrap();
}

fn batch() -> (Array2<f64>, Array2<f64>) {
    let input = array![[0.5, -1.0, 0.25], [1.5, 0.3, -0.7]];
    let target = array![[1.0, 0.0, 0.0], [0.0, 1.0, 1.0]];
    (input, target)
}

#[test]
fn two_linear_layers() {
    let mut g = Graph::with_defaults(params());
    let x = g.input(2);
    let h = g.dense(x, 3, Activation::Linear).unwrap();
    let y = g.dense(h, 2, Activation::Linear).unwrap();
    let (input, target) = batch();
    check(NetContainer::new(g, y, OutputType::MeanSquare).unwrap(), &input, &target);
}

#[test]
fn saturating_activations() {
    let mut g = Graph::with_defaults(params());
    let x = g.input(2);
    let h = g.dense(x, 4, Activation::Tanh).unwrap();
    let s = g.dense(h, 3, Activation::Sigmoid).unwrap();
    let y = g.dense(s, 2, Activation::TanhBias).unwrap();
    let (input, target) = batch();
    check(NetContainer::new(g, y, OutputType::MeanSquare).unwrap(), &input, &target);
}

#[test]
fn shared_nodes_through_every_combinator() {
    let mut g = Graph::with_defaults(params());
    let x = g.input(2);
    let a = g.dense(x, 3, Activation::Tanh).unwrap();
    let b = g.dense(x, 3, Activation::Sigmoid).unwrap();
    let product = g.multiplier(&[a, b]).unwrap();
    let sum = g.adder(&[product, a]).unwrap();
    let squashed = g.activation(sum, Activation::Tanh).unwrap();
    let joined = g.combiner(&[squashed, b]).unwrap();
    let y = g.dense(joined, 2, Activation::Linear).unwrap();
    let (input, target) = batch();
    check(NetContainer::new(g, y, OutputType::MeanSquare).unwrap(), &input, &target);
}

#[test]
fn softmax_with_one_hot_targets() {
    let mut g = Graph::with_defaults(params());
    let x = g.input(2);
    let h = g.dense(x, 4, Activation::Tanh).unwrap();
    let y = g.dense(h, 2, Activation::Linear).unwrap();
    let (input, target) = batch();
    check(NetContainer::new(g, y, OutputType::StableSoftMax).unwrap(), &input, &target);
}

fn step() -> (Array2<f64>, Array2<f64>) {
    (array![[0.5], [-1.0]], array![[1.0], [0.0]])
}

#[test]
fn recurrent_loop_body() {
    let mut g = Graph::with_defaults(params());
    let x = g.input(2);
    let rin = g.recurrent_input(x, 3).unwrap();
    let h = g.dense(rin, 3, Activation::Tanh).unwrap();
    let r = g.recurrent(h, rin).unwrap();
    let y = g.dense(r, 2, Activation::Linear).unwrap();
    let (input, target) = step();
    check(NetContainer::new(g, y, OutputType::MeanSquare).unwrap(), &input, &target);
}

#[test]
fn recurrent_output_used_twice() {
    let mut g = Graph::with_defaults(params());
    let x = g.input(2);
    let pre = g.dense(x, 2, Activation::Sigmoid).unwrap();
    let rin = g.recurrent_input(pre, 3).unwrap();
    let h = g.dense(rin, 3, Activation::Tanh).unwrap();
    let r = g.recurrent(h, rin).unwrap();
    let sum = g.adder(&[r, r]).unwrap();
    let y = g.dense(sum, 2, Activation::Linear).unwrap();
    let (input, target) = step();
    check(NetContainer::new(g, y, OutputType::MeanSquare).unwrap(), &input, &target);
}
