use ferrite_graph::{Activation, Graph, Hyperparams, NetContainer, OutputType, TrainScheme};
use ndarray::array;

fn main() -> ferrite_graph::Result<()> {
    let mut graph = Graph::with_defaults(Hyperparams {
        learn_rate: 0.01,
        momentum: 0.9,
        keep_rate: 1.0,
        scheme: TrainScheme::Momentum,
        ..Hyperparams::default()
    });
    let x = graph.input(2);
    let h1 = graph.dense(x, 10, Activation::ReLU)?;
    let h2 = graph.dense(h1, 10, Activation::ReLU)?;
    let out = graph.dense(h2, 2, Activation::ReLU)?;
    let mut net = NetContainer::new(graph, out, OutputType::MeanSquare)?;

    // One sample per column.
    let inputs = array![[1.0, 0.0, 1.0, 0.0], [0.0, 1.0, 1.0, 0.0]];
    let targets = array![[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 1.0, 0.0]];
    net.add_train_data(&inputs, &targets)?;

    let epochs = 20_000;
    for epoch in 0..epochs {
        let loss = net.iterate()?;
        if epoch % 1000 == 0 {
            println!("Epoch {epoch}: loss = {loss:.6}");
        }
        if loss < 1e-6 {
            println!("Epoch {epoch}: loss = {loss:.6} (converged)");
            break;
        }
    }

    let output = net.process(&inputs)?;
    for (input, prediction) in inputs.columns().into_iter().zip(output.columns()) {
        println!("Input: {:?} -> Output: {:.4?}", input.to_vec(), prediction.to_vec());
    }
    Ok(())
}
