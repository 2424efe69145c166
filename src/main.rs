// Thin inspection tool; all network logic lives in the library.
//
//   ferrite-graph <network-file> [v1,v2,...]
//
// Prints one line per node of a saved network and, when values are given,
// runs them through the network (column-major, one sample per input width).
use std::process::ExitCode;

use ferrite_graph::{NetContainer, Result};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: ferrite-graph <network-file> [v1,v2,...]");
        return ExitCode::from(2);
    };
    match run(&path, args.next()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(path: &str, values: Option<String>) -> Result<()> {
    let mut net = NetContainer::load(path)?;
    let graph = net.graph();
    for id in graph.node_ids() {
        let layer = graph.layer(id)?;
        let inputs: Vec<String> = layer.inputs().iter().map(|i| i.to_string()).collect();
        println!(
            "{id:>4}  {:<16} {:>5} out  <- [{}]  {}",
            layer.kind(),
            graph.n_output(id)?,
            inputs.join(", "),
            graph.name(id).unwrap_or("")
        );
    }
    println!("output: {:?} on {}", net.output_layer().kind(), net.last());

    if let Some(values) = values {
        let data = values
            .split(',')
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .map_err(|_| ferrite_graph::NetError::Format(format!("not a number: {v}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let out = net.process_vec(&data)?;
        println!("{out:?}");
    }
    Ok(())
}
