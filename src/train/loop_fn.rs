use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::info;

use crate::error::Result;
use crate::network::NetContainer;
use crate::train::iteration_stats::{IterationStats, TrainReport};
use crate::train::train_config::TrainConfig;

/// Calls [`NetContainer::iterate`] until the error drops below
/// `config.target_error` or `config.max_iterations` is reached.
///
/// Training data must already be added with `add_train_data*`.
///
/// # Early termination
/// The loop breaks early if:
/// - the `progress_tx` receiver has been dropped, **or**
/// - `config.stop_flag` is set to `true`.
///
/// # Errors
/// Propagates the first error `iterate` returns, e.g.
/// [`NetError::EmptyTrainingSet`](crate::error::NetError::EmptyTrainingSet).
pub fn train_loop(net: &mut NetContainer, config: &TrainConfig) -> Result<TrainReport> {
    let start = Instant::now();
    let mut report = TrainReport {
        iterations: 0,
        final_error: f64::NAN,
        best_error: f64::INFINITY,
        converged: false,
        interrupted: false,
    };

    for iteration in 1..=config.max_iterations {
        if stop_requested(config) {
            report.interrupted = true;
            break;
        }

        let error = net.iterate()?;
        report.iterations = iteration;
        report.final_error = error;
        if error < report.best_error {
            report.best_error = error;
        }
        report.converged = error < config.target_error;

        let due = config.report_every > 0 && iteration % config.report_every == 0;
        if due || report.converged || iteration == config.max_iterations {
            info!(iteration, error, best = report.best_error, "training progress");
            let stats = IterationStats {
                iteration,
                max_iterations: config.max_iterations,
                error,
                best_error: report.best_error,
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
            if let Some(ref tx) = config.progress_tx {
                // If the receiver has been dropped, stop training.
                if tx.send(stats).is_err() {
                    report.interrupted = true;
                    break;
                }
            }
        }

        if report.converged {
            break;
        }
    }

    info!(
        iterations = report.iterations,
        error = report.final_error,
        converged = report.converged,
        "training finished"
    );
    Ok(report)
}

fn stop_requested(config: &TrainConfig) -> bool {
    config
        .stop_flag
        .as_ref()
        .map(|flag| flag.load(Ordering::Relaxed))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{mpsc, Arc};

    use ndarray::array;

    use crate::activation::Activation;
    use crate::loss::OutputType;
    use crate::network::{Graph, Hyperparams};
    use crate::optim::TrainScheme;

    fn net() -> NetContainer {
        let mut g = Graph::with_defaults(Hyperparams {
            learn_rate: 0.05,
            keep_rate: 1.0,
            scheme: TrainScheme::Sgd,
            ..Hyperparams::default()
        });
        let x = g.input(1);
        let y = g.dense(x, 1, Activation::Linear).unwrap();
        let mut net = NetContainer::new(g, y, OutputType::MeanSquare).unwrap();
        net.add_train_data(&array![[0.0, 1.0, 2.0]], &array![[1.0, 3.0, 5.0]])
            .unwrap();
        net
    }

    #[test]
    fn stops_at_target_and_reports() {
        let mut net = net();
        let (tx, rx) = mpsc::channel();
        let mut config = TrainConfig::new(10_000, 1e-8);
        config.report_every = 50;
        config.progress_tx = Some(tx);
        let report = train_loop(&mut net, &config).unwrap();
        assert!(report.converged);
        assert!(report.iterations < 10_000);
        drop(config);
        let stats: Vec<_> = rx.iter().collect();
        let last = stats.last().unwrap();
        assert_eq!(last.iteration, report.iterations);
        assert!(last.error < 1e-8);
    }

    #[test]
    fn stop_flag_ends_the_run() {
        let mut net = net();
        let flag = Arc::new(AtomicBool::new(true));
        let mut config = TrainConfig::new(100, 0.0);
        config.stop_flag = Some(flag);
        let report = train_loop(&mut net, &config).unwrap();
        assert!(report.interrupted);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn empty_set_is_an_error() {
        let mut g = Graph::new();
        let x = g.input(1);
        let y = g.dense(x, 1, Activation::Linear).unwrap();
        let mut net = NetContainer::new(g, y, OutputType::MeanSquare).unwrap();
        assert!(train_loop(&mut net, &TrainConfig::new(5, 0.0)).is_err());
    }
}
