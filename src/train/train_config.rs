use std::sync::mpsc;
use std::sync::{atomic::AtomicBool, Arc};

use crate::train::iteration_stats::IterationStats;

/// Configuration for a `train_loop` run.
///
/// # Fields
/// - `max_iterations`: upper bound on `iterate` calls
/// - `target_error`: the loop stops once an iteration's error drops below it
/// - `report_every`: one `IterationStats` is sent every this many
///   iterations (and for the final one); `0` disables reports
/// - `progress_tx`: optional channel sender for the reports. If the
///   receiver is dropped the loop terminates early.
/// - `stop_flag`: optional atomic flag; when set to `true` from another
///   thread the loop terminates after the current iteration.
pub struct TrainConfig {
    pub max_iterations: usize,
    pub target_error: f64,
    pub report_every: usize,
    pub progress_tx: Option<mpsc::Sender<IterationStats>>,
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl TrainConfig {
    /// Creates a minimal `TrainConfig` with no progress channel and no stop flag.
    pub fn new(max_iterations: usize, target_error: f64) -> Self {
        TrainConfig {
            max_iterations,
            target_error,
            report_every: 100,
            progress_tx: None,
            stop_flag: None,
        }
    }
}
