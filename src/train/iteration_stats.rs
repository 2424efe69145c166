use serde::{Deserialize, Serialize};

/// Progress report emitted by `train_loop`.
///
/// When a `progress_tx` channel is configured in `TrainConfig`, the loop sends
/// one `IterationStats` every `report_every` iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationStats {
    /// 1-based iteration number.
    pub iteration: usize,
    /// Iteration budget of this run.
    pub max_iterations: usize,
    /// Error of the batch trained in this iteration.
    pub error: f64,
    /// Lowest error seen so far in this run.
    pub best_error: f64,
    /// Wall-clock time since the run started, in milliseconds.
    pub elapsed_ms: u64,
}

/// Outcome of a whole `train_loop` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub iterations: usize,
    pub final_error: f64,
    pub best_error: f64,
    /// The error dropped below the target.
    pub converged: bool,
    /// The stop flag or a dropped receiver ended the run.
    pub interrupted: bool,
}
