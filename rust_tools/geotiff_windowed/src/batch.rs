//! Run one single-raster operation over many inputs on a bounded worker pool.

use crate::error::{RasterError, Result};
use log::{debug, error, info};
use std::any::Any;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchJobResult {
    pub input_path: PathBuf,
    /// Position of the input in the submitted list.
    pub submission_index: usize,
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Outcome of one dispatch; `results` are in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub results: Vec<BatchJobResult>,
    pub successful: usize,
    pub failed: usize,
    pub total_time: Duration,
}

impl BatchReport {
    pub fn result_for(&self, submission_index: usize) -> Option<&BatchJobResult> {
        self.results
            .iter()
            .find(|result| result.submission_index == submission_index)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchJobResult> {
        self.results.iter().filter(|result| !result.success)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

pub struct ParallelBatchDispatcher {
    config: BatchConfig,
}

impl ParallelBatchDispatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Apply `operation(input, output_dir, params)` to every input.
    ///
    /// Each job opens its own handles inside `operation`. A failing or
    /// panicking job is recorded in the report and never stops its siblings;
    /// only pool setup and output directory creation return `Err`.
    pub fn run<I, P, F>(&self, inputs: &[I], output_dir: &Path, operation: F, params: &P) -> Result<BatchReport>
    where
        I: AsRef<Path> + Sync,
        P: Sync + ?Sized,
        F: Fn(&Path, &Path, &P) -> Result<PathBuf> + Sync,
    {
        if self.config.max_workers == 0 {
            return Err(RasterError::invalid("max_workers", "must be at least 1"));
        }
        let start = Instant::now();
        fs::create_dir_all(output_dir)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers)
            .thread_name(|i| format!("batch-worker-{}", i))
            .build()
            .map_err(|e| RasterError::WorkerPool(e.to_string()))?;

        info!(
            "Dispatching {} inputs to {} workers, output to {}",
            inputs.len(),
            self.config.max_workers,
            output_dir.display()
        );

        let (sender, receiver) = mpsc::channel();
        let operation = &operation;
        pool.scope(|scope| {
            for (submission_index, input) in inputs.iter().enumerate() {
                let sender = sender.clone();
                scope.spawn(move |_| {
                    let input_path = input.as_ref();
                    let job_start = Instant::now();
                    let outcome = catch_unwind(AssertUnwindSafe(|| operation(input_path, output_dir, params)))
                        .unwrap_or_else(|payload| Err(RasterError::WorkerPool(panic_message(payload))));
                    let elapsed = job_start.elapsed();

                    let result = match outcome {
                        Ok(output_path) => {
                            debug!("{} done in {:.2?}", input_path.display(), elapsed);
                            BatchJobResult {
                                input_path: input_path.to_path_buf(),
                                submission_index,
                                success: true,
                                output_path: Some(output_path),
                                elapsed,
                                error: None,
                            }
                        }
                        Err(e) => {
                            error!("{} failed: {}", input_path.display(), e);
                            BatchJobResult {
                                input_path: input_path.to_path_buf(),
                                submission_index,
                                success: false,
                                output_path: None,
                                elapsed,
                                error: Some(e.to_string()),
                            }
                        }
                    };
                    // The receiver outlives the scope, so sending cannot fail.
                    let _ = sender.send(result);
                });
            }
        });
        drop(sender);

        let results: Vec<BatchJobResult> = receiver.iter().collect();
        let successful = results.iter().filter(|result| result.success).count();
        let report = BatchReport {
            failed: results.len() - successful,
            successful,
            results,
            total_time: start.elapsed(),
        };
        info!(
            "Batch finished: {} succeeded, {} failed in {:.2?}",
            report.successful, report.failed, report.total_time
        );
        Ok(report)
    }
}
