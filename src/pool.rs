//! Rayon worker pool for parsing assets.
//!
//! Each job runs isolated: a panic inside one job becomes an `Err` for that
//! job only, and the rest of the batch still completes.

use std::panic::{self, AssertUnwindSafe};

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::error::CatalogError;

/// Configures how many worker threads parse assets.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPool {
    /// Number of worker threads. If 0, use Rayon default (num_cpus).
    pub workers: usize,
}

impl WorkerPool {
    pub fn with_workers(n: usize) -> Self {
        Self { workers: n }
    }

    /// Run `job` over every input in parallel and return results in input order.
    pub fn map<T, R, F>(&self, inputs: &[T], job: F) -> Result<Vec<Result<R, String>>, CatalogError>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R, String> + Sync,
    {
        let run = || {
            inputs
                .par_iter()
                .map(|input| isolate(|| job(input)))
                .collect::<Vec<_>>()
        };
        if self.workers == 0 {
            return Ok(run());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|err| CatalogError::Storage(format!("worker pool: {err}")))?;
        Ok(pool.install(run))
    }
}

/// Run `job`, turning a panic into an `Err` carrying the panic message.
pub fn isolate<R>(job: impl FnOnce() -> Result<R, String>) -> Result<R, String> {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|msg| msg.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            Err(format!("worker panicked: {reason}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_keep_input_order() {
        let inputs: Vec<u32> = (0..64).collect();
        let results = WorkerPool::with_workers(4)
            .map(&inputs, |value| Ok(value * 2))
            .unwrap();
        let doubled: Vec<u32> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(doubled, inputs.iter().map(|v| v * 2).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_job_does_not_cancel_batch() {
        let inputs = vec![1, 2, 3];
        let results = WorkerPool::default()
            .map(&inputs, |value| {
                if *value == 2 {
                    panic!("bad file");
                }
                Ok(*value)
            })
            .unwrap();
        assert_eq!(results[0], Ok(1));
        assert!(results[1].as_ref().unwrap_err().contains("bad file"));
        assert_eq!(results[2], Ok(3));
    }
}
