use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::{Result, SubphotError};

/// Bounded executor for dispatched units.
///
/// A panicking unit is converted into an `Err` for that unit only; the rest
/// of the work list still runs.
pub struct WorkerPool {
    pool: ThreadPool,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SubphotError::Pool("worker count must be positive".into()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("subphot-worker-{i}"))
            .build()
            .map_err(|e| SubphotError::Pool(format!("failed to start worker pool: {e}")))?;
        debug!(size, "Worker pool started");
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `unit` over every item, at most `size` at a time. Results are in
    /// item order; a panic becomes `Err` with the panic message.
    pub fn run<T, R, F>(&self, items: Vec<T>, unit: F) -> Vec<std::result::Result<R, String>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        self.pool.install(|| {
            items
                .into_par_iter()
                .map(|item| catch_unwind(AssertUnwindSafe(|| unit(item))).map_err(panic_message))
                .collect()
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("worker panicked: {msg}")
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(SubphotError::Pool(_))));
    }

    #[test]
    fn panics_are_contained() {
        let pool = WorkerPool::new(2).unwrap();
        let results = pool.run(vec![1, 2, 3], |n| {
            if n == 2 {
                panic!("boom");
            }
            n * 10
        });
        assert_eq!(results[0], Ok(10));
        assert!(results[1].as_ref().unwrap_err().contains("boom"));
        assert_eq!(results[2], Ok(30));
    }
}
