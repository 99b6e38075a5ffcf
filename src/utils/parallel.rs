//! Parallel processing utilities

use crate::error::{KolosalError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for parallel processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelConfig {
    /// Number of threads (None = use the global rayon pool)
    pub n_threads: Option<usize>,
    /// Minimum rows handed to one rayon task during batch inference
    pub chunk_size: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            n_threads: None,
            chunk_size: 64,
        }
    }
}

impl ParallelConfig {
    /// Create a new parallel configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set number of threads
    pub fn with_threads(mut self, n: usize) -> Self {
        self.n_threads = Some(n);
        self
    }

    /// Set chunk size
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Get the number of threads to use
    pub fn num_threads(&self) -> usize {
        self.n_threads.unwrap_or_else(rayon::current_num_threads)
    }

    /// Build the worker pool described by this configuration.
    ///
    /// Without an explicit thread count no pool is created and work runs on
    /// the caller's current rayon pool.
    pub fn build_pool(&self) -> Result<WorkerPool> {
        let pool = match self.n_threads {
            None => None,
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("kolosal-ensemble-{i}"))
                    .build()
                    .map_err(|e| KolosalError::ThreadPoolError(e.to_string()))?,
            ),
        };
        Ok(WorkerPool {
            pool,
            chunk_size: self.chunk_size.max(1),
        })
    }

    /// Run `op` once inside a pool sized by this configuration.
    ///
    /// Builds a fresh pool per call; repeated callers keep a [`WorkerPool`].
    pub fn install<R, F>(&self, op: F) -> Result<R>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        Ok(self.build_pool()?.install(op))
    }
}

/// Long-lived rayon pool built from a [`ParallelConfig`]
#[derive(Debug)]
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    chunk_size: usize,
}

impl WorkerPool {
    /// Run `op` on this pool, or on the current one when no size was set
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Minimum rows per rayon task, at least 1
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn num_threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, rayon::ThreadPool::current_num_threads)
    }
}
