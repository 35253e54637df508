//! Parameters for a mapreduce process.
//!

use std::env;

use tracing::warn;

use crate::error::{MRError, Result};

/// Environment variable overriding the number of map workers.
pub const MAPPERS_ENV: &str = "CHANMR_MAPPERS";
/// Environment variable overriding the number of reduce workers.
pub const REDUCERS_ENV: &str = "CHANMR_REDUCERS";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MRParameters {
    pub mappers: usize,
    pub reducers: usize,
}

impl MRParameters {
    /// Defaults derived from the available parallelism: four map workers and one reduce
    /// worker per CPU.
    pub fn new() -> MRParameters {
        let cpus = num_cpus::get().max(1);
        MRParameters {
            mappers: cpus * 4,
            reducers: cpus,
        }
    }

    /// Like `new()`, but lets `CHANMR_MAPPERS` and `CHANMR_REDUCERS` override the pool sizes.
    pub fn from_env() -> MRParameters {
        let mut params = MRParameters::new();
        if let Some(n) = read_pool_size(MAPPERS_ENV) {
            params.mappers = n;
        }
        if let Some(n) = read_pool_size(REDUCERS_ENV) {
            params.reducers = n;
        }
        params
    }

    /// Determines how many map and reduce workers are run. Unlike a batch mapreduce, both
    /// pools run at the same time. The number of reducers also determines the sharding of
    /// the mapped records.
    ///
    /// Default 4*CPUs/CPUs
    pub fn set_concurrency(mut self, mappers: usize, reducers: usize) -> MRParameters {
        self.mappers = mappers;
        self.reducers = reducers;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.mappers == 0 {
            return Err(MRError::InvalidParameters(String::from(
                "at least one mapper is required",
            )));
        }
        if self.reducers == 0 {
            return Err(MRError::InvalidParameters(String::from(
                "at least one reducer is required",
            )));
        }
        Ok(())
    }

    /// Number of threads needed to run every worker, both dispatchers and the cancellation
    /// watcher at once.
    pub fn pool_threads(&self) -> usize {
        self.mappers + self.reducers + 3
    }
}

impl Default for MRParameters {
    fn default() -> MRParameters {
        MRParameters::new()
    }
}

fn read_pool_size(var: &str) -> Option<usize> {
    let raw = env::var(var).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(0) => {
            warn!(var, "ignoring pool size of zero");
            None
        }
        Ok(n) => Some(n),
        Err(e) => {
            warn!(var, value = %raw, "ignoring unparseable pool size: {}", e);
            None
        }
    }
}
