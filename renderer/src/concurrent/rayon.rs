// gallium/renderer/src/concurrent/rayon.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An implementation of the executor using the Rayon library.

use crate::concurrent::executor::Executor;
use gallium_gpu::{PipeError, PipeResult};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Runs builders on a private thread pool, so contexts do not compete for the global one.
pub struct RayonExecutor {
    pool: ThreadPool,
}

impl RayonExecutor {
    pub fn new(num_threads: usize) -> PipeResult<RayonExecutor> {
        let pool = ThreadPoolBuilder::new().num_threads(num_threads)
                                           .thread_name(|index| format!("gallium-tile-{}", index))
                                           .build()
                                           .map_err(|error| {
            warn!("cannot start {} rasterizer threads: {}", num_threads, error);
            PipeError::AllocationFailed("rasterizer thread pool")
        })?;
        Ok(RayonExecutor { pool })
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Executor for RayonExecutor {
    fn build_vector<T, F>(&self, length: usize, builder: F) -> Vec<T>
                          where T: Send, F: Fn(usize) -> T + Send + Sync {
        self.pool.install(|| (0..length).into_par_iter().map(builder).collect())
    }
}

#[cfg(test)]
mod test {
    use super::RayonExecutor;
    use crate::concurrent::executor::{Executor, SequentialExecutor};

    #[test]
    fn test_results_keep_index_order() {
        let rayon = RayonExecutor::new(3).unwrap();
        assert_eq!(rayon.num_threads(), 3);
        let parallel = rayon.build_vector(1000, |index| index * index);
        let sequential = SequentialExecutor.build_vector(1000, |index| index * index);
        assert_eq!(parallel, sequential);
    }
}
