use std::sync::Arc;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::dataset::{Dataset, Rect};
use crate::error::TileComputationError;
use crate::observer::GraphObserver;
use crate::tiles::TileCache;

/// Fixed-size worker pool which drives tile computation for whole datasets.
///
/// Work is pulled from the terminal datasets only. When a stage needs tiles
/// from upstream to compute its own, it requests them through its source
/// datasets, and those upstream computations run inline on the same worker
/// (or wait on another worker already computing the same tile). Since no
/// worker ever hands an upstream pull back to the pool, the pool size does not
/// have to exceed the length of the longest dependency chain.
pub struct TileScheduler {
    pool: ThreadPool,
    cache: Arc<TileCache>,
}

impl TileScheduler {
    /// Creates a scheduler with `parallelism` worker threads. Zero lets the
    /// pool pick the number of available cores.
    pub fn new(parallelism: usize, cache: Arc<TileCache>) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("gpflow-tile-{i}"))
            .build()?;

        tracing::info!(
            parallelism = pool.current_num_threads(),
            cache_capacity = cache.capacity(),
            "tile scheduler ready"
        );

        Ok(Self { pool, cache })
    }

    pub fn parallelism(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    /// Computes every tile of a single dataset's extent.
    pub fn compute(
        &self,
        dataset: &Dataset,
        observer: &dyn GraphObserver,
    ) -> Result<usize, TileComputationError> {
        self.compute_all(std::slice::from_ref(dataset), observer)
    }

    /// Computes every tile of every dataset, spreading the tiles of all
    /// datasets across the pool. Returns the number of tiles requested.
    ///
    /// The first failure stops the remaining work and is returned as is.
    pub fn compute_all(
        &self,
        datasets: &[Dataset],
        observer: &dyn GraphObserver,
    ) -> Result<usize, TileComputationError> {
        let jobs: Vec<(&Dataset, Rect)> = datasets
            .iter()
            .flat_map(|dataset| {
                dataset
                    .schema()
                    .tile_rects()
                    .into_iter()
                    .map(move |rect| (dataset, rect))
            })
            .collect();

        self.pool.install(|| {
            jobs.par_iter().try_for_each(|&(dataset, rect)| {
                let span = tracing::debug_span!("tile", node = dataset.node_id(), %rect);
                let _enter = span.enter();

                observer.tile_started(dataset, rect);
                let result = dataset.tile(rect);
                observer.tile_stopped(dataset, rect);

                result.map(|_| ())
            })
        })?;

        Ok(jobs.len())
    }
}

impl std::fmt::Debug for TileScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileScheduler")
            .field("parallelism", &self.parallelism())
            .field("cache", &self.cache)
            .finish()
    }
}
