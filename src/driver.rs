use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Level;

use crate::builder::GraphBuilder;
use crate::dataset::Dataset;
use crate::engine::GraphContext;
use crate::error::ExecutionError;
use crate::graph::Graph;
use crate::observer::GraphObserver;
use crate::options::{ExecutionOptions, Invocation};
use crate::stage::StageRegistry;
use crate::tiles::{CacheStats, TileCache, TileScheduler};

/// The result of a successful execution.
///
/// The outputs stay valid for as long as the execution is kept around; they
/// are disposed together with the graph context when it is dropped.
#[derive(Debug)]
pub struct Execution {
    context: GraphContext,
    outputs: Vec<Dataset>,
    tiles_computed: usize,
    elapsed: Duration,
    cache_stats: CacheStats,
}

impl Execution {
    pub fn context(&self) -> &GraphContext {
        &self.context
    }

    pub fn into_context(self) -> GraphContext {
        self.context
    }

    /// Datasets of the terminal outputs.
    pub fn outputs(&self) -> &[Dataset] {
        &self.outputs
    }

    /// Number of terminal output tiles requested from the scheduler.
    pub fn tiles_computed(&self) -> usize {
        self.tiles_computed
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Cache usage during this execution alone.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache_stats
    }
}

fn stats_since(before: CacheStats, after: CacheStats) -> CacheStats {
    CacheStats {
        hits: after.hits - before.hits,
        misses: after.misses - before.misses,
        computations: after.computations - before.computations,
        evictions: after.evictions - before.evictions,
    }
}

/// Runs graphs. A driver owns the tile cache and the worker pool, both of
/// which are reused by every execution it runs.
pub struct Driver {
    registry: StageRegistry,
    options: ExecutionOptions,
    scheduler: TileScheduler,
}

impl Driver {
    pub fn new(registry: StageRegistry, options: ExecutionOptions) -> Result<Self, ExecutionError> {
        let cache = Arc::new(TileCache::new(options.tile_cache_capacity));
        let scheduler = TileScheduler::new(options.parallelism, cache)?;

        Ok(Self {
            registry,
            options,
            scheduler,
        })
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        self.scheduler.cache()
    }

    /// Builds the complete graph for an invocation without running it.
    pub fn prepare(&self, invocation: &Invocation) -> Result<Graph, ExecutionError> {
        GraphBuilder::new(&self.registry, &self.options).build(invocation)
    }

    /// Builds the graph context, initializes the terminal outputs and
    /// computes every one of their tiles.
    ///
    /// Nothing is computed if building fails. If a tile fails, everything
    /// that was built is disposed before the error is returned.
    pub fn execute(&self, graph: Graph, observer: &dyn GraphObserver) -> Result<Execution, ExecutionError> {
        if graph.node_count() == 0 {
            return Err(ExecutionError::EmptyGraph(graph.id));
        }

        let span = tracing::span!(Level::INFO, "execute", graph = %graph.id);
        let _enter = span.enter();

        let start = Instant::now();
        let before = self.cache().stats();

        let context = GraphContext::new(graph, &self.registry, self.cache().clone())?;
        let outputs = context.init_outputs()?;

        tracing::info!(
            nodes = context.node_contexts().len(),
            outputs = outputs.len(),
            parallelism = self.scheduler.parallelism(),
            "execution started"
        );
        observer.started(&context);

        let tiles_computed = match self.scheduler.compute_all(&outputs, observer) {
            Ok(count) => count,
            Err(err) => {
                tracing::error!(node = %err.node, stage = %err.stage, rect = %err.rect, "tile computation failed");
                context.dispose();
                return Err(err.into());
            }
        };

        observer.stopped(&context, &outputs);

        let cache_stats = stats_since(before, self.cache().stats());
        let elapsed = start.elapsed();

        tracing::info!(
            tiles = tiles_computed,
            computations = cache_stats.computations,
            hits = cache_stats.hits,
            evictions = cache_stats.evictions,
            elapsed_ms = elapsed.as_millis() as u64,
            "execution finished"
        );

        Ok(Execution {
            context,
            outputs,
            tiles_computed,
            elapsed,
            cache_stats,
        })
    }

    /// Prepares and executes an invocation.
    pub fn run(&self, invocation: &Invocation, observer: &dyn GraphObserver) -> Result<Execution, ExecutionError> {
        let graph = self.prepare(invocation)?;
        self.execute(graph, observer)
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
