//! Execution observers.
//!
//! Observers are notification sinks: the driver tells them when an execution
//! starts and stops, and the scheduler tells them about every tile it
//! computes for a terminal output. They never influence the execution.

use crate::dataset::{Dataset, Rect};
use crate::engine::GraphContext;

/// Receives notifications about an execution. Every method defaults to doing
/// nothing. Tile notifications arrive concurrently from worker threads.
pub trait GraphObserver: Send + Sync {
    /// The graph context was built and its outputs were initialized.
    fn started(&self, _context: &GraphContext) {}

    /// Every tile of every output was computed.
    fn stopped(&self, _context: &GraphContext, _outputs: &[Dataset]) {}

    fn tile_started(&self, _dataset: &Dataset, _rect: Rect) {}

    fn tile_stopped(&self, _dataset: &Dataset, _rect: Rect) {}
}

/// Ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl GraphObserver for NullObserver {}

/// Reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl GraphObserver for TracingObserver {
    fn started(&self, context: &GraphContext) {
        tracing::info!(
            graph = %context.graph().id,
            nodes = context.node_contexts().len(),
            "execution started"
        );
    }

    fn stopped(&self, context: &GraphContext, outputs: &[Dataset]) {
        let stats = context.cache().stats();
        tracing::info!(
            graph = %context.graph().id,
            outputs = outputs.len(),
            hits = stats.hits,
            misses = stats.misses,
            "execution stopped"
        );
    }

    fn tile_started(&self, dataset: &Dataset, rect: Rect) {
        tracing::trace!(node = dataset.node_id(), %rect, "tile started");
    }

    fn tile_stopped(&self, dataset: &Dataset, rect: Rect) {
        tracing::trace!(node = dataset.node_id(), %rect, "tile stopped");
    }
}

#[cfg(feature = "progress")]
pub use progress::ProgressObserver;

#[cfg(feature = "progress")]
mod progress {
    use std::sync::{LazyLock, Mutex, PoisonError};
    use std::time::Instant;

    use console::style;
    use indicatif::{ProgressBar, ProgressStyle};

    use super::GraphObserver;
    use crate::dataset::{Dataset, Rect};
    use crate::engine::GraphContext;

    static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} tiles ({eta}) {msg}")
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    });

    /// Draws a progress bar over all tiles of the terminal outputs.
    pub struct ProgressObserver {
        bar: ProgressBar,
        start: Mutex<Option<Instant>>,
    }

    impl ProgressObserver {
        pub fn new() -> Self {
            Self::with_bar(ProgressBar::new(0))
        }

        /// A progress observer which never draws anything.
        pub fn hidden() -> Self {
            Self::with_bar(ProgressBar::hidden())
        }

        fn with_bar(bar: ProgressBar) -> Self {
            bar.set_style(PROGRESS_STYLE.clone());
            Self {
                bar,
                start: Mutex::new(None),
            }
        }

        pub fn position(&self) -> u64 {
            self.bar.position()
        }

        pub fn length(&self) -> Option<u64> {
            self.bar.length()
        }
    }

    impl Default for ProgressObserver {
        fn default() -> Self {
            Self::new()
        }
    }

    impl GraphObserver for ProgressObserver {
        fn started(&self, context: &GraphContext) {
            let total: usize = context
                .output_node_contexts()
                .filter_map(|ctx| ctx.target_product().ok())
                .map(|dataset| dataset.schema().tile_count())
                .sum();

            *self.start.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
            self.bar.set_length(total as u64);
            self.bar.set_position(0);
            self.bar.set_message(format!("Computing {}", style(&context.graph().id).cyan()));
        }

        fn stopped(&self, context: &GraphContext, outputs: &[Dataset]) {
            let start = *self.start.lock().unwrap_or_else(PoisonError::into_inner);
            let elapsed = start.map(|start| start.elapsed().as_millis()).unwrap_or_default();

            self.bar.finish_with_message(format!(
                "{} {} ({} outputs) {}",
                style("Finished").green(),
                context.graph().id,
                outputs.len(),
                style(format!("(+{elapsed}ms)")).blue()
            ));
        }

        fn tile_stopped(&self, _dataset: &Dataset, _rect: Rect) {
            self.bar.inc(1);
        }
    }
}
