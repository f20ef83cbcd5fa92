use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::BoundParameters;
use crate::dataset::{OutputSchema, Rect, TileData};
use crate::error::TileComputationError;
use crate::stage::{ResolvedSources, Stage, StageContext};

/// Owns the stage instance of one node and guards it against disposal.
///
/// Tile computations hold the lock for reading, so any number of them can
/// run at once. Disposal takes it for writing, which makes it wait until
/// every computation already running has finished. Once disposed, the slot
/// is empty and every further request fails with a `Disposed` error.
pub(crate) struct StageSlot {
    node_id: Arc<str>,
    stage_type: Arc<str>,
    stage: RwLock<Option<Box<dyn Stage>>>,
    disposed: AtomicBool,
}

impl StageSlot {
    pub fn new(node_id: &str, stage_type: &str, stage: Box<dyn Stage>) -> Self {
        Self {
            node_id: Arc::from(node_id),
            stage_type: Arc::from(stage_type),
            stage: RwLock::new(Some(stage)),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn stage_type(&self) -> &str {
        &self.stage_type
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn disposed_error(&self, rect: Rect) -> TileComputationError {
        TileComputationError::disposed(&self.node_id, &self.stage_type, rect)
    }

    pub fn initialize(
        &self,
        ctx: &StageContext,
        sources: &ResolvedSources,
        parameters: &BoundParameters,
    ) -> anyhow::Result<OutputSchema> {
        let mut guard = self.stage.write().unwrap_or_else(PoisonError::into_inner);

        match guard.as_mut() {
            Some(stage) => stage.initialize(ctx, sources, parameters),
            None => anyhow::bail!("the node has already been disposed"),
        }
    }

    pub fn compute_tile(&self, rect: Rect, schema: &OutputSchema) -> Result<TileData, TileComputationError> {
        let guard = self.stage.read().unwrap_or_else(PoisonError::into_inner);

        let Some(stage) = guard.as_ref() else {
            return Err(self.disposed_error(rect));
        };

        // failures pulled from upstream keep naming the node they came from
        stage.compute_tile(rect, schema).map_err(|err| {
            err.downcast::<TileComputationError>()
                .unwrap_or_else(|err| TileComputationError::failed(&self.node_id, &self.stage_type, rect, err))
        })
    }

    /// Disposes the stage once. Returns `false` if it was already disposed.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let stage = self
            .stage
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut stage) = stage {
            stage.dispose();
        }

        true
    }
}
