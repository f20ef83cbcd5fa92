use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::Level;

use crate::config::{self, BoundParameters};
use crate::dataset::Dataset;
use crate::engine::StageSlot;
use crate::error::{BuildError, PreconditionViolation};
use crate::graph::Node;
use crate::stage::{ResolvedSources, StageContext, StageDescriptor, StageRegistry};
use crate::tiles::TileCache;

/// The per-execution state of one graph node.
///
/// A node context owns the stage instance created for the node, the inputs
/// that were resolved for it, and, once initialized, its output dataset. The
/// reference count tells how many other nodes consume that output; a node no
/// one consumes is a terminal output of the graph.
pub struct NodeContext {
    node: Node,
    descriptor: StageDescriptor,
    parameters: BoundParameters,
    sources: ResolvedSources,
    slot: Arc<StageSlot>,
    cache: Arc<TileCache>,
    reference_count: AtomicUsize,
    target: Mutex<Option<Dataset>>,
}

impl NodeContext {
    /// Resolves the node's stage type, creates the stage and binds its
    /// configuration. The stage is not initialized yet.
    pub fn new(
        node: Node,
        registry: &StageRegistry,
        sources: ResolvedSources,
        cache: Arc<TileCache>,
    ) -> Result<Self, BuildError> {
        let factory = registry
            .resolve(&node.stage)
            .map_err(|_| BuildError::StageNotFound {
                node: node.id.clone(),
                stage: node.stage.clone(),
            })?;

        let descriptor = factory.descriptor().clone();
        let parameters = config::bind(&node.id, &descriptor, &node.configuration)?;

        let stage = factory.create().map_err(|cause| BuildError::StageCreation {
            node: node.id.clone(),
            stage: node.stage.clone(),
            cause,
        })?;

        tracing::debug!(node = %node.id, stage = %node.stage, parameters = parameters.len(), "created node context");

        Ok(Self {
            slot: Arc::new(StageSlot::new(&node.id, &node.stage, stage)),
            node,
            descriptor,
            parameters,
            sources,
            cache,
            reference_count: AtomicUsize::new(0),
            target: Mutex::new(None),
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn stage_type(&self) -> &str {
        &self.node.stage
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    pub fn parameters(&self) -> &BoundParameters {
        &self.parameters
    }

    pub fn sources(&self) -> &ResolvedSources {
        &self.sources
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_reference_count(&self) {
        self.reference_count.fetch_add(1, Ordering::AcqRel);
    }

    /// True when no other node consumes this node's output.
    pub fn is_output(&self) -> bool {
        self.reference_count() == 0
    }

    pub fn is_initialized(&self) -> bool {
        self.target().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.slot.is_disposed()
    }

    /// Lets the stage declare its output and wraps it into a dataset. Tiles
    /// are not computed. Calling this again returns the same dataset.
    pub fn init_target_product(&self) -> Result<Dataset, BuildError> {
        let mut target = self.target();
        if let Some(dataset) = target.as_ref() {
            return Ok(dataset.clone());
        }

        let span = tracing::span!(Level::DEBUG, "init", node = %self.node.id, stage = %self.node.stage);
        let _enter = span.enter();

        let ctx = StageContext::new(&self.node.id, &self.node.stage, span.clone());
        let schema = self
            .slot
            .initialize(&ctx, &self.sources, &self.parameters)
            .map_err(|err| BuildError::GraphInitialization {
                node: self.node.id.clone(),
                stage: self.node.stage.clone(),
                message: format!("{err:#}"),
            })?;

        tracing::debug!(
            width = schema.width,
            height = schema.height,
            bands = schema.bands.len(),
            tiles = schema.tile_count(),
            "declared target product"
        );

        let dataset = Dataset::new(schema, self.slot.clone(), self.cache.clone());
        *target = Some(dataset.clone());
        Ok(dataset)
    }

    /// The dataset declared by [`NodeContext::init_target_product`].
    pub fn target_product(&self) -> Result<Dataset, PreconditionViolation> {
        self.target().clone().ok_or_else(|| PreconditionViolation {
            node: self.node.id.clone(),
            what: "the target product has not been initialized",
        })
    }

    /// The dataset bound to one of the node's named inputs.
    pub fn source_product(&self, name: &str) -> Option<&Dataset> {
        self.sources.dataset(name)
    }

    /// Disposes the stage and forgets the output dataset. Only the first call
    /// has any effect. Blocks while tiles of this node are being computed.
    pub fn dispose(&self) {
        if !self.slot.dispose() {
            return;
        }

        if let Some(dataset) = self.target().take() {
            self.cache.invalidate(dataset.id());
        }

        tracing::debug!(node = %self.node.id, stage = %self.node.stage, "disposed node context");
    }

    fn target(&self) -> MutexGuard<'_, Option<Dataset>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for NodeContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node.id)
            .field("stage", &self.node.stage)
            .field("reference_count", &self.reference_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
