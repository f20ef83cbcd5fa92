//! The contract between the engine and the stages it executes.
//!
//! Stages are external collaborators: the engine never knows what a stage
//! computes, it only constructs one through a [`StageFactory`] resolved by
//! name from a [`StageRegistry`], hands it its inputs and typed parameters,
//! and then asks it for tiles.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use crate::config::{BoundParameters, ParameterSpec};
use crate::dataset::{Dataset, OutputSchema, Rect, TileData};
use crate::error::StageNotFound;

/// A pluggable computation producing one output dataset from zero or more
/// inputs.
///
/// A stage is initialized exactly once, before any tile is requested. After
/// that `compute_tile` may be called concurrently from several worker
/// threads, although never twice at the same time for the same region.
pub trait Stage: Send + Sync {
    /// Receives the resolved inputs and parameters, and declares the shape of
    /// the output without computing any of its content.
    fn initialize(
        &mut self,
        ctx: &StageContext,
        sources: &ResolvedSources,
        parameters: &BoundParameters,
    ) -> anyhow::Result<OutputSchema>;

    /// Computes one region of the output. Upstream tiles can be pulled from
    /// the datasets received in [`Stage::initialize`].
    fn compute_tile(&self, rect: Rect, schema: &OutputSchema) -> anyhow::Result<TileData>;

    /// Releases whatever the stage holds. Called at most once.
    fn dispose(&mut self) {}
}

/// Execution context handed to a stage at initialization.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub node_id: String,
    pub stage: String,
    span: tracing::Span,
}

impl StageContext {
    pub(crate) fn new(node_id: &str, stage: &str, span: tracing::Span) -> Self {
        Self {
            node_id: node_id.to_string(),
            stage: stage.to_string(),
            span,
        }
    }

    /// The span the node is built in, for stages that log on their own.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// Static description of a stage type.
#[derive(Debug, Clone, Default)]
pub struct StageDescriptor {
    name: String,
    aliases: Vec<String>,
    parameters: Vec<ParameterSpec>,
    is_output: bool,
    description: Option<String>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    /// Marks the stage as one which persists its input by itself, so no
    /// writer has to be appended after it.
    pub fn output(mut self) -> Self {
        self.is_output = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|spec| spec.name == name)
    }

    pub fn is_output(&self) -> bool {
        self.is_output
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Constructs stage instances of one type.
pub trait StageFactory: Send + Sync {
    fn descriptor(&self) -> &StageDescriptor;

    fn create(&self) -> anyhow::Result<Box<dyn Stage>>;
}

/// A [`StageFactory`] backed by a closure.
pub struct FnStageFactory<F> {
    descriptor: StageDescriptor,
    create: F,
}

impl<F> FnStageFactory<F>
where
    F: Fn() -> anyhow::Result<Box<dyn Stage>> + Send + Sync,
{
    pub fn new(descriptor: StageDescriptor, create: F) -> Self {
        Self { descriptor, create }
    }
}

impl<F> StageFactory for FnStageFactory<F>
where
    F: Fn() -> anyhow::Result<Box<dyn Stage>> + Send + Sync,
{
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    fn create(&self) -> anyhow::Result<Box<dyn Stage>> {
        (self.create)()
    }
}

/// Maps stage type names, and their aliases, to factories.
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: HashMap<String, Arc<dyn StageFactory>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under its name and every alias. A later
    /// registration under the same name replaces the earlier one.
    pub fn register(&mut self, factory: impl StageFactory + 'static) -> &mut Self {
        let factory: Arc<dyn StageFactory> = Arc::new(factory);
        let descriptor = factory.descriptor();

        for name in std::iter::once(descriptor.name()).chain(descriptor.aliases().iter().map(String::as_str)) {
            if self.factories.insert(name.to_string(), factory.clone()).is_some() {
                tracing::warn!(stage = name, "replacing an already registered stage");
            }
        }

        self
    }

    pub fn register_fn<F>(&mut self, descriptor: StageDescriptor, create: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.register(FnStageFactory::new(descriptor, create))
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn StageFactory>, StageNotFound> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| StageNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Primary names of all registered stages, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories
            .values()
            .map(|factory| factory.descriptor().name())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names())
            .finish()
    }
}

/// A resolved stage input.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceInput {
    Dataset(Dataset),
    External(String),
}

/// The inputs of a node, resolved to datasets or external values, in
/// declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSources {
    inputs: Vec<(String, SourceInput)>,
}

impl ResolvedSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, input: SourceInput) {
        self.inputs.push((name.into(), input));
    }

    pub fn get(&self, name: &str) -> Option<&SourceInput> {
        self.inputs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, input)| input)
    }

    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        match self.get(name)? {
            SourceInput::Dataset(dataset) => Some(dataset),
            SourceInput::External(_) => None,
        }
    }

    pub fn external(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            SourceInput::External(value) => Some(value),
            SourceInput::Dataset(_) => None,
        }
    }

    /// Every dataset input, in declaration order.
    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.inputs.iter().filter_map(|(_, input)| match input {
            SourceInput::Dataset(dataset) => Some(dataset),
            SourceInput::External(_) => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourceInput)> {
        self.inputs.iter().map(|(name, input)| (name.as_str(), input))
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}
