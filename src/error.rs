use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::dataset::Rect;

/// Structural errors raised by the graph model itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node '{0}' is already part of the graph")]
    DuplicateNode(String),
}

/// A stage type name could not be resolved against the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Stage '{0}' is not registered")]
pub struct StageNotFound(pub String);

/// Errors which abort the construction of a graph context. All of these are
/// raised before a single tile gets computed.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Node '{node}': stage '{stage}' is not registered")]
    StageNotFound { node: String, stage: String },

    #[error("Node '{node}': failed to create an instance of stage '{stage}':\n{cause}")]
    StageCreation {
        node: String,
        stage: String,
        cause: anyhow::Error,
    },

    #[error("Node '{node}': parameter '{parameter}' of stage '{stage}': {reason}")]
    ParameterBinding {
        node: String,
        stage: String,
        parameter: String,
        reason: String,
    },

    #[error("Node '{node}' is part of a dependency cycle")]
    CyclicGraph { node: String },

    #[error("Node '{node}': source '{source_name}' refers to unknown node '{missing}'")]
    UnresolvedSource {
        node: String,
        source_name: String,
        missing: String,
    },

    #[error("Node '{node}': stage '{stage}' failed to declare its output:\n{message}")]
    GraphInitialization {
        node: String,
        stage: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileErrorKind {
    /// The producing stage reported a failure.
    Failed,
    /// The producing node has already been disposed.
    Disposed,
}

/// A stage failed to compute a requested tile.
///
/// The error is cheap to clone, because a single failed computation is handed
/// to every requester that was waiting on the same tile.
#[derive(Debug, Error, Clone)]
#[error("Node '{node}' (stage '{stage}'): tile {rect} could not be computed:\n{cause}")]
pub struct TileComputationError {
    pub node: Arc<str>,
    pub stage: Arc<str>,
    pub rect: Rect,
    pub kind: TileErrorKind,
    cause: Arc<anyhow::Error>,
}

impl TileComputationError {
    pub(crate) fn failed(node: &Arc<str>, stage: &Arc<str>, rect: Rect, cause: anyhow::Error) -> Self {
        Self {
            node: node.clone(),
            stage: stage.clone(),
            rect,
            kind: TileErrorKind::Failed,
            cause: Arc::new(cause),
        }
    }

    pub(crate) fn disposed(node: &Arc<str>, stage: &Arc<str>, rect: Rect) -> Self {
        Self {
            node: node.clone(),
            stage: stage.clone(),
            rect,
            kind: TileErrorKind::Disposed,
            cause: Arc::new(anyhow::anyhow!("the node has already been disposed")),
        }
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

/// Raised when an API is used out of order, e.g. asking for a target product
/// before it has been initialized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Node '{node}': {what}")]
pub struct PreconditionViolation {
    pub node: String,
    pub what: &'static str,
}

/// Errors raised while reading graph descriptions and parameter files.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Couldn't read '{path}'.\n{cause}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("Malformed graph description.\n{0}")]
    Syntax(#[from] serde_json::Error),

    #[error("Malformed parameter file: {0}")]
    ParameterFile(String),

    #[error("Node '{node}': source '{source_name}' must be a node id or an external value")]
    InvalidSource { node: String, source_name: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Top level error returned by the execution driver.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Error while preparing the graph:\n{0}")]
    Template(#[from] TemplateError),

    #[error("Error while building the graph:\n{0}")]
    Build(#[from] BuildError),

    #[error("Error while computing tiles:\n{0}")]
    Tile(#[from] TileComputationError),

    #[error(transparent)]
    Precondition(#[from] PreconditionViolation),

    #[error("Graph '{0}' has no nodes")]
    EmptyGraph(String),

    #[error("Failed to build the tile worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl From<GraphError> for ExecutionError {
    fn from(err: GraphError) -> Self {
        ExecutionError::Template(TemplateError::Graph(err))
    }
}
