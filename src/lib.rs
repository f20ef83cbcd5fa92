#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod builder;
mod config;
mod dataset;
mod driver;
mod engine;
mod error;
mod graph;
mod observer;
mod options;
mod stage;
mod tiles;
mod utils;

#[cfg(test)]
mod testing;

pub use crate::builder::GraphBuilder;
pub use crate::config::{
    BoundParameters, ConfigValue, ParameterKind, ParameterSpec, ParameterValue, bind, bind_raw,
};
pub use crate::dataset::{BandInfo, DataType, Dataset, OutputSchema, Rect, TileData};
pub use crate::driver::{Driver, Execution};
pub use crate::engine::{GraphContext, NodeContext};
pub use crate::error::*;
pub use crate::graph::{Graph, Header, HeaderParameter, HeaderSource, Node, NodeSource, SourceRef};
#[cfg(feature = "progress")]
pub use crate::observer::ProgressObserver;
pub use crate::observer::{GraphObserver, NullObserver, TracingObserver};
pub use crate::options::{ENV_PARALLELISM, ENV_TILE_CACHE, ExecutionOptions, Invocation, InvocationTarget};
pub use crate::stage::{
    FnStageFactory, ResolvedSources, SourceInput, Stage, StageContext, StageDescriptor, StageFactory,
    StageRegistry,
};
pub use crate::tiles::{CacheStats, TileCache, TileScheduler};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
