use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use camino::Utf8PathBuf;

const DEFAULT_TILE_CACHE: usize = 1024;

pub const ENV_TILE_CACHE: &str = "GPFLOW_TILE_CACHE";
pub const ENV_PARALLELISM: &str = "GPFLOW_PARALLELISM";

/// Settings shared by every execution run by a [`Driver`](crate::Driver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Maximum number of tiles kept in memory. Zero disables caching.
    pub tile_cache_capacity: usize,
    /// Number of tile worker threads.
    pub parallelism: usize,
    /// Output path handed to an implicitly appended writer.
    pub target_path: Utf8PathBuf,
    /// Output format handed to an implicitly appended writer.
    pub target_format: String,
    /// Stage used for implicitly added source readers.
    pub reader_stage: String,
    /// Stage used for the implicitly appended writer.
    pub writer_stage: String,
    pub clear_cache_after_row_write: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            tile_cache_capacity: DEFAULT_TILE_CACHE,
            parallelism: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            target_path: Utf8PathBuf::from("target.dim"),
            target_format: "BEAM-DIMAP".to_string(),
            reader_stage: "Read".to_string(),
            writer_stage: "Write".to_string(),
            clear_cache_after_row_write: false,
        }
    }
}

impl ExecutionOptions {
    /// Defaults, overridden by `GPFLOW_TILE_CACHE` and `GPFLOW_PARALLELISM`
    /// when they hold valid numbers.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();

        if let Some(value) = lookup(ENV_TILE_CACHE) {
            match value.trim().parse() {
                Ok(capacity) => options.tile_cache_capacity = capacity,
                Err(_) => tracing::warn!(variable = ENV_TILE_CACHE, %value, "ignoring invalid value"),
            }
        }

        if let Some(value) = lookup(ENV_PARALLELISM) {
            match value.trim().parse::<NonZeroUsize>() {
                Ok(parallelism) => options.parallelism = parallelism.get(),
                Err(_) => tracing::warn!(variable = ENV_PARALLELISM, %value, "ignoring invalid value"),
            }
        }

        options
    }

    pub fn tile_cache_capacity(mut self, capacity: usize) -> Self {
        self.tile_cache_capacity = capacity;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn target(mut self, path: impl Into<Utf8PathBuf>, format: impl Into<String>) -> Self {
        self.target_path = path.into();
        self.target_format = format.into();
        self
    }

    pub fn reader_stage(mut self, stage: impl Into<String>) -> Self {
        self.reader_stage = stage.into();
        self
    }

    pub fn writer_stage(mut self, stage: impl Into<String>) -> Self {
        self.writer_stage = stage.into();
        self
    }

    pub fn clear_cache_after_row_write(mut self, clear: bool) -> Self {
        self.clear_cache_after_row_write = clear;
        self
    }
}

/// What an invocation executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationTarget {
    /// A declarative graph given as text.
    GraphText(String),
    /// A declarative graph stored in a file.
    GraphFile(Utf8PathBuf),
    /// A single stage, run as a one-node graph.
    Stage(String),
}

/// One run of the engine: what to execute and the values supplied for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub target: InvocationTarget,
    /// Raw `name=value` parameters. These win over the parameter file.
    pub parameters: BTreeMap<String, String>,
    pub parameter_file: Option<Utf8PathBuf>,
    /// Source files by source name.
    pub sources: BTreeMap<String, Utf8PathBuf>,
    /// Source files without a name, named `sourceProduct`, `sourceProduct2`
    /// and so on in order.
    pub positional_sources: Vec<Utf8PathBuf>,
}

impl Invocation {
    fn new(target: InvocationTarget) -> Self {
        Self {
            target,
            parameters: BTreeMap::new(),
            parameter_file: None,
            sources: BTreeMap::new(),
            positional_sources: Vec::new(),
        }
    }

    pub fn graph_text(text: impl Into<String>) -> Self {
        Self::new(InvocationTarget::GraphText(text.into()))
    }

    pub fn graph_file(path: impl Into<Utf8PathBuf>) -> Self {
        Self::new(InvocationTarget::GraphFile(path.into()))
    }

    pub fn stage(name: impl Into<String>) -> Self {
        Self::new(InvocationTarget::Stage(name.into()))
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn parameter_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.parameter_file = Some(path.into());
        self
    }

    pub fn source(mut self, name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.sources.insert(name.into(), path.into());
        self
    }

    pub fn positional_source(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.positional_sources.push(path.into());
        self
    }
}
