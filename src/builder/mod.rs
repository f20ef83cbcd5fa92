//! Turns an invocation into a complete, executable graph.
//!
//! Building happens in three steps. The parameter file and the invocation
//! parameters are merged, and every source file is assigned the id of the
//! node that reads it. Those values become template variables, which are
//! substituted into the raw graph text before it is parsed. Finally the
//! parsed graph is completed: a reader node is added for every source file
//! no node reads yet, and a writer node is appended after the terminal node
//! unless its stage writes its output by itself.

mod document;
mod params;
mod template;

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};

pub use document::parse_graph;
pub use params::{ParameterFile, merge_parameters};
pub use template::{placeholders, substitute};

use crate::config::{self, ConfigValue};
use crate::error::{BuildError, ExecutionError, TemplateError};
use crate::graph::{Graph, Node};
use crate::options::{ExecutionOptions, Invocation, InvocationTarget};
use crate::stage::StageRegistry;

pub const READ_NODE_PREFIX: &str = "ReadProduct$";
pub const WRITE_NODE_PREFIX: &str = "WriteProduct$";
pub const POSITIONAL_SOURCE_NAME: &str = "sourceProduct";

/// Name given to the `index`th (zero based) positional source.
pub fn positional_source_name(index: usize) -> String {
    match index {
        0 => POSITIONAL_SOURCE_NAME.to_string(),
        n => format!("{POSITIONAL_SOURCE_NAME}{}", n + 1),
    }
}

/// Makes a path absolute and resolves `.` and `..` without touching the file
/// system, so that different spellings of one file compare equal.
fn normalize(path: &Utf8Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.as_std_path().to_path_buf());

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }

    normalized
}

/// Assigns a reader node id to every source. Sources pointing at the same
/// file share the node of the first of them, in name order.
pub fn source_node_ids(sources: &BTreeMap<String, Utf8PathBuf>) -> BTreeMap<String, String> {
    let mut by_file: HashMap<PathBuf, String> = HashMap::new();

    sources
        .iter()
        .map(|(name, path)| {
            let id = by_file
                .entry(normalize(path))
                .or_insert_with(|| format!("{READ_NODE_PREFIX}{name}"))
                .clone();
            (name.clone(), id)
        })
        .collect()
}

/// All source files of an invocation by name. Positional sources are named
/// first, so an explicitly named source replaces a positional one.
pub fn source_files(invocation: &Invocation) -> BTreeMap<String, Utf8PathBuf> {
    let mut sources: BTreeMap<_, _> = invocation
        .positional_sources
        .iter()
        .enumerate()
        .map(|(i, path)| (positional_source_name(i), path.clone()))
        .collect();

    sources.extend(invocation.sources.iter().map(|(k, v)| (k.clone(), v.clone())));
    sources
}

/// Builds graphs for a registry of stages.
pub struct GraphBuilder<'a> {
    registry: &'a StageRegistry,
    options: &'a ExecutionOptions,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a StageRegistry, options: &'a ExecutionOptions) -> Self {
        Self { registry, options }
    }

    /// The merged raw parameters: invocation values win over the values of
    /// the parameter file. Stage defaults are applied later, when binding.
    pub fn parameters(&self, invocation: &Invocation) -> Result<BTreeMap<String, String>, TemplateError> {
        let file = match &invocation.parameter_file {
            Some(path) => Some(ParameterFile::read(path, &invocation.parameters)?),
            None => None,
        };

        Ok(merge_parameters(file.as_ref(), &invocation.parameters))
    }

    /// Builds the complete graph for an invocation.
    pub fn build(&self, invocation: &Invocation) -> Result<Graph, ExecutionError> {
        let parameters = self.parameters(invocation)?;
        let sources = source_files(invocation);

        let text = match &invocation.target {
            InvocationTarget::GraphText(text) => text.clone(),
            InvocationTarget::GraphFile(path) => std::fs::read_to_string(path).map_err(|cause| TemplateError::Io {
                path: path.clone(),
                cause,
            })?,
            InvocationTarget::Stage(stage) => return self.single_stage(stage, &parameters, &sources),
        };

        let node_ids = source_node_ids(&sources);
        let mut variables = parameters;
        variables.extend(node_ids.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut graph = parse_graph(&substitute(&text, &variables))?;
        self.complete(&mut graph, &sources)?;

        tracing::debug!(graph = %graph.id, nodes = graph.node_count(), "built graph");
        Ok(graph)
    }

    /// Builds a graph running one stage, fed by the given sources.
    ///
    /// The parameters are checked against the stage before anything else,
    /// so a misspelled name fails right away.
    pub fn single_stage(
        &self,
        stage: &str,
        parameters: &BTreeMap<String, String>,
        sources: &BTreeMap<String, Utf8PathBuf>,
    ) -> Result<Graph, ExecutionError> {
        let factory = self.registry.resolve(stage).map_err(|_| BuildError::StageNotFound {
            node: stage.to_string(),
            stage: stage.to_string(),
        })?;

        config::bind_raw(stage, factory.descriptor(), parameters)?;

        let mut node = Node::new(stage, stage);
        for (name, value) in parameters {
            node.configuration.set(name.clone(), ConfigValue::Scalar(value.clone()));
        }

        for (name, id) in source_node_ids(sources) {
            node = node.with_source(name, id);
        }

        let mut graph = Graph::new(stage);
        graph.add_node(node)?;
        self.complete(&mut graph, sources)?;

        Ok(graph)
    }

    /// Adds the implicit reader and writer nodes.
    ///
    /// The terminal node is the declared target or, without one, the last
    /// declared node. It is pinned as the target, which makes completing a
    /// graph a second time a no-op.
    pub fn complete(
        &self,
        graph: &mut Graph,
        sources: &BTreeMap<String, Utf8PathBuf>,
    ) -> Result<(), ExecutionError> {
        let terminal = graph
            .default_output()
            .map(|node| (node.id.clone(), node.stage.clone()));

        for (name, id) in source_node_ids(sources) {
            if graph.contains(&id) {
                continue;
            }

            let path = &sources[&name];
            let reader = Node::new(&id, &self.options.reader_stage).with_parameter("file", path.as_str());
            tracing::debug!(node = %id, file = %path, "adding reader node");
            graph.add_node(reader)?;
        }

        let Some((terminal, stage)) = terminal else {
            return Ok(());
        };

        graph.header.target = Some(terminal.clone());

        let factory = self.registry.resolve(&stage).map_err(|_| BuildError::StageNotFound {
            node: terminal.clone(),
            stage: stage.clone(),
        })?;

        let writer_id = format!("{WRITE_NODE_PREFIX}{terminal}");
        if factory.descriptor().is_output() || graph.contains(&writer_id) {
            return Ok(());
        }

        let writer = Node::new(&writer_id, &self.options.writer_stage)
            .with_source("source", &terminal)
            .with_parameter("file", self.options.target_path.as_str())
            .with_parameter("formatName", &self.options.target_format)
            .with_parameter(
                "clearCacheAfterRowWrite",
                self.options.clear_cache_after_row_write.to_string(),
            );

        tracing::debug!(node = %writer_id, source = %terminal, "adding writer node");
        graph.add_node(writer)?;

        Ok(())
    }
}
