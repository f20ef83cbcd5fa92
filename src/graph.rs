//! The declarative graph model.
//!
//! A [`Graph`] is an ordered list of [`Node`]s. Each node names a stage type,
//! carries a configuration tree, and declares its inputs as named
//! [`NodeSource`]s. The data dependencies between nodes are implied entirely
//! by those sources: a source referring to another node's id makes that node a
//! producer of this one.
//!
//! The model performs no validation beyond id uniqueness. References to
//! missing nodes and dependency cycles are only reported once the graph is
//! turned into a [`GraphContext`](crate::GraphContext), because only then is
//! the graph expected to be complete.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::config::ConfigValue;
use crate::error::{BuildError, GraphError};

/// Where a node input comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceRef {
    /// The output of another node in the same graph.
    Node(String),
    /// A value supplied from outside the graph, e.g. a file path.
    External(String),
}

/// A named input of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeSource {
    pub name: String,
    pub source: SourceRef,
}

impl NodeSource {
    pub fn node(name: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: SourceRef::Node(node_id.into()),
        }
    }

    pub fn external(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: SourceRef::External(value.into()),
        }
    }

    /// Id of the producing node, if this source refers to one.
    pub fn node_id(&self) -> Option<&str> {
        match &self.source {
            SourceRef::Node(id) => Some(id),
            SourceRef::External(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub stage: String,
    pub sources: Vec<NodeSource>,
    pub configuration: ConfigValue,
}

impl Node {
    pub fn new(id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage: stage.into(),
            sources: Vec::new(),
            configuration: ConfigValue::empty(),
        }
    }

    /// Adds an input fed by another node.
    pub fn with_source(mut self, name: impl Into<String>, node_id: impl Into<String>) -> Self {
        self.sources.push(NodeSource::node(name, node_id));
        self
    }

    /// Adds an input fed by a value from outside the graph.
    pub fn with_external(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.sources.push(NodeSource::external(name, value));
        self
    }

    pub fn with_configuration(mut self, configuration: ConfigValue) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.set(name, ConfigValue::Scalar(value.into()));
        self
    }

    pub fn source(&self, index: usize) -> Option<&NodeSource> {
        self.sources.get(index)
    }

    pub fn source_named(&self, name: &str) -> Option<&NodeSource> {
        self.sources.iter().find(|source| source.name == name)
    }

    /// Looks up a top level scalar of the configuration.
    pub fn configuration_value(&self, name: &str) -> Option<&str> {
        self.configuration.child(name)?.as_scalar()
    }

    /// Ids of every node this one consumes, in declaration order.
    pub fn producers(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().filter_map(NodeSource::node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderSource {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderParameter {
    pub name: String,
    pub kind: String,
    pub description: Option<String>,
}

/// Declares what a graph expects from the outside.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    /// The node whose output is the result of the graph.
    pub target: Option<String>,
    pub sources: Vec<HeaderSource>,
    pub parameters: Vec<HeaderParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    pub id: String,
    pub header: Header,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            header: Header::default(),
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
        if self.index.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }

        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_at(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// The node whose output is the designated result: the header target if
    /// it names an existing node, otherwise the last declared node.
    pub fn default_output(&self) -> Option<&Node> {
        self.header
            .target
            .as_deref()
            .and_then(|target| self.node(target))
            .or_else(|| self.nodes.last())
    }

    /// Number of source edges between nodes of this graph.
    pub fn edge_count(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(Node::producers)
            .filter(|id| self.contains(id))
            .count()
    }

    fn dependency_graph(&self) -> DiGraph<usize, ()> {
        let mut graph = DiGraph::with_capacity(self.nodes.len(), self.nodes.len());
        let indices: Vec<_> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();

        for (consumer, node) in self.nodes.iter().enumerate() {
            for producer in node.producers() {
                if let Some(&producer) = self.index.get(producer) {
                    graph.add_edge(indices[producer], indices[consumer], ());
                }
            }
        }

        graph
    }

    /// Orders the nodes so that every producer comes before its consumers.
    /// References to nodes outside of the graph are ignored.
    pub fn topological_order(&self) -> Result<Vec<&Node>, BuildError> {
        let graph = self.dependency_graph();

        toposort(&graph, None)
            .map(|order| order.into_iter().map(|i| &self.nodes[graph[i]]).collect())
            .map_err(|cycle| BuildError::CyclicGraph {
                node: self.nodes[graph[cycle.node_id()]].id.clone(),
            })
    }
}

/// Renders the graph as a mermaid flowchart.
impl Display for Graph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (i, node) in self.nodes.iter().enumerate() {
            let label = format!("{} ({})", node.id, node.stage).replace('"', "\\\"");
            writeln!(f, "    {i}[\"{label}\"]")?;
        }

        for (consumer, node) in self.nodes.iter().enumerate() {
            for source in &node.sources {
                match &source.source {
                    SourceRef::Node(id) => {
                        if let Some(producer) = self.index.get(id) {
                            writeln!(f, "    {producer} -- \"{}\" --> {consumer}", source.name)?;
                        }
                    }
                    SourceRef::External(value) => {
                        let value = value.replace('"', "\\\"");
                        writeln!(f, "    ext{consumer}_{}[/\"{value}\"/] --> {consumer}", source.name)?;
                    }
                }
            }
        }

        Ok(())
    }
}
