use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Level;

use crate::dataset::Dataset;
use crate::engine::NodeContext;
use crate::error::{BuildError, PreconditionViolation};
use crate::graph::{Graph, Node, SourceRef};
use crate::stage::{ResolvedSources, SourceInput, StageRegistry};
use crate::tiles::TileCache;

/// All node contexts of one execution of a graph.
pub struct GraphContext {
    graph: Graph,
    /// In build order: producers always come before their consumers.
    contexts: Vec<NodeContext>,
    index: HashMap<String, usize>,
    outputs: Vec<usize>,
    cache: Arc<TileCache>,
    disposed: AtomicBool,
}

/// Demand driven construction state.
struct Builder<'a> {
    graph: &'a Graph,
    registry: &'a StageRegistry,
    cache: &'a Arc<TileCache>,
    contexts: Vec<NodeContext>,
    built: HashMap<String, usize>,
    in_progress: HashSet<String>,
}

impl<'a> Builder<'a> {
    /// Builds the node and, before it, every node it consumes. Producers are
    /// initialized as soon as someone consumes them, since their output has
    /// to be handed to the consumer's stage.
    fn build(&mut self, node: &'a Node) -> Result<usize, BuildError> {
        if let Some(&index) = self.built.get(&node.id) {
            return Ok(index);
        }

        if !self.in_progress.insert(node.id.clone()) {
            return Err(BuildError::CyclicGraph { node: node.id.clone() });
        }

        let span = tracing::span!(Level::DEBUG, "node", node = %node.id, stage = %node.stage);
        let _enter = span.enter();

        let mut sources = ResolvedSources::new();
        for source in &node.sources {
            let input = match &source.source {
                SourceRef::External(value) => SourceInput::External(value.clone()),
                SourceRef::Node(producer_id) => {
                    let Some(producer) = self.graph.node(producer_id) else {
                        return Err(BuildError::UnresolvedSource {
                            node: node.id.clone(),
                            source_name: source.name.clone(),
                            missing: producer_id.clone(),
                        });
                    };

                    let index = self.build(producer)?;
                    let producer = &self.contexts[index];
                    producer.increment_reference_count();
                    SourceInput::Dataset(producer.init_target_product()?)
                }
            };

            sources.push(source.name.clone(), input);
        }

        let context = NodeContext::new(node.clone(), self.registry, sources, self.cache.clone())?;

        self.in_progress.remove(&node.id);
        let index = self.contexts.len();
        self.contexts.push(context);
        self.built.insert(node.id.clone(), index);

        Ok(index)
    }
}

impl GraphContext {
    /// Builds a context for every node of the graph, producers first.
    ///
    /// Fails without computing any tile if a stage can't be resolved or
    /// configured, a source refers to a missing node, the graph contains a
    /// cycle, or a consumed node can't declare its output.
    pub fn new(graph: Graph, registry: &StageRegistry, cache: Arc<TileCache>) -> Result<Self, BuildError> {
        let span = tracing::span!(Level::INFO, "graph", id = %graph.id);
        let _enter = span.enter();

        let mut builder = Builder {
            graph: &graph,
            registry,
            cache: &cache,
            contexts: Vec::with_capacity(graph.node_count()),
            built: HashMap::with_capacity(graph.node_count()),
            in_progress: HashSet::new(),
        };

        for node in graph.nodes() {
            builder.build(node)?;
        }

        let Builder { contexts, built, .. } = builder;

        let outputs: Vec<usize> = contexts
            .iter()
            .enumerate()
            .filter(|(_, ctx)| ctx.is_output())
            .map(|(i, _)| i)
            .collect();

        for &i in &outputs {
            tracing::info!(node = contexts[i].id(), stage = contexts[i].stage_type(), "terminal output");
        }

        tracing::debug!(nodes = contexts.len(), outputs = outputs.len(), "built graph context");

        Ok(Self {
            graph,
            contexts,
            index: built,
            outputs,
            cache,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn node_context(&self, id: &str) -> Option<&NodeContext> {
        self.index.get(id).map(|&i| &self.contexts[i])
    }

    /// Every node context, in the order they were built.
    pub fn node_contexts(&self) -> &[NodeContext] {
        &self.contexts
    }

    /// The node contexts no other node consumes.
    pub fn output_node_contexts(&self) -> impl Iterator<Item = &NodeContext> {
        self.outputs.iter().map(|&i| &self.contexts[i])
    }

    /// Initializes the target products of every terminal output.
    pub fn init_outputs(&self) -> Result<Vec<Dataset>, BuildError> {
        self.output_node_contexts()
            .map(NodeContext::init_target_product)
            .collect()
    }

    pub fn output_products(&self) -> Result<Vec<Dataset>, PreconditionViolation> {
        self.output_node_contexts()
            .map(NodeContext::target_product)
            .collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Disposes every node context, consumers before their producers.
    /// Contexts that were already disposed on their own are skipped.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        for context in self.contexts.iter().rev() {
            context.dispose();
        }

        tracing::debug!(graph = %self.graph.id, "disposed graph context");
    }
}

impl Drop for GraphContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for GraphContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphContext")
            .field("graph", &self.graph.id)
            .field("nodes", &self.contexts)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::testing::{Probe, fake_registry};

    fn build(graph: Graph, probe: &Arc<Probe>) -> Result<GraphContext, BuildError> {
        GraphContext::new(graph, &fake_registry(probe), Arc::new(TileCache::new(64)))
    }

    fn chain() -> Graph {
        let mut graph = Graph::new("chain");
        graph.add_node(Node::new("read1", "Read")).unwrap();
        graph.add_node(Node::new("process", "Threshold").with_source("input", "read1")).unwrap();
        graph.add_node(Node::new("write", "Write").with_source("source", "process")).unwrap();
        graph
    }

    #[test]
    fn test_terminal_output_detection() {
        let context = build(chain(), &Probe::new()).unwrap();

        assert_eq!(context.node_context("read1").unwrap().reference_count(), 1);
        assert_eq!(context.node_context("process").unwrap().reference_count(), 1);
        assert_eq!(context.node_context("write").unwrap().reference_count(), 0);

        let outputs: Vec<_> = context.output_node_contexts().map(NodeContext::id).collect();
        assert_eq!(outputs, ["write"]);
    }

    #[test]
    fn test_consumers_declared_before_producers() {
        let mut graph = Graph::new("reversed");
        graph.add_node(Node::new("write", "Write").with_source("source", "process")).unwrap();
        graph.add_node(Node::new("process", "Threshold").with_source("input", "read1")).unwrap();
        graph.add_node(Node::new("read1", "Read")).unwrap();

        let context = build(graph, &Probe::new()).unwrap();
        let order: Vec<_> = context.node_contexts().iter().map(NodeContext::id).collect();

        assert_eq!(order, ["read1", "process", "write"]);
    }

    #[test]
    fn test_shared_producer_is_built_once() {
        let mut graph = Graph::new("diamond");
        graph.add_node(Node::new("read", "Read")).unwrap();
        graph.add_node(Node::new("a", "Sum").with_source("input", "read")).unwrap();
        graph.add_node(Node::new("b", "Sum").with_source("input", "read")).unwrap();
        graph
            .add_node(Node::new("join", "Sum").with_source("left", "a").with_source("right", "b"))
            .unwrap();

        let probe = Probe::new();
        let context = build(graph, &probe).unwrap();

        assert_eq!(context.node_contexts().len(), 4);
        assert_eq!(probe.creations(), 4);
        assert_eq!(context.node_context("read").unwrap().reference_count(), 2);
    }

    #[test]
    fn test_cycle_fails() {
        let mut graph = Graph::new("cycle");
        graph.add_node(Node::new("a", "Sum").with_source("input", "b")).unwrap();
        graph.add_node(Node::new("b", "Sum").with_source("input", "a")).unwrap();

        let probe = Probe::new();
        let err = build(graph, &probe).unwrap_err();

        assert!(matches!(err, BuildError::CyclicGraph { ref node } if node == "a"));
        assert_eq!(probe.computations(), 0);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut graph = Graph::new("self");
        graph.add_node(Node::new("a", "Sum").with_source("input", "a")).unwrap();

        assert!(matches!(build(graph, &Probe::new()), Err(BuildError::CyclicGraph { .. })));
    }

    #[test]
    fn test_unresolved_source() {
        let mut graph = Graph::new("dangling");
        graph.add_node(Node::new("a", "Sum").with_source("input", "ghost")).unwrap();

        let err = build(graph, &Probe::new()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::UnresolvedSource { node, source_name, missing }
                if node == "a" && source_name == "input" && missing == "ghost"
        ));
    }

    #[test]
    fn test_failed_build_disposes_what_was_built() {
        let mut graph = Graph::new("broken");
        graph.add_node(Node::new("read", "Read")).unwrap();
        graph.add_node(Node::new("bad", "Nope").with_source("input", "read")).unwrap();

        let probe = Probe::new();
        let err = build(graph, &probe).unwrap_err();

        assert!(matches!(err, BuildError::StageNotFound { ref stage, .. } if stage == "Nope"));
        assert_eq!(probe.disposals(), 1);
    }

    #[test]
    fn test_external_sources_do_not_count() {
        let mut graph = Graph::new("external");
        graph.add_node(Node::new("a", "Sum").with_external("file", "/tmp/a.tif")).unwrap();

        let context = build(graph, &Probe::new()).unwrap();
        let a = context.node_context("a").unwrap();

        assert!(a.is_output());
        assert_eq!(a.sources().external("file"), Some("/tmp/a.tif"));
    }

    #[test]
    fn test_dispose_order_and_idempotence() {
        let probe = Probe::new();
        let context = build(chain(), &probe).unwrap();
        let outputs = context.init_outputs().unwrap();

        context.node_context("write").unwrap().dispose();
        context.dispose();
        context.dispose();

        assert_eq!(probe.disposals(), 3);
        assert!(outputs[0].is_disposed());
        assert!(context.node_contexts().iter().all(NodeContext::is_disposed));
    }

    #[test]
    fn test_output_products_before_init() {
        let context = build(chain(), &Probe::new()).unwrap();

        assert!(context.output_products().is_err());
        context.init_outputs().unwrap();
        assert_eq!(context.output_products().unwrap().len(), 1);
    }

    /// Random DAGs: node `i` may consume any subset of nodes declared before
    /// it, then the declaration order is shuffled.
    fn dag() -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<usize>)> {
        (1usize..12)
            .prop_flat_map(|n| {
                let edges = (0..n)
                    .map(|i| proptest::collection::vec(any::<bool>(), i))
                    .collect::<Vec<_>>();
                (edges, Just((0..n).collect::<Vec<_>>()).prop_shuffle())
            })
            .prop_map(|(masks, order)| {
                let producers = masks
                    .into_iter()
                    .map(|mask| {
                        mask.into_iter()
                            .enumerate()
                            .filter(|&(_, used)| used)
                            .map(|(j, _)| j)
                            .collect()
                    })
                    .collect();
                (producers, order)
            })
    }

    proptest! {
        #[test]
        fn test_reference_count_is_in_degree((producers, order) in dag()) {
            let mut graph = Graph::new("random");
            for &i in &order {
                let mut node = Node::new(format!("n{i}"), "Sum");
                for &j in &producers[i] {
                    node = node.with_source(format!("in{j}"), format!("n{j}"));
                }
                graph.add_node(node).unwrap();
            }

            let context = build(graph, &Probe::new()).unwrap();
            prop_assert_eq!(context.node_contexts().len(), producers.len());

            for i in 0..producers.len() {
                let in_degree = producers.iter().filter(|p| p.contains(&i)).count();
                let ctx = context.node_context(&format!("n{i}")).unwrap();
                prop_assert_eq!(ctx.reference_count(), in_degree);
                prop_assert_eq!(ctx.is_output(), in_degree == 0);
            }
        }
    }
}
