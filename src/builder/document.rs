//! The JSON form of a graph description.
//!
//! ```json
//! {
//!   "id": "example",
//!   "header": {
//!     "target": "node2",
//!     "sources": [{ "name": "sourceProduct", "description": "first input" }],
//!     "parameters": [{ "name": "threshold", "type": "double" }]
//!   },
//!   "nodes": [
//!     {
//!       "id": "node1",
//!       "stage": "Threshold",
//!       "sources": { "input": "${sourceProduct}" },
//!       "parameters": { "threshold": "${threshold}" }
//!     }
//!   ]
//! }
//! ```
//!
//! A source is either a node id, `{ "refid": "<node id>" }`, or
//! `{ "external": "<value>" }`. `operator` and `configuration` are accepted as
//! aliases of `stage` and `parameters`.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::ConfigValue;
use crate::error::TemplateError;
use crate::graph::{Graph, Header, HeaderParameter, HeaderSource, Node, NodeSource};

#[derive(Debug, Deserialize)]
struct GraphDocument {
    id: String,
    #[serde(default)]
    header: HeaderDocument,
    #[serde(default)]
    nodes: Vec<NodeDocument>,
}

#[derive(Debug, Default, Deserialize)]
struct HeaderDocument {
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    sources: Vec<HeaderSourceDocument>,
    #[serde(default)]
    parameters: Vec<HeaderParameterDocument>,
}

#[derive(Debug, Deserialize)]
struct HeaderSourceDocument {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeaderParameterDocument {
    name: String,
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    #[serde(default)]
    description: Option<String>,
}

fn default_kind() -> String {
    "string".to_string()
}

#[derive(Debug, Deserialize)]
struct NodeDocument {
    id: String,
    #[serde(alias = "operator")]
    stage: String,
    #[serde(default)]
    sources: Map<String, Value>,
    #[serde(default, alias = "configuration")]
    parameters: Value,
}

fn node_source(node: &str, name: String, value: Value) -> Result<NodeSource, TemplateError> {
    let invalid = || TemplateError::InvalidSource {
        node: node.to_string(),
        source_name: name.clone(),
    };

    match value {
        Value::String(id) if !id.trim().is_empty() => Ok(NodeSource::node(name.clone(), id.trim())),
        Value::Object(mut map) => match (map.remove("refid"), map.remove("external")) {
            (Some(Value::String(id)), None) if !id.trim().is_empty() => Ok(NodeSource::node(name.clone(), id.trim())),
            (None, Some(Value::String(value))) => Ok(NodeSource::external(name.clone(), value)),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

/// Parses a graph description. Node ids must be unique.
pub fn parse_graph(text: &str) -> Result<Graph, TemplateError> {
    let document: GraphDocument = serde_json::from_str(text)?;

    let mut graph = Graph::new(document.id);
    graph.header = Header {
        target: document.header.target,
        sources: document
            .header
            .sources
            .into_iter()
            .map(|source| HeaderSource {
                name: source.name,
                description: source.description,
            })
            .collect(),
        parameters: document
            .header
            .parameters
            .into_iter()
            .map(|parameter| HeaderParameter {
                name: parameter.name,
                kind: parameter.kind,
                description: parameter.description,
            })
            .collect(),
    };

    for node in document.nodes {
        let sources = node
            .sources
            .into_iter()
            .map(|(name, value)| node_source(&node.id, name, value))
            .collect::<Result<Vec<_>, _>>()?;

        let configuration = match node.parameters {
            Value::Null => ConfigValue::empty(),
            value => ConfigValue::from(value),
        };

        graph.add_node(Node {
            id: node.id,
            stage: node.stage,
            sources,
            configuration,
        })?;
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SourceRef;

    #[test]
    fn test_parse_graph() {
        let text = r#"{
            "id": "g",
            "header": {
                "target": "b",
                "sources": [{ "name": "sourceProduct" }],
                "parameters": [{ "name": "threshold", "type": "double" }, { "name": "label" }]
            },
            "nodes": [
                { "id": "a", "operator": "Read", "configuration": { "file": "x.tif" } },
                { "id": "b", "stage": "Sum", "sources": { "left": "a", "right": { "refid": "a" }, "file": { "external": "y.tif" } } }
            ]
        }"#;

        let graph = parse_graph(text).unwrap();

        assert_eq!(graph.id, "g");
        assert_eq!(graph.header.target.as_deref(), Some("b"));
        assert_eq!(graph.header.parameters[1].kind, "string");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.node("a").unwrap().stage, "Read");
        assert_eq!(graph.node("a").unwrap().configuration_value("file"), Some("x.tif"));

        let b = graph.node("b").unwrap();
        assert!(b.configuration.is_empty_map());
        assert_eq!(b.source_named("left").unwrap().node_id(), Some("a"));
        assert_eq!(b.source_named("right").unwrap().node_id(), Some("a"));
        assert_eq!(
            b.source_named("file").unwrap().source,
            SourceRef::External("y.tif".into())
        );
    }

    #[test]
    fn test_parse_keeps_source_order() {
        let text = r#"{
            "id": "g",
            "nodes": [
                { "id": "a", "stage": "Read" },
                { "id": "b", "stage": "Read" },
                { "id": "c", "stage": "Sum", "sources": { "slave": "b", "master": "a", "extra": { "external": "z" } } }
            ]
        }"#;

        let graph = parse_graph(text).unwrap();
        let c = graph.node("c").unwrap();

        let names: Vec<_> = c.sources.iter().map(|source| source.name.as_str()).collect();
        assert_eq!(names, ["slave", "master", "extra"]);
        assert_eq!(c.source(0).unwrap().node_id(), Some("b"));
        assert_eq!(c.source(1).unwrap().node_id(), Some("a"));
    }

    #[test]
    fn test_parse_duplicate_node() {
        let text = r#"{ "id": "g", "nodes": [ { "id": "a", "stage": "Read" }, { "id": "a", "stage": "Read" } ] }"#;
        assert!(matches!(parse_graph(text), Err(TemplateError::Graph(_))));
    }

    #[test]
    fn test_parse_invalid_source() {
        let text = r#"{ "id": "g", "nodes": [ { "id": "a", "stage": "Sum", "sources": { "in": 3 } } ] }"#;
        let err = parse_graph(text).unwrap_err();

        assert!(matches!(err, TemplateError::InvalidSource { node, source_name } if node == "a" && source_name == "in"));
    }

    #[test]
    fn test_parse_syntax_error() {
        assert!(matches!(parse_graph("{ not json"), Err(TemplateError::Syntax(_))));
    }
}
