//! Caller-supplied compute graph
//!
//! The engine treats a graph as an opaque value it hands to the graph compiler.
//! It only reads the declared signature (to decide whether the graph is
//! shape-polymorphic) and writes one correlation attribute.

use crate::tensor::TensorDesc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One operator in a graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op_type: String,
}

/// Unoptimized compute graph as supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeGraph {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub inputs: Vec<TensorDesc>,
    #[serde(default)]
    pub outputs: Vec<TensorDesc>,
    #[serde(default)]
    pub subgraphs: Vec<ComputeGraph>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl ComputeGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, desc: TensorDesc) -> Self {
        self.inputs.push(desc);
        self
    }

    pub fn with_output(mut self, desc: TensorDesc) -> Self {
        self.outputs.push(desc);
        self
    }

    pub fn with_node(mut self, name: impl Into<String>, op_type: impl Into<String>) -> Self {
        self.nodes.push(Node {
            name: name.into(),
            op_type: op_type.into(),
        });
        self
    }

    pub fn with_subgraph(mut self, subgraph: ComputeGraph) -> Self {
        self.subgraphs.push(subgraph);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Set an attribute on this graph and every nested subgraph
    pub fn stamp_recursive(&mut self, key: &str, value: &str) {
        self.attrs.insert(key.to_string(), value.to_string());
        for sub in &mut self.subgraphs {
            sub.stamp_recursive(key, value);
        }
    }

    /// Whether any signature in the graph tree carries an unknown dimension
    pub fn is_shape_polymorphic(&self) -> bool {
        self.inputs.iter().chain(self.outputs.iter()).any(|d| !d.is_static())
            || self.subgraphs.iter().any(ComputeGraph::is_shape_polymorphic)
    }

    /// Node count including subgraphs
    pub fn total_nodes(&self) -> usize {
        self.nodes.len() + self.subgraphs.iter().map(ComputeGraph::total_nodes).sum::<usize>()
    }
}
