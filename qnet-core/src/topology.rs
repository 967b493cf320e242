//! Station graph: names, kinds and ordered output links.

use std::collections::HashMap;

use serde::Serialize;

use crate::job::NodeId;

/// Shape of a station, fixing which sections it is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    Source,
    Sink,
    Queue,
    Delay,
    Router,
    ClassSwitch,
    Cache,
    Fork,
    Join,
    Place,
    Transition,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Sink => "sink",
            NodeKind::Queue => "queue",
            NodeKind::Delay => "delay",
            NodeKind::Router => "router",
            NodeKind::ClassSwitch => "class-switch",
            NodeKind::Cache => "cache",
            NodeKind::Fork => "fork",
            NodeKind::Join => "join",
            NodeKind::Place => "place",
            NodeKind::Transition => "transition",
        }
    }
}

/// Immutable directed graph of stations.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    names: Vec<String>,
    kinds: Vec<NodeKind>,
    outputs: Vec<Vec<NodeId>>,
    inputs: Vec<Vec<NodeId>>,
    by_name: HashMap<String, NodeId>,
}

impl Topology {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a station and returns its id. Name uniqueness is checked by the
    /// network builder.
    pub fn add_node(&mut self, name: impl Into<String>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.names.len());
        let name = name.into();
        self.by_name.insert(name.clone(), id);
        self.names.push(name);
        self.kinds.push(kind);
        self.outputs.push(Vec::new());
        self.inputs.push(Vec::new());
        id
    }

    pub fn add_link(&mut self, from: NodeId, to: NodeId) {
        self.outputs[from.0].push(to);
        self.inputs[to.0].push(from);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, node: NodeId) -> &str {
        &self.names[node.0]
    }

    pub fn kind(&self, node: NodeId) -> NodeKind {
        self.kinds[node.0]
    }

    /// Output stations in link order.
    pub fn outputs(&self, node: NodeId) -> &[NodeId] {
        &self.outputs[node.0]
    }

    /// Stations linking into `node`, in link order.
    pub fn inputs(&self, node: NodeId) -> &[NodeId] {
        &self.inputs[node.0]
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn is_sink(&self, node: NodeId) -> bool {
        self.kinds[node.0] == NodeKind::Sink
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node.0 < self.names.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> {
        (0..self.names.len()).map(NodeId)
    }
}
