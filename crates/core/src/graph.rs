use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use anyhow::{bail, Result};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GraphValidationError;

/// Free-form per-node configuration carried through to pipeline build.
pub type NodeConfig = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Camera,
    VideoFile,
    ImageFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    StreamTap,
    SaveVideo,
    SaveImage,
    TerminalOutput,
}

impl SinkKind {
    /// Sinks that hang off the main path rather than terminating it.
    pub fn is_side_tap(self) -> bool {
        !matches!(self, SinkKind::TerminalOutput)
    }
}

/// What a graph node is: a frame producer, a processing stage, or a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Source {
        source: SourceKind,
        #[serde(default)]
        config: NodeConfig,
    },
    Stage {
        stage: String,
        #[serde(default)]
        config: NodeConfig,
    },
    Sink {
        sink: SinkKind,
        #[serde(default)]
        config: NodeConfig,
    },
}

impl NodeKind {
    pub fn config(&self) -> &NodeConfig {
        match self {
            NodeKind::Source { config, .. }
            | NodeKind::Stage { config, .. }
            | NodeKind::Sink { config, .. } => config,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::Source { .. })
    }

    pub fn source_kind(&self) -> Option<SourceKind> {
        match self {
            NodeKind::Source { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn sink_kind(&self) -> Option<SinkKind> {
        match self {
            NodeKind::Sink { sink, .. } => Some(*sink),
            _ => None,
        }
    }

    pub fn stage_id(&self) -> Option<&str> {
        match self {
            NodeKind::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// A directed port-to-port connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub id: String,
    pub source_port: String,
    pub target_port: String,
}

/// The pipeline description: a directed graph of sources, stages and sinks.
///
/// Node identity is the string id; `node_ids` maps ids to petgraph indices.
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    graph: StableDiGraph<GraphNode, GraphEdge>,
    node_ids: HashMap<String, NodeIndex>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: GraphNode) -> Result<NodeIndex> {
        if self.node_ids.contains_key(&node.id) {
            bail!("duplicate node id: {}", node.id);
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.node_ids.insert(id, idx);
        Ok(idx)
    }

    pub fn add_edge(&mut self, from: &str, to: &str, edge: GraphEdge) -> Result<EdgeIndex> {
        let from_idx = match self.node_ids.get(from) {
            Some(idx) => *idx,
            None => bail!("unknown source node: {from}"),
        };
        let to_idx = match self.node_ids.get(to) {
            Some(idx) => *idx,
            None => bail!("unknown target node: {to}"),
        };
        Ok(self.graph.add_edge(from_idx, to_idx, edge))
    }

    pub fn node(&self, idx: NodeIndex) -> Option<&GraphNode> {
        self.graph.node_weight(idx)
    }

    pub fn node_index(&self, id: &str) -> Option<NodeIndex> {
        self.node_ids.get(id).copied()
    }

    pub fn node_by_id(&self, id: &str) -> Option<&GraphNode> {
        self.node_index(id).and_then(|idx| self.node(idx))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.graph.node_weights()
    }

    /// The single source node, if the graph has exactly one.
    pub fn source(&self) -> Option<&GraphNode> {
        let mut sources = self.nodes().filter(|n| n.kind.is_source());
        let first = sources.next()?;
        if sources.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Outgoing edges of a node as `(edge, target node)`, sorted by edge id.
    pub fn edges_from(&self, id: &str) -> Vec<(&GraphEdge, &GraphNode)> {
        let Some(idx) = self.node_index(id) else {
            return Vec::new();
        };
        let mut edges: Vec<(&GraphEdge, &GraphNode)> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter_map(|e| self.node(e.target()).map(|n| (e.weight(), n)))
            .collect();
        edges.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        edges
    }

    /// All edges as `(source id, edge, target id)`, sorted by edge id.
    pub fn edges(&self) -> Vec<(&str, &GraphEdge, &str)> {
        let mut edges: Vec<(&str, &GraphEdge, &str)> = self
            .graph
            .edge_references()
            .filter_map(|e| {
                let from = self.node(e.source())?;
                let to = self.node(e.target())?;
                Some((from.id.as_str(), e.weight(), to.id.as_str()))
            })
            .collect();
        edges.sort_by(|a, b| a.1.id.cmp(&b.1.id));
        edges
    }

    /// Node ids reachable from `start` by following outgoing edges.
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut reached = HashSet::new();
        let Some(start_idx) = self.node_index(start) else {
            return reached;
        };
        let mut queue = VecDeque::from([start_idx]);
        reached.insert(start.to_string());
        while let Some(idx) = queue.pop_front() {
            for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(node) = self.node(neighbor) {
                    if reached.insert(node.id.clone()) {
                        queue.push_back(neighbor);
                    }
                }
            }
        }
        reached
    }

    /// Validate the graph, collecting every failure found.
    pub fn validate(&self) -> Result<(), GraphValidationError> {
        let mut errors = Vec::new();
        self.check_acyclic(&mut errors);
        self.check_single_source_reachability(&mut errors);
        self.check_single_input_per_port(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GraphValidationError::new(errors))
        }
    }

    fn sorted_node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.node_ids.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Three-color DFS cycle check. Reports the first cycle found, naming a
    /// node on it.
    fn check_acyclic(&self, errors: &mut Vec<String>) {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> = self
            .sorted_node_ids()
            .into_iter()
            .map(|id| (id, Color::White))
            .collect();

        // Iterative DFS; a frame is re-pushed once so it can be blackened
        // after its children are done.
        for root in self.sorted_node_ids() {
            if colors[root] != Color::White {
                continue;
            }
            let mut stack: Vec<(&str, bool)> = vec![(root, false)];
            while let Some((id, children_done)) = stack.pop() {
                if children_done {
                    colors.insert(id, Color::Black);
                    continue;
                }
                if colors[id] == Color::Black {
                    continue;
                }
                colors.insert(id, Color::Gray);
                stack.push((id, true));
                for (_, target) in self.edges_from(id) {
                    match colors[target.id.as_str()] {
                        Color::Gray => {
                            errors.push(format!("cycle detected involving node '{}'", target.id));
                            return;
                        }
                        Color::White => stack.push((target.id.as_str(), false)),
                        Color::Black => {}
                    }
                }
            }
        }
    }

    fn check_single_source_reachability(&self, errors: &mut Vec<String>) {
        let mut source_ids: Vec<&str> = self
            .nodes()
            .filter(|n| n.kind.is_source())
            .map(|n| n.id.as_str())
            .collect();
        source_ids.sort_unstable();

        match source_ids.len() {
            0 => {
                errors.push("graph must have exactly one source node, found none".to_string());
            }
            1 => {
                let reached = self.reachable_from(source_ids[0]);
                for id in self.sorted_node_ids() {
                    if !reached.contains(id) {
                        errors.push(format!("node '{id}' is not reachable from the source"));
                    }
                }
            }
            n => {
                errors.push(format!(
                    "graph must have exactly one source node, found {n}: {}",
                    source_ids.join(", ")
                ));
            }
        }
    }

    fn check_single_input_per_port(&self, errors: &mut Vec<String>) {
        let mut fan_in: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for (_, edge, target) in self.edges() {
            *fan_in.entry((target, edge.target_port.as_str())).or_default() += 1;
        }
        for ((node, port), count) in fan_in {
            if count > 1 {
                errors.push(format!(
                    "node '{node}' input port '{port}' has {count} incoming connections, expected at most 1"
                ));
            }
        }
    }
}

// Serde goes through a flat node/connection list so graphs round-trip as the
// documents clients actually send.
#[derive(Serialize, Deserialize)]
struct PipelineGraphSerde {
    nodes: Vec<GraphNode>,
    connections: Vec<ConnectionSerde>,
}

#[derive(Serialize, Deserialize)]
struct ConnectionSerde {
    id: String,
    source_node: String,
    source_port: String,
    target_node: String,
    target_port: String,
}

impl Serialize for PipelineGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut nodes: Vec<GraphNode> = self.nodes().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let connections = self
            .edges()
            .into_iter()
            .map(|(from, edge, to)| ConnectionSerde {
                id: edge.id.clone(),
                source_node: from.to_string(),
                source_port: edge.source_port.clone(),
                target_node: to.to_string(),
                target_port: edge.target_port.clone(),
            })
            .collect();

        PipelineGraphSerde { nodes, connections }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineGraph {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = PipelineGraphSerde::deserialize(deserializer)?;
        let mut graph = PipelineGraph::new();
        for node in raw.nodes {
            graph.add_node(node).map_err(D::Error::custom)?;
        }
        for conn in raw.connections {
            graph
                .add_edge(
                    &conn.source_node,
                    &conn.target_node,
                    GraphEdge {
                        id: conn.id,
                        source_port: conn.source_port,
                        target_port: conn.target_port,
                    },
                )
                .map_err(D::Error::custom)?;
        }
        Ok(graph)
    }
}
