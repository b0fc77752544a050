use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::GraphValidationError;
use crate::graph::{NodeConfig, PipelineGraph, SinkKind};

/// A side sink hanging off the main path at `attach_point`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideTap {
    pub node_id: String,
    pub sink: SinkKind,
    pub attach_point: String,
    pub source_port: String,
    pub target_port: String,
}

/// Compiled form of a validated graph: the linear stage path the runtime
/// walks plus the side sinks observing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Node ids from the source to the terminal point, in execution order.
    pub main_path: Vec<String>,
    pub side_taps: Vec<SideTap>,
    /// Per-node configuration for every node in the graph.
    pub node_configs: HashMap<String, NodeConfig>,
}

impl ExecutionPlan {
    pub fn source_id(&self) -> Option<&str> {
        self.main_path.first().map(String::as_str)
    }

    pub fn node_config(&self, node_id: &str) -> Option<&NodeConfig> {
        self.node_configs.get(node_id)
    }
}

/// Compile a graph into an [`ExecutionPlan`].
///
/// Validates first, then resolves the main path: source to the terminal
/// output sink when one exists, otherwise the longest path from the source
/// to a side-tap attach point. Traversal explores outgoing edges in edge-id
/// order, so compilation is deterministic for a given graph.
pub fn compile(graph: &PipelineGraph) -> Result<ExecutionPlan, GraphValidationError> {
    graph.validate()?;

    let source = graph
        .source()
        .ok_or_else(|| GraphValidationError::single("graph has no source node"))?;

    let main_path = match terminal_sink_id(graph) {
        Some(terminal) => {
            dfs_path(graph, &source.id, &terminal).ok_or_else(|| {
                GraphValidationError::single(format!(
                    "no path from source '{}' to terminal output '{terminal}'",
                    source.id
                ))
            })?
        }
        None => longest_tap_path(graph, &source.id)?,
    };

    let on_main: HashSet<&str> = main_path.iter().map(String::as_str).collect();

    // Side taps attach wherever a main-path node feeds a non-terminal sink.
    let mut side_taps = Vec::new();
    for (from, edge, to) in graph.edges() {
        let Some(target) = graph.node_by_id(to) else {
            continue;
        };
        let Some(sink) = target.kind.sink_kind() else {
            continue;
        };
        if sink.is_side_tap() && on_main.contains(from) {
            side_taps.push(SideTap {
                node_id: to.to_string(),
                sink,
                attach_point: from.to_string(),
                source_port: edge.source_port.clone(),
                target_port: edge.target_port.clone(),
            });
        }
    }

    let node_configs = graph
        .nodes()
        .map(|n| (n.id.clone(), n.kind.config().clone()))
        .collect();

    Ok(ExecutionPlan {
        main_path,
        side_taps,
        node_configs,
    })
}

/// The terminal output sink, smallest node id first when several exist.
fn terminal_sink_id(graph: &PipelineGraph) -> Option<String> {
    let mut terminals: Vec<&str> = graph
        .nodes()
        .filter(|n| n.kind.sink_kind() == Some(SinkKind::TerminalOutput))
        .map(|n| n.id.as_str())
        .collect();
    terminals.sort_unstable();
    terminals.first().map(|s| s.to_string())
}

/// Depth-first path from `start` to `goal`, trying edges in edge-id order.
/// Sinks other than the goal are never traversed through.
fn dfs_path(graph: &PipelineGraph, start: &str, goal: &str) -> Option<Vec<String>> {
    fn visit(
        graph: &PipelineGraph,
        current: &str,
        goal: &str,
        path: &mut Vec<String>,
        visiting: &mut HashSet<String>,
    ) -> bool {
        path.push(current.to_string());
        if current == goal {
            return true;
        }
        visiting.insert(current.to_string());
        for (_, target) in graph.edges_from(current) {
            if visiting.contains(&target.id) {
                continue;
            }
            if target.kind.sink_kind().is_some() && target.id != goal {
                continue;
            }
            if visit(graph, &target.id, goal, path, visiting) {
                return true;
            }
        }
        path.pop();
        false
    }

    let mut path = Vec::new();
    let mut visiting = HashSet::new();
    visit(graph, start, goal, &mut path, &mut visiting).then_some(path)
}

/// Without a terminal output the main path runs to the side-tap attach point
/// with the longest source path, ties broken by attach-point id order.
fn longest_tap_path(
    graph: &PipelineGraph,
    source_id: &str,
) -> Result<Vec<String>, GraphValidationError> {
    let mut attach_points: Vec<&str> = graph
        .edges()
        .iter()
        .filter(|(_, _, to)| {
            graph
                .node_by_id(*to)
                .and_then(|n| n.kind.sink_kind())
                .is_some_and(SinkKind::is_side_tap)
        })
        .map(|(from, _, _)| *from)
        .collect();
    attach_points.sort_unstable();
    attach_points.dedup();

    let mut best: Option<Vec<String>> = None;
    for attach in attach_points {
        let Some(path) = dfs_path(graph, source_id, attach) else {
            continue;
        };
        if best.as_ref().is_none_or(|b| path.len() > b.len()) {
            best = Some(path);
        }
    }

    best.ok_or_else(|| {
        GraphValidationError::single(
            "graph has no terminal output sink and no side sink reachable from the source"
                .to_string(),
        )
    })
}
