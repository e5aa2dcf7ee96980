//! Dependency graph construction and topological layering
//!
//! Turns the editor's edge list into adjacency and in-degree maps, then peels
//! the graph into layers: every node in a layer depends only on nodes from
//! earlier layers, so a layer can run concurrently.

use std::collections::{HashMap, HashSet};

use crate::error::{NodeEngineError, Result};
use crate::types::{GraphEdge, GraphNode, NodeId};

/// One outgoing dependency of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub target_id: NodeId,
    pub source_handle: String,
    pub target_handle: String,
}

/// Adjacency and in-degree view of a workflow graph
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node ids in the order the caller supplied them
    order: Vec<NodeId>,
    adjacency: HashMap<NodeId, Vec<Dependent>>,
    in_degree: HashMap<NodeId, usize>,
}

impl DependencyGraph {
    /// Build the graph from nodes and edges
    ///
    /// Every edge endpoint must name a node in `nodes`.
    pub fn build(nodes: &[GraphNode], edges: &[GraphEdge]) -> Result<Self> {
        let mut order = Vec::with_capacity(nodes.len());
        let mut adjacency: HashMap<NodeId, Vec<Dependent>> = HashMap::new();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();

        for node in nodes {
            if adjacency.contains_key(&node.id) {
                log::warn!("Duplicate node id '{}' ignored", node.id);
                continue;
            }
            order.push(node.id.clone());
            adjacency.insert(node.id.clone(), Vec::new());
            in_degree.insert(node.id.clone(), 0);
        }

        for edge in edges {
            if !in_degree.contains_key(&edge.target) {
                return Err(NodeEngineError::NotFound(format!(
                    "edge target node '{}'",
                    edge.target
                )));
            }
            let Some(dependents) = adjacency.get_mut(&edge.source) else {
                return Err(NodeEngineError::NotFound(format!(
                    "edge source node '{}'",
                    edge.source
                )));
            };
            dependents.push(Dependent {
                target_id: edge.target.clone(),
                source_handle: edge.source_handle().to_string(),
                target_handle: edge.target_handle().to_string(),
            });
            if let Some(degree) = in_degree.get_mut(&edge.target) {
                *degree += 1;
            }
        }

        Ok(Self {
            order,
            adjacency,
            in_degree,
        })
    }

    /// Number of nodes in the graph
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Outgoing dependencies of a node
    pub fn dependents(&self, node_id: &str) -> &[Dependent] {
        self.adjacency
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of incoming edges of a node
    pub fn in_degree(&self, node_id: &str) -> usize {
        self.in_degree.get(node_id).copied().unwrap_or(0)
    }

    /// Partition the graph into execution layers
    ///
    /// Each pass takes every unvisited node whose remaining in-degree is zero.
    /// Within a layer nodes keep the caller's order, but that order carries no
    /// scheduling guarantee. Fails with [`NodeEngineError::Cycle`] naming every
    /// node that could not be placed.
    pub fn layers(&self) -> Result<Vec<Vec<NodeId>>> {
        let mut remaining = self.in_degree.clone();
        let mut visited: HashSet<NodeId> = HashSet::with_capacity(self.order.len());
        let mut layers = Vec::new();

        while visited.len() < self.order.len() {
            let layer: Vec<NodeId> = self
                .order
                .iter()
                .filter(|id| !visited.contains(*id))
                .filter(|id| remaining.get(id.as_str()).copied().unwrap_or(0) == 0)
                .cloned()
                .collect();

            if layer.is_empty() {
                let node_ids: Vec<NodeId> = self
                    .order
                    .iter()
                    .filter(|id| !visited.contains(*id))
                    .cloned()
                    .collect();
                return Err(NodeEngineError::Cycle { node_ids });
            }

            for id in &layer {
                visited.insert(id.clone());
                for dependent in self.dependents(id) {
                    if let Some(degree) = remaining.get_mut(&dependent.target_id) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }

            log::debug!("Layer {}: {:?}", layers.len(), layer);
            layers.push(layer);
        }

        Ok(layers)
    }
}

/// Build the dependency graph and compute its layers in one step
pub fn compute_layers(nodes: &[GraphNode], edges: &[GraphEdge]) -> Result<Vec<Vec<NodeId>>> {
    DependencyGraph::build(nodes, edges)?.layers()
}
