//! Graph delta types
//!
//! Nodes and relationships captured from write-path query results, in the
//! exact shape the streaming `data` events carry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node touched by a write, keyed by the store's element id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(rename = "Node ID")]
    pub node_id: String,
    #[serde(rename = "Labels")]
    pub labels: Vec<String>,
    #[serde(rename = "Properties")]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// A relationship touched by a write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRelationship {
    #[serde(rename = "Relationship ID")]
    pub relationship_id: String,
    #[serde(rename = "Type")]
    pub rel_type: String,
    #[serde(rename = "Properties")]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "Start Node ID")]
    pub start_node_id: String,
    #[serde(rename = "End Node ID")]
    pub end_node_id: String,
}

/// Deduplicated set of touched nodes and relationships
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDelta {
    #[serde(rename = "Nodes")]
    pub nodes: Vec<GraphNode>,
    #[serde(rename = "Relationships")]
    pub relationships: Vec<GraphRelationship>,
}

impl GraphDelta {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }

    /// Count of nodes carrying a given label
    pub fn count_label(&self, label: &str) -> usize {
        self.nodes.iter().filter(|n| n.labels.iter().any(|l| l == label)).count()
    }
}

/// One sub-batch of a streamed write, with its position in the stream
#[derive(Debug, Clone)]
pub struct GraphBatch {
    pub delta: GraphDelta,
    pub batch: usize,
    pub total_batches: usize,
}

/// Accumulates touched nodes/relationships across queries, dropping
/// duplicates and empty nodes the way the delta consumers expect.
#[derive(Debug, Default)]
pub struct DeltaCollector {
    nodes: BTreeMap<String, GraphNode>,
    relationships: BTreeMap<String, GraphRelationship>,
}

impl DeltaCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: GraphNode) {
        if self.nodes.contains_key(&node.node_id) {
            return;
        }
        if node.labels.is_empty() && node.properties.is_empty() {
            return;
        }
        self.nodes.insert(node.node_id.clone(), node);
    }

    pub fn add_relationship(&mut self, rel: GraphRelationship) {
        self.relationships.entry(rel.relationship_id.clone()).or_insert(rel);
    }

    pub fn merge(&mut self, delta: &GraphDelta) {
        for node in &delta.nodes {
            self.add_node(node.clone());
        }
        for rel in &delta.relationships {
            self.add_relationship(rel.clone());
        }
    }

    pub fn into_delta(self) -> GraphDelta {
        GraphDelta {
            nodes: self.nodes.into_values().collect(),
            relationships: self.relationships.into_values().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, label: &str) -> GraphNode {
        let mut properties = serde_json::Map::new();
        properties.insert("name".into(), serde_json::json!("x"));
        GraphNode { node_id: id.to_string(), labels: vec![label.to_string()], properties }
    }

    #[test]
    fn test_collector_deduplicates_nodes() {
        let mut collector = DeltaCollector::new();
        collector.add_node(node("4:abc:1", "Table"));
        collector.add_node(node("4:abc:1", "Table"));
        collector.add_node(node("4:abc:2", "Column"));

        let delta = collector.into_delta();
        assert_eq!(delta.nodes.len(), 2);
        assert_eq!(delta.count_label("Table"), 1);
    }

    #[test]
    fn test_collector_drops_empty_nodes() {
        let mut collector = DeltaCollector::new();
        collector.add_node(GraphNode {
            node_id: "4:abc:9".into(),
            labels: vec![],
            properties: serde_json::Map::new(),
        });
        assert!(collector.into_delta().is_empty());
    }

    #[test]
    fn test_delta_event_field_names() {
        let mut collector = DeltaCollector::new();
        collector.add_node(node("4:abc:1", "Table"));
        let value = serde_json::to_value(collector.into_delta()).unwrap();
        assert!(value.get("Nodes").is_some());
        assert!(value.get("Relationships").is_some());
        assert!(value["Nodes"][0].get("Node ID").is_some());
    }
}
