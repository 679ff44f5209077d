//! Batch planning
//!
//! Groups analysable nodes into LLM batches under a shared token ceiling.
//! Rules: a parent node first flushes the accumulated leaf batch, then
//! forms a singleton batch of its own (it must wait for child summaries);
//! a leaf that would blow the budget flushes the accumulator first; a
//! final flush closes the plan.

use serde::Serialize;

use super::node::{NodeArena, NodeId};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRange {
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DmlRange {
    pub start_line: u32,
    pub end_line: u32,
    #[serde(rename = "type")]
    pub kind: String,
}

/// One LLM call's worth of nodes
#[derive(Debug, Clone)]
pub struct AnalysisBatch {
    pub batch_id: usize,
    pub nodes: Vec<NodeId>,
    pub ranges: Vec<LineRange>,
    pub progress_line: u32,
    pub dml_ranges: Vec<DmlRange>,
}

impl AnalysisBatch {
    /// Aligned (code, context) strings for the prompt: compact code per
    /// node (raw for leaves, child-summary-substituted for parents) and
    /// the ancestor-context chain per node.
    pub fn build_payload(&self, arena: &NodeArena, max_context_tokens: usize) -> (String, String) {
        let mut code_parts = Vec::with_capacity(self.nodes.len());
        let mut context_parts = Vec::with_capacity(self.nodes.len());
        for &id in &self.nodes {
            code_parts.push(arena.compact_code(id));
            context_parts.push(arena.ancestor_context(id, max_context_tokens));
        }
        (code_parts.join("\n\n"), context_parts.join("\n\n"))
    }

    /// "L3-7, L9-9" label for failure reports
    pub fn node_ranges_label(&self) -> String {
        self.ranges
            .iter()
            .map(|r| format!("L{}-{}", r.start_line, r.end_line))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct BatchPlanner {
    token_limit: usize,
}

impl BatchPlanner {
    pub fn new(token_limit: usize) -> Self {
        Self { token_limit }
    }

    pub fn plan(&self, arena: &NodeArena, include_dml_ranges: bool) -> Vec<AnalysisBatch> {
        let mut batches: Vec<AnalysisBatch> = Vec::new();
        let mut current: Vec<NodeId> = Vec::new();
        let mut current_tokens = 0usize;
        let mut batch_id = 1usize;

        for id in arena.ids() {
            let node = arena.node(id);
            if !node.analyzable {
                continue;
            }

            // Parents run alone after their children complete
            if node.has_children {
                if !current.is_empty() {
                    tracing::debug!(
                        "Batch #{}: {} leaf nodes ({}/{} tokens)",
                        batch_id,
                        current.len(),
                        current_tokens,
                        self.token_limit
                    );
                    batches.push(self.create_batch(
                        batch_id,
                        std::mem::take(&mut current),
                        arena,
                        include_dml_ranges,
                    ));
                    batch_id += 1;
                    current_tokens = 0;
                }

                tracing::debug!(
                    "Batch #{}: parent node alone (lines {}~{}, {} tokens)",
                    batch_id,
                    node.start_line,
                    node.end_line,
                    node.token
                );
                batches.push(self.create_batch(batch_id, vec![id], arena, include_dml_ranges));
                batch_id += 1;
                continue;
            }

            if !current.is_empty() && current_tokens + node.token > self.token_limit {
                tracing::debug!(
                    "Batch #{}: token ceiling reached ({}/{})",
                    batch_id,
                    current_tokens,
                    self.token_limit
                );
                batches.push(self.create_batch(
                    batch_id,
                    std::mem::take(&mut current),
                    arena,
                    include_dml_ranges,
                ));
                batch_id += 1;
                current_tokens = 0;
            }

            current_tokens += node.token;
            current.push(id);
        }

        if !current.is_empty() {
            batches.push(self.create_batch(batch_id, current, arena, include_dml_ranges));
        }

        batches
    }

    fn create_batch(
        &self,
        batch_id: usize,
        nodes: Vec<NodeId>,
        arena: &NodeArena,
        include_dml_ranges: bool,
    ) -> AnalysisBatch {
        let ranges: Vec<LineRange> = nodes
            .iter()
            .map(|&id| {
                let n = arena.node(id);
                LineRange { start_line: n.start_line, end_line: n.end_line }
            })
            .collect();
        let progress_line = ranges.iter().map(|r| r.end_line).max().unwrap_or(0);

        let dml_ranges = if include_dml_ranges {
            nodes
                .iter()
                .map(|&id| arena.node(id))
                .filter(|n| n.dml)
                .map(|n| DmlRange {
                    start_line: n.start_line,
                    end_line: n.end_line,
                    kind: n.node_type.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };

        AnalysisBatch { batch_id, nodes, ranges, progress_line, dml_ranges }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::node::StatementNode;

    fn leaf(start: u32, token: usize, dml: bool) -> StatementNode {
        StatementNode {
            start_line: start,
            end_line: start,
            node_type: if dml { "SELECT".into() } else { "ASSIGNMENT".into() },
            token,
            analyzable: true,
            dml,
            lines: vec![(start, "stmt".into())],
            ..Default::default()
        }
    }

    #[test]
    fn test_leaves_accumulate_under_budget() {
        let mut arena = NodeArena::new();
        arena.push(leaf(1, 100, false));
        arena.push(leaf(2, 100, false));
        arena.push(leaf(3, 100, false));

        let batches = BatchPlanner::new(1000).plan(&arena, false);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].nodes.len(), 3);
        assert_eq!(batches[0].progress_line, 3);
    }

    #[test]
    fn test_token_ceiling_flushes_accumulator() {
        let mut arena = NodeArena::new();
        arena.push(leaf(1, 600, false));
        arena.push(leaf(2, 600, false));

        let batches = BatchPlanner::new(1000).plan(&arena, false);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].nodes.len(), 1);
        assert_eq!(batches[1].nodes.len(), 1);
    }

    #[test]
    fn test_parent_forms_singleton_batch_after_flush() {
        let mut arena = NodeArena::new();
        arena.push(leaf(1, 100, false));
        let mut parent = leaf(2, 200, false);
        parent.end_line = 5;
        parent.node_type = "IF".into();
        parent.has_children = true;
        arena.push(parent);
        arena.push(leaf(6, 100, false));

        let batches = BatchPlanner::new(1000).plan(&arena, false);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].nodes.len(), 1); // flushed leaf
        assert_eq!(batches[1].nodes.len(), 1); // parent alone
        assert_eq!(batches[2].nodes.len(), 1); // trailing leaf
        assert_eq!(batches[1].ranges[0].end_line, 5);
    }

    #[test]
    fn test_non_analyzable_skipped() {
        let mut arena = NodeArena::new();
        let mut spec = leaf(1, 100, false);
        spec.analyzable = false;
        arena.push(spec);

        let batches = BatchPlanner::new(1000).plan(&arena, false);
        assert!(batches.is_empty());
    }

    #[test]
    fn test_dml_ranges_attached_when_requested() {
        let mut arena = NodeArena::new();
        arena.push(leaf(1, 100, true));
        arena.push(leaf(2, 100, false));

        let batches = BatchPlanner::new(1000).plan(&arena, true);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].dml_ranges.len(), 1);
        assert_eq!(batches[0].dml_ranges[0].kind, "SELECT");
    }

    #[test]
    fn test_ranges_label() {
        let mut arena = NodeArena::new();
        arena.push(leaf(3, 10, false));
        arena.push(leaf(7, 10, false));
        let batches = BatchPlanner::new(1000).plan(&arena, false);
        assert_eq!(batches[0].node_ranges_label(), "L3-3, L7-7");
    }
}
