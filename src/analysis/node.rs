//! Flattened AST node arena
//!
//! All nodes of one file live in a single vector; parent/child links are
//! indices, never owning references. The immutable structure is built
//! once during collection; per-node runtime state (summary, context, ok
//! flag, completion and context-ready signals) uses interior mutability so
//! concurrent Phase 2 batch tasks can share the arena behind an `Arc`.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::utils::{SignalFlag, estimate_tokens};

pub type NodeId = usize;

/// How a statement accesses a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableAccessKind {
    #[default]
    Read,
    Write,
    Execute,
}

impl TableAccessKind {
    pub fn edge_type(&self) -> &'static str {
        match self {
            Self::Read => "FROM",
            Self::Write => "WRITES",
            Self::Execute => "EXECUTE",
        }
    }

    /// DB_LINK edge mode for remote references
    pub fn link_mode(&self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write | Self::Execute => "w",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "write" => Self::Write,
            "execute" => Self::Execute,
            _ => Self::Read,
        }
    }
}

/// A table reference collected from a statement body in Phase 1 and
/// turned into graph edges by Phase 2.
#[derive(Debug, Clone, Default)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
    pub access: TableAccessKind,
    /// Non-empty for `table@dblink` remote references
    pub db_link: String,
    /// Referenced columns known from DDL metadata
    pub columns: Vec<String>,
}

/// A join-equality FK inference collected in Phase 1
#[derive(Debug, Clone, Default)]
pub struct InferredFk {
    pub src_schema: Option<String>,
    pub src_table: String,
    pub src_column: String,
    pub tgt_schema: Option<String>,
    pub tgt_table: String,
    pub tgt_column: String,
}

/// One flattened AST node
#[derive(Debug, Clone, Default)]
pub struct StatementNode {
    pub id: NodeId,
    pub start_line: u32,
    pub end_line: u32,
    pub node_type: String,
    pub token: usize,
    pub has_children: bool,
    pub analyzable: bool,

    /// Unit (procedure/function/trigger) this node belongs to
    pub unit_key: Option<String>,
    pub unit_name: Option<String>,
    pub unit_kind: Option<String>,

    pub schema_name: Option<String>,
    /// DML statement (SELECT/INSERT/UPDATE/DELETE/MERGE)
    pub dml: bool,

    /// (line_no, text) pairs covering the node's span
    pub lines: Vec<(u32, String)>,

    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,

    /// Table references collected from the statement body (Phase 1)
    pub table_refs: Vec<TableRef>,
    /// Join-equality FK inferences collected from the statement body
    pub inferred_fks: Vec<InferredFk>,
}

/// Mutable per-node state shared across batch tasks
#[derive(Debug, Default)]
pub struct NodeRuntime {
    summary: Mutex<Option<String>>,
    context: Mutex<Option<String>>,
    ok: AtomicBool,
    pub completion: SignalFlag,
    pub context_ready: SignalFlag,
}

/// Arena owning all nodes of one file
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<StatementNode>,
    runtime: Vec<NodeRuntime>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut node: StatementNode) -> NodeId {
        let id = self.nodes.len();
        node.id = id;
        self.nodes.push(node);
        let runtime = NodeRuntime { ok: AtomicBool::new(true), ..Default::default() };
        self.runtime.push(runtime);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &StatementNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut StatementNode {
        &mut self.nodes[id]
    }

    pub fn runtime(&self, id: NodeId) -> &NodeRuntime {
        &self.runtime[id]
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        0..self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatementNode> {
        self.nodes.iter()
    }

    // ------------------------------------------------------------------
    // Runtime state
    // ------------------------------------------------------------------

    pub fn set_summary(&self, id: NodeId, summary: &str) {
        *self.runtime[id].summary.lock().expect("summary lock poisoned") =
            Some(summary.to_string());
    }

    pub fn summary(&self, id: NodeId) -> Option<String> {
        self.runtime[id].summary.lock().expect("summary lock poisoned").clone()
    }

    pub fn set_context(&self, id: NodeId, context: &str) {
        *self.runtime[id].context.lock().expect("context lock poisoned") =
            Some(context.to_string());
    }

    pub fn context(&self, id: NodeId) -> Option<String> {
        self.runtime[id].context.lock().expect("context lock poisoned").clone()
    }

    pub fn mark_failed(&self, id: NodeId) {
        self.runtime[id].ok.store(false, Ordering::Release);
    }

    pub fn is_ok(&self, id: NodeId) -> bool {
        self.runtime[id].ok.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Structure queries
    // ------------------------------------------------------------------

    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.nodes[id].parent;
        while let Some(parent) = current {
            depth += 1;
            current = self.nodes[parent].parent;
        }
        depth
    }

    /// A parent needing LLM context: has children, analysable, and not of
    /// an excluded (unit-level) type.
    pub fn needs_context_generation(&self, id: NodeId, excluded_types: &HashSet<&str>) -> bool {
        let node = &self.nodes[id];
        node.has_children && node.analyzable && !excluded_types.contains(node.node_type.as_str())
    }

    // ------------------------------------------------------------------
    // Code renderings
    // ------------------------------------------------------------------

    /// Verbatim node code with line numbers
    pub fn raw_code(&self, id: NodeId) -> String {
        self.nodes[id]
            .lines
            .iter()
            .map(|(no, text)| format!("{}: {}", no, text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parent code with each child region replaced by the child's summary
    /// (or kept verbatim when the summary is missing). Leaves render raw.
    pub fn compact_code(&self, id: NodeId) -> String {
        let node = &self.nodes[id];
        if node.children.is_empty() {
            return self.raw_code(id);
        }

        let mut children: Vec<&StatementNode> =
            node.children.iter().map(|&c| &self.nodes[c]).collect();
        children.sort_by_key(|c| c.start_line);

        let mut result: Vec<String> = Vec::new();
        let mut line_index = 0;
        let total = node.lines.len();

        for child in &children {
            while line_index < total && node.lines[line_index].0 < child.start_line {
                let (no, text) = &node.lines[line_index];
                result.push(format!("{}: {}", no, text));
                line_index += 1;
            }

            match self.summary(child.id) {
                Some(summary) => {
                    result.push(format!(
                        "{}~{}: {}",
                        child.start_line,
                        child.end_line,
                        summary.trim()
                    ));
                }
                None => {
                    tracing::warn!(
                        "No summary for child {}~{} of parent {}~{}, keeping source",
                        child.start_line,
                        child.end_line,
                        node.start_line,
                        node.end_line
                    );
                    result.push(self.raw_code(child.id));
                }
            }

            while line_index < total && node.lines[line_index].0 <= child.end_line {
                line_index += 1;
            }
        }

        while line_index < total {
            let (no, text) = &node.lines[line_index];
            result.push(format!("{}: {}", no, text));
            line_index += 1;
        }

        result.join("\n")
    }

    /// Parent code with child regions replaced by a `...code...`
    /// placeholder; stored on parent nodes as `summarized_code`.
    pub fn placeholder_code(&self, id: NodeId) -> String {
        let node = &self.nodes[id];
        if node.children.is_empty() {
            return self.raw_code(id);
        }

        let mut children: Vec<&StatementNode> =
            node.children.iter().map(|&c| &self.nodes[c]).collect();
        children.sort_by_key(|c| c.start_line);

        let mut result: Vec<String> = Vec::new();
        let mut line_index = 0;
        let total = node.lines.len();

        for child in &children {
            while line_index < total && node.lines[line_index].0 < child.start_line {
                let (no, text) = &node.lines[line_index];
                result.push(format!("{}: {}", no, text));
                line_index += 1;
            }
            result.push(format!("{}: ...code...", child.start_line));
            while line_index < total && node.lines[line_index].0 <= child.end_line {
                line_index += 1;
            }
        }

        while line_index < total {
            let (no, text) = &node.lines[line_index];
            result.push(format!("{}: {}", no, text));
            line_index += 1;
        }

        result.join("\n")
    }

    /// Skeleton used for context extraction: consecutive child lines
    /// collapse into a single `....` marker.
    pub fn skeleton_code(&self, id: NodeId) -> String {
        let node = &self.nodes[id];
        if node.children.is_empty() {
            return self.raw_code(id);
        }

        let child_spans: Vec<(u32, u32)> = node
            .children
            .iter()
            .map(|&c| (self.nodes[c].start_line, self.nodes[c].end_line))
            .collect();

        let mut result: Vec<String> = Vec::new();
        let mut in_child_block = false;
        for (no, text) in &node.lines {
            let is_child_line = child_spans.iter().any(|(s, e)| s <= no && no <= e);
            if is_child_line {
                if !in_child_block {
                    result.push("    ....".to_string());
                    in_child_block = true;
                }
            } else {
                in_child_block = false;
                result.push(format!("{}: {}", no, text));
            }
        }
        result.join("\n")
    }

    /// Ancestor contexts, nearest first, accumulated up to a token budget
    /// and wrapped in `[CONTEXT]` markers for the prompt.
    pub fn ancestor_context(&self, id: NodeId, max_tokens: usize) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut remaining = max_tokens;
        let mut current = self.nodes[id].parent;

        while let Some(parent) = current {
            if remaining == 0 {
                break;
            }
            if let Some(context) = self.context(parent) {
                let tokens = estimate_tokens(&context);
                if tokens > remaining {
                    break;
                }
                parts.insert(0, context);
                remaining -= tokens;
            }
            current = self.nodes[parent].parent;
        }

        if parts.is_empty() {
            return String::new();
        }
        format!("[CONTEXT]\n{}\n[/CONTEXT]\n", parts.join("\n---\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(start: u32, end: u32, node_type: &str, lines: &[(u32, &str)]) -> StatementNode {
        StatementNode {
            start_line: start,
            end_line: end,
            node_type: node_type.to_string(),
            token: 10,
            analyzable: true,
            lines: lines.iter().map(|(n, t)| (*n, t.to_string())).collect(),
            ..Default::default()
        }
    }

    fn parent_with_child() -> (NodeArena, NodeId, NodeId) {
        let mut arena = NodeArena::new();
        let mut parent = make_node(
            1,
            5,
            "IF",
            &[
                (1, "IF x > 0 THEN"),
                (2, "  SELECT 1 FROM t;"),
                (3, "  SELECT 2 FROM u;"),
                (4, "END IF;"),
            ],
        );
        parent.has_children = true;
        let parent_id = arena.push(parent);

        let mut child =
            make_node(2, 3, "SELECT", &[(2, "  SELECT 1 FROM t;"), (3, "  SELECT 2 FROM u;")]);
        child.parent = Some(parent_id);
        let child_id = arena.push(child);
        arena.node_mut(parent_id).children.push(child_id);
        (arena, parent_id, child_id)
    }

    #[test]
    fn test_raw_code_has_line_numbers() {
        let mut arena = NodeArena::new();
        let id = arena.push(make_node(3, 4, "SELECT", &[(3, "SELECT 1"), (4, "FROM t")]));
        assert_eq!(arena.raw_code(id), "3: SELECT 1\n4: FROM t");
    }

    #[test]
    fn test_compact_code_substitutes_child_summary() {
        let (arena, parent_id, child_id) = parent_with_child();
        arena.set_summary(child_id, "reads t and u");
        let compact = arena.compact_code(parent_id);
        assert!(compact.contains("1: IF x > 0 THEN"));
        assert!(compact.contains("2~3: reads t and u"));
        assert!(compact.contains("4: END IF;"));
        assert!(!compact.contains("SELECT 1"));
    }

    #[test]
    fn test_compact_code_keeps_source_without_summary() {
        let (arena, parent_id, _) = parent_with_child();
        let compact = arena.compact_code(parent_id);
        assert!(compact.contains("SELECT 1"));
    }

    #[test]
    fn test_skeleton_collapses_child_block() {
        let (arena, parent_id, _) = parent_with_child();
        let skeleton = arena.skeleton_code(parent_id);
        assert_eq!(skeleton, "1: IF x > 0 THEN\n    ....\n4: END IF;");
    }

    #[test]
    fn test_placeholder_code() {
        let (arena, parent_id, _) = parent_with_child();
        let code = arena.placeholder_code(parent_id);
        assert!(code.contains("2: ...code..."));
        assert!(!code.contains("SELECT 1"));
    }

    #[test]
    fn test_ancestor_context_nearest_first_within_budget() {
        let (mut arena, parent_id, child_id) = parent_with_child();
        let mut grandchild = make_node(3, 3, "SELECT", &[(3, "  SELECT 2 FROM u;")]);
        grandchild.parent = Some(child_id);
        let grandchild_id = arena.push(grandchild);

        arena.set_context(parent_id, "outer loop over accounts");
        arena.set_context(child_id, "inner branch");

        let context = arena.ancestor_context(grandchild_id, 1000);
        assert!(context.starts_with("[CONTEXT]\n"));
        let outer_pos = context.find("outer loop").unwrap();
        let inner_pos = context.find("inner branch").unwrap();
        assert!(outer_pos < inner_pos, "outermost ancestor renders first");

        // Tight budget keeps only the nearest ancestor
        let tight = arena.ancestor_context(grandchild_id, 4);
        assert!(tight.contains("inner branch"));
        assert!(!tight.contains("outer loop"));
    }

    #[test]
    fn test_depth_and_context_need() {
        let (arena, parent_id, child_id) = parent_with_child();
        assert_eq!(arena.depth(parent_id), 0);
        assert_eq!(arena.depth(child_id), 1);

        let excluded: HashSet<&str> = ["PROCEDURE"].into_iter().collect();
        assert!(arena.needs_context_generation(parent_id, &excluded));
        assert!(!arena.needs_context_generation(child_id, &excluded));
    }
}
