//! AST processor - one instance per source file
//!
//! Phase 1 builds the flattened node arena, collects table/column
//! references and variables, and produces the static graph queries.
//! Phase 1.5 generates parent contexts top-down. Phase 2 plans LLM
//! batches, runs them under the worker semaphore with child-to-parent
//! completion ordering, writes each batch's update queries as the batch
//! finishes, and condenses unit summaries at the end.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::analysis::ast_model::{AstNode, AstParameter, AstRoot};
use crate::analysis::batch::{AnalysisBatch, BatchPlanner};
use crate::analysis::node::{InferredFk, NodeArena, NodeId, StatementNode, TableAccessKind, TableRef};
use crate::ddl::{DdlCatalog, column_fqn, fold_object_name, fold_schema};
use crate::graph::types::DeltaCollector;
use crate::graph::{GraphClient, GraphDelta};
use crate::llm::{ChatModel, ContextResponse, LlmResult, SummaryResponse, TableDescriptionResponse, prompts};
use crate::pipeline::control::PipelineController;
use crate::utils::{AnalyzerError, AnalyzerResult, NameCase, clean_llm_json, escape_for_cypher, estimate_tokens};

/// Unit node kinds; excluded from context generation and batched alone
pub const UNIT_TYPES: &[&str] = &["PROCEDURE", "FUNCTION", "TRIGGER"];

/// DML statement kinds
pub const DML_TYPES: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE", "MERGE"];

/// Node kinds that never go to the LLM
const NON_ANALYZABLE_TYPES: &[&str] = &["SPEC", "DECLARE", "COMMENT"];

/// Pseudo-tables never turned into Table nodes
const EXCLUDED_TABLES: &[&str] = &["dual", "sysdate", "systimestamp", "rownum"];

static FROM_TABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bFROM\s+([A-Za-z0-9_$".]+(?:@\w+)?)"#).unwrap());
static JOIN_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bJOIN\s+([A-Za-z0-9_$".]+(?:@\w+)?)"#).unwrap()
});
static INSERT_TABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bINSERT\s+INTO\s+([A-Za-z0-9_$".]+(?:@\w+)?)"#).unwrap());
static UPDATE_TABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bUPDATE\s+([A-Za-z0-9_$".]+(?:@\w+)?)\s+SET\b"#).unwrap());
static DELETE_TABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bDELETE\s+FROM\s+([A-Za-z0-9_$".]+(?:@\w+)?)"#).unwrap());
static MERGE_TABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bMERGE\s+INTO\s+([A-Za-z0-9_$".]+(?:@\w+)?)"#).unwrap());
static EXECUTE_IMMEDIATE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bEXECUTE\s+IMMEDIATE\s+'((?:[^']|'')*)'").unwrap());
static JOIN_EQ_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\w+)\.(\w+)\s*=\s*(\w+)\.(\w+)").unwrap()
});
static BIND_VAR_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r":(\w+)").unwrap());
static DECLARE_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(\w+)\s+([A-Za-z][\w%$.]*(?:\(\s*\d+(?:\s*,\s*\d+)?\s*\))?)\s*(?::=\s*([^;]+?))?\s*;")
        .unwrap()
});

/// Procedure/function/trigger info collected during the AST walk
#[derive(Debug, Clone)]
pub struct UnitInfo {
    pub key: String,
    pub name: String,
    pub kind: String,
    pub schema: String,
    pub start_line: u32,
    pub end_line: u32,
    pub parameters: Vec<AstParameter>,
}

/// One variable (parameter or declaration) of a unit
#[derive(Debug, Clone, Default)]
struct VariableInfo {
    name: String,
    dtype: String,
    parameter_type: String,
    value: String,
    scope: String,
    unit_name: String,
    /// DECLARE node that introduced it, for the SCOPE edge
    declared_at: Option<NodeId>,
    /// (start, end) spans of statements using the variable
    uses: Vec<(u32, u32)>,
}

pub(crate) type UnitSummaryStore = Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>;
pub(crate) type TableSummaryStore = Arc<Mutex<BTreeMap<String, Vec<String>>>>;

/// Failed batch report surfaced in the run's final error
#[derive(Debug, Clone)]
pub struct FailedBatch {
    pub batch_id: usize,
    pub node_ranges: String,
    pub error: String,
}

/// Per-sub-batch write progress forwarded to the event stream
#[derive(Debug)]
pub struct BatchProgress {
    pub file: String,
    pub batch: usize,
    pub total_batches: usize,
    pub graph: GraphDelta,
}

/// Result of a file's Phase 2
pub struct LlmAnalysisOutcome {
    pub graph: GraphDelta,
    pub query_count: usize,
}

/// Tunables threaded down from configuration
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub db_name: String,
    pub dialect: String,
    pub locale: String,
    pub name_case: NameCase,
    pub max_workers: usize,
    pub max_batch_token: usize,
    pub max_context_token: usize,
    pub max_summary_chunk_token: usize,
}

pub struct AstProcessor {
    pub directory: String,
    pub file_name: String,
    /// `directory/file_name`; the graph key `directory` property
    pub full_directory: String,
    node_base_props: String,
    default_schema: String,
    settings: ProcessorSettings,
    catalog: Arc<DdlCatalog>,
    llm: Arc<dyn ChatModel>,
    arena: NodeArena,
    unit_info: BTreeMap<String, UnitInfo>,
    variables: Vec<VariableInfo>,
    pub file_last_line: u32,
}

impl AstProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ast: &AstRoot,
        source: &str,
        directory: &str,
        file_name: &str,
        default_schema: &str,
        catalog: Arc<DdlCatalog>,
        llm: Arc<dyn ChatModel>,
        settings: ProcessorSettings,
    ) -> Self {
        let normalized_dir = directory.replace('\\', "/");
        let full_directory = if normalized_dir.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", normalized_dir, file_name)
        };
        let node_base_props = format!(
            "directory: '{}', file_name: '{}'",
            escape_for_cypher(&full_directory),
            escape_for_cypher(file_name)
        );

        let mut processor = Self {
            directory: normalized_dir,
            file_name: file_name.to_string(),
            full_directory,
            node_base_props,
            default_schema: default_schema.to_string(),
            settings,
            catalog,
            llm,
            arena: NodeArena::new(),
            unit_info: BTreeMap::new(),
            variables: Vec::new(),
            file_last_line: ast.last_line(),
        };
        processor.collect_nodes(ast, source);
        processor
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn unit_info(&self) -> &BTreeMap<String, UnitInfo> {
        &self.unit_info
    }

    // ======================================================================
    // Collection
    // ======================================================================

    fn collect_nodes(&mut self, ast: &AstRoot, source: &str) {
        let source_lines: Vec<&str> = source.lines().collect();
        for child in &ast.children {
            self.collect_recursive(child, None, None, &source_lines);
        }
        self.collect_variable_uses();
    }

    fn collect_recursive(
        &mut self,
        ast_node: &AstNode,
        parent: Option<NodeId>,
        unit: Option<&UnitInfo>,
        source_lines: &[&str],
    ) -> NodeId {
        let node_type = ast_node.node_type.to_uppercase();
        let is_unit = UNIT_TYPES.contains(&node_type.as_str());

        let lines = slice_lines(source_lines, ast_node.start_line, ast_node.end_line);
        let text: String = lines.iter().map(|(_, t)| t.as_str()).collect::<Vec<_>>().join("\n");

        let current_unit: Option<UnitInfo> = if is_unit {
            let name = ast_node
                .name
                .clone()
                .unwrap_or_else(|| format!("unit_{}", ast_node.start_line));
            let info = UnitInfo {
                key: format!("{}::{}", self.full_directory, name),
                name,
                kind: node_type.clone(),
                schema: self.default_schema.clone(),
                start_line: ast_node.start_line,
                end_line: ast_node.end_line,
                parameters: ast_node.parameters.clone(),
            };
            self.unit_info.insert(info.key.clone(), info.clone());
            for param in &info.parameters {
                self.variables.push(VariableInfo {
                    name: param.name.clone(),
                    dtype: param.dtype.clone(),
                    parameter_type: normalize_param_mode(&param.mode),
                    value: String::new(),
                    scope: "Local".to_string(),
                    unit_name: info.name.clone(),
                    declared_at: None,
                    uses: Vec::new(),
                });
            }
            Some(info)
        } else {
            unit.cloned()
        };
        let unit_ref = current_unit.as_ref();

        let dml = DML_TYPES.contains(&node_type.as_str());
        let (table_refs, inferred_fks) = if dml {
            self.collect_table_refs(&text)
        } else {
            (Vec::new(), Vec::new())
        };

        let node = StatementNode {
            id: 0,
            start_line: ast_node.start_line,
            end_line: ast_node.end_line,
            node_type: node_type.clone(),
            token: estimate_tokens(&text),
            has_children: !ast_node.children.is_empty(),
            analyzable: !NON_ANALYZABLE_TYPES.contains(&node_type.as_str()),
            unit_key: unit_ref.map(|u| u.key.clone()),
            unit_name: unit_ref.map(|u| u.name.clone()),
            unit_kind: unit_ref.map(|u| u.kind.clone()),
            schema_name: is_unit.then(|| self.default_schema.clone()),
            dml,
            lines,
            parent,
            children: Vec::new(),
            table_refs,
            inferred_fks,
        };
        let id = self.arena.push(node);

        if node_type == "DECLARE" {
            self.collect_declared_variables(id, unit_ref);
        }

        for child in &ast_node.children {
            let child_id = self.collect_recursive(child, Some(id), unit_ref, source_lines);
            self.arena.node_mut(id).children.push(child_id);
        }
        id
    }

    fn collect_declared_variables(&mut self, declare_id: NodeId, unit: Option<&UnitInfo>) {
        let body: String = self
            .arena
            .node(declare_id)
            .lines
            .iter()
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        for cap in DECLARE_VAR_REGEX.captures_iter(&body) {
            let name = cap[1].to_string();
            if name.eq_ignore_ascii_case("DECLARE") || name.eq_ignore_ascii_case("BEGIN") {
                continue;
            }
            self.variables.push(VariableInfo {
                name,
                dtype: cap[2].trim().to_string(),
                parameter_type: "LOCAL".to_string(),
                value: cap.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
                scope: if unit.is_some() { "Local" } else { "Global" }.to_string(),
                unit_name: unit.map(|u| u.name.clone()).unwrap_or_default(),
                declared_at: Some(declare_id),
                uses: Vec::new(),
            });
        }
    }

    /// Mark `<startLine>_<endLine>` usage spans: bind variables and bare
    /// name occurrences inside leaf statements of the owning unit.
    fn collect_variable_uses(&mut self) {
        let leaf_texts: Vec<(String, String, u32, u32)> = self
            .arena
            .iter()
            .filter(|n| !n.has_children && n.analyzable)
            .map(|n| {
                let text =
                    n.lines.iter().map(|(_, t)| t.as_str()).collect::<Vec<_>>().join("\n");
                (
                    n.unit_name.clone().unwrap_or_default(),
                    text,
                    n.start_line,
                    n.end_line,
                )
            })
            .collect();

        for variable in &mut self.variables {
            let needle = variable.name.to_lowercase();
            for (unit_name, text, start, end) in &leaf_texts {
                if !variable.unit_name.is_empty() && unit_name != &variable.unit_name {
                    continue;
                }
                let lower = text.to_lowercase();
                let bound = BIND_VAR_REGEX
                    .captures_iter(text)
                    .any(|c| c[1].eq_ignore_ascii_case(&variable.name));
                if bound || contains_word(&lower, &needle) {
                    variable.uses.push((*start, *end));
                }
            }
        }
    }

    fn collect_table_refs(&self, text: &str) -> (Vec<TableRef>, Vec<InferredFk>) {
        let mut refs: Vec<TableRef> = Vec::new();
        let mut seen: HashSet<(String, String, &'static str)> = HashSet::new();

        let mut add = |raw: &str, access: TableAccessKind, refs: &mut Vec<TableRef>| {
            let Some(table_ref) = self.resolve_table_ref(raw, access) else {
                return;
            };
            let key = (
                table_ref.schema.clone().unwrap_or_default(),
                table_ref.name.clone(),
                table_ref.access.edge_type(),
            );
            if seen.insert(key) {
                refs.push(table_ref);
            }
        };

        for regex in [&*INSERT_TABLE_REGEX, &*UPDATE_TABLE_REGEX, &*DELETE_TABLE_REGEX, &*MERGE_TABLE_REGEX]
        {
            for cap in regex.captures_iter(text) {
                add(&cap[1], TableAccessKind::Write, &mut refs);
            }
        }
        for regex in [&*FROM_TABLE_REGEX, &*JOIN_TABLE_REGEX] {
            for cap in regex.captures_iter(text) {
                add(&cap[1], TableAccessKind::Read, &mut refs);
            }
        }
        for cap in EXECUTE_IMMEDIATE_REGEX.captures_iter(text) {
            let dynamic_sql = cap[1].replace("''", "'");
            for inner in [&*INSERT_TABLE_REGEX, &*UPDATE_TABLE_REGEX, &*DELETE_TABLE_REGEX, &*MERGE_TABLE_REGEX, &*FROM_TABLE_REGEX]
            {
                for inner_cap in inner.captures_iter(&dynamic_sql) {
                    add(&inner_cap[1], TableAccessKind::Execute, &mut refs);
                }
            }
        }

        // Columns known from DDL metadata, matched by word in the body
        let lower_text = text.to_lowercase();
        for table_ref in refs.iter_mut() {
            let schema = table_ref.schema.clone().unwrap_or_else(|| self.default_schema.clone());
            if let Some(meta) = self.catalog.table(&schema, &table_ref.name) {
                let mut columns: Vec<String> = meta
                    .columns
                    .keys()
                    .filter(|col| contains_word(&lower_text, &col.to_lowercase()))
                    .cloned()
                    .collect();
                columns.sort();
                table_ref.columns = columns;
            }
        }

        // Join-equality FK inference between two tables of this statement
        let mut fks = Vec::new();
        let by_name: HashMap<String, &TableRef> =
            refs.iter().map(|r| (r.name.to_lowercase(), r)).collect();
        for cap in JOIN_EQ_REGEX.captures_iter(text) {
            let left_table = cap[1].to_lowercase();
            let right_table = cap[3].to_lowercase();
            if left_table == right_table {
                continue;
            }
            let (Some(src), Some(tgt)) = (by_name.get(&left_table), by_name.get(&right_table))
            else {
                continue;
            };
            fks.push(InferredFk {
                src_schema: src.schema.clone(),
                src_table: src.name.clone(),
                src_column: fold_object_name(&cap[2], self.settings.name_case),
                tgt_schema: tgt.schema.clone(),
                tgt_table: tgt.name.clone(),
                tgt_column: fold_object_name(&cap[4], self.settings.name_case),
            });
        }

        (refs, fks)
    }

    fn resolve_table_ref(&self, raw: &str, access: TableAccessKind) -> Option<TableRef> {
        let raw = raw.trim().trim_end_matches(';');
        let (identifier, db_link) = match raw.split_once('@') {
            Some((table, link)) => (table, link.to_string()),
            None => (raw, String::new()),
        };

        let (schema_raw, name_raw) = crate::utils::parse_table_identifier(identifier);
        if name_raw.is_empty() || name_raw.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return None;
        }
        if EXCLUDED_TABLES.contains(&name_raw.to_lowercase().as_str()) {
            return None;
        }
        // SELECT ... FROM (subquery) leaves an empty or keyword capture
        if matches!(name_raw.to_uppercase().as_str(), "SELECT" | "WHERE" | "SET" | "VALUES") {
            return None;
        }

        Some(TableRef {
            schema: schema_raw.map(|s| fold_schema(&s)),
            name: fold_object_name(&name_raw, self.settings.name_case),
            access,
            db_link,
            columns: Vec::new(),
        })
    }

    // ======================================================================
    // Phase 1: static graph queries
    // ======================================================================

    pub fn build_static_graph_queries(&self) -> Vec<String> {
        tracing::debug!("Building static graph for {}", self.full_directory);
        if self.arena.is_empty() {
            tracing::warn!("{}: no analyzable nodes, FILE node only", self.full_directory);
        }

        let mut queries = Vec::new();

        queries.push(format!(
            "MERGE (f:FILE {{startLine: 0, {base}}}) \
             SET f.endLine = {end}, f.name = '{name}' \
             RETURN f",
            base = self.node_base_props,
            end = self.file_last_line,
            name = escape_for_cypher(&self.file_name),
        ));

        for node in self.arena.iter() {
            queries.push(self.build_node_merge_query(node));
        }

        queries.extend(self.build_structural_edge_queries());
        queries.extend(self.build_variable_queries());

        tracing::debug!("{}: {} static queries", self.full_directory, queries.len());
        queries
    }

    fn build_node_merge_query(&self, node: &StatementNode) -> String {
        let mut sets = vec![
            format!("n.endLine = {}", node.end_line),
            format!("n.token = {}", node.token),
            format!("n.has_children = {}", node.has_children),
        ];

        if node.has_children {
            sets.push(format!(
                "n.summarized_code = '{}'",
                escape_for_cypher(&self.arena.placeholder_code(node.id))
            ));
        } else {
            sets.push(format!(
                "n.node_code = '{}'",
                escape_for_cypher(&self.arena.raw_code(node.id))
            ));
        }

        if UNIT_TYPES.contains(&node.node_type.as_str()) {
            let name = node.unit_name.clone().unwrap_or_default();
            sets.push(format!("n.name = '{}'", escape_for_cypher(&name)));
            sets.push(format!("n.procedure_name = '{}'", escape_for_cypher(&name)));
            sets.push(format!("n.procedure_type = '{}'", node.node_type));
            sets.push(format!(
                "n.schema_name = '{}'",
                escape_for_cypher(node.schema_name.as_deref().unwrap_or(""))
            ));
        }

        format!(
            "MERGE (n:{kind} {{startLine: {start}, {base}}}) SET {sets} RETURN n",
            kind = node.node_type,
            start = node.start_line,
            base = self.node_base_props,
            sets = sets.join(", "),
        )
    }

    fn match_statement(&self, alias: &str, node: &StatementNode) -> String {
        format!(
            "MATCH ({alias}:{kind} {{startLine: {start}, {base}}})",
            kind = node.node_type,
            start = node.start_line,
            base = self.node_base_props,
        )
    }

    fn build_structural_edge_queries(&self) -> Vec<String> {
        let mut queries = Vec::new();

        for node in self.arena.iter() {
            // CONTAINS from the file to every node
            queries.push(format!(
                "MATCH (f:FILE {{startLine: 0, {base}}}) \
                 {match_node} \
                 MERGE (f)-[r:CONTAINS]->(n) RETURN r",
                base = self.node_base_props,
                match_node = self.match_statement("n", node),
            ));

            // PARENT_OF and sibling NEXT edges
            let mut ordered: Vec<&StatementNode> =
                node.children.iter().map(|&c| self.arena.node(c)).collect();
            ordered.sort_by_key(|c| c.start_line);

            for child in &ordered {
                queries.push(format!(
                    "{parent} {child} MERGE (p)-[r:PARENT_OF]->(c) RETURN r",
                    parent = self.match_statement("p", node),
                    child = self.match_statement("c", child),
                ));
            }
            for pair in ordered.windows(2) {
                queries.push(format!(
                    "{first} {second} MERGE (a)-[r:NEXT]->(b) RETURN r",
                    first = self.match_statement("a", pair[0]),
                    second = self.match_statement("b", pair[1]),
                ));
            }
        }

        queries
    }

    fn build_variable_queries(&self) -> Vec<String> {
        let mut queries = Vec::new();

        for variable in &self.variables {
            let name = escape_for_cypher(&variable.name);
            let unit_name = escape_for_cypher(&variable.unit_name);
            let mut sets = vec![
                format!("v.type = '{}'", escape_for_cypher(&variable.dtype)),
                format!("v.parameter_type = '{}'", variable.parameter_type),
                format!("v.value = '{}'", escape_for_cypher(&variable.value)),
                format!("v.scope = '{}'", variable.scope),
            ];
            for (start, end) in &variable.uses {
                sets.push(format!("v.`{}_{}` = 'Used'", start, end));
            }

            queries.push(format!(
                "MERGE (v:Variable {{{base}, procedure_name: '{unit_name}', name: '{name}'}}) \
                 SET {sets} RETURN v",
                base = self.node_base_props,
                sets = sets.join(", "),
            ));

            // SCOPE from the owning unit, and from the DECLARE block
            if let Some(unit) =
                self.unit_info.values().find(|u| u.name == variable.unit_name)
            {
                queries.push(format!(
                    "MATCH (p:{kind} {{startLine: {start}, {base}}}) \
                     MATCH (v:Variable {{{base}, procedure_name: '{unit_name}', name: '{name}'}}) \
                     MERGE (p)-[r:SCOPE]->(v) RETURN r",
                    kind = unit.kind,
                    start = unit.start_line,
                    base = self.node_base_props,
                ));
            }
            if let Some(declare_id) = variable.declared_at {
                let declare = self.arena.node(declare_id);
                queries.push(format!(
                    "{match_node} \
                     MATCH (v:Variable {{{base}, procedure_name: '{unit_name}', name: '{name}'}}) \
                     MERGE (d)-[r:SCOPE]->(v) RETURN r",
                    match_node = self.match_statement("d", declare),
                    base = self.node_base_props,
                ));
            }
        }

        queries
    }

    // ======================================================================
    // Phase 1.5: parent context generation (top-down)
    // ======================================================================

    /// Generate `context` for every parent node, shallowest depth first.
    /// Nodes at the same depth run in parallel under the worker
    /// semaphore. A single failure is fatal: children analysed without
    /// their surrounding aliases produce wrong results.
    pub async fn generate_parent_contexts(
        self: &Arc<Self>,
        control: &Arc<PipelineController>,
    ) -> AnalyzerResult<()> {
        let excluded: HashSet<&str> = UNIT_TYPES.iter().copied().collect();
        let mut parents: Vec<NodeId> = self
            .arena
            .ids()
            .filter(|&id| self.arena.needs_context_generation(id, &excluded))
            .collect();

        if parents.is_empty() {
            tracing::debug!("{}: no parent contexts needed", self.full_directory);
            for id in self.arena.ids() {
                self.arena.runtime(id).context_ready.set();
            }
            return Ok(());
        }

        parents.sort_by_key(|&id| self.arena.depth(id));
        tracing::debug!("{}: generating {} parent contexts", self.full_directory, parents.len());

        // Group by depth; each level completes before the next starts
        let mut levels: Vec<Vec<NodeId>> = Vec::new();
        let mut current_depth = usize::MAX;
        for id in parents {
            let depth = self.arena.depth(id);
            if depth != current_depth {
                levels.push(Vec::new());
                current_depth = depth;
            }
            levels.last_mut().expect("level pushed above").push(id);
        }

        for level in levels {
            if !control.check_continue().await {
                // Unblock any waiters before bailing out
                for id in self.arena.ids() {
                    self.arena.runtime(id).context_ready.set();
                }
                return Err(AnalyzerError::Cancelled);
            }

            let semaphore =
                Arc::new(Semaphore::new(self.settings.max_workers.min(level.len()).max(1)));
            let mut tasks: JoinSet<AnalyzerResult<()>> = JoinSet::new();

            for id in level {
                let processor = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let excluded: HashSet<String> =
                    UNIT_TYPES.iter().map(|s| s.to_string()).collect();
                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| AnalyzerError::Cancelled)?;
                    let result = processor.generate_one_context(id, &excluded).await;
                    // Fired on every exit path so uniform waits never park
                    processor.arena.runtime(id).context_ready.set();
                    result
                });
            }

            while let Some(joined) = tasks.join_next().await {
                joined.map_err(|e| AnalyzerError::Analysis(format!("context task panicked: {e}")))??;
            }
        }

        for id in self.arena.ids() {
            let runtime = self.arena.runtime(id);
            if !runtime.context_ready.is_set() {
                runtime.context_ready.set();
            }
        }
        Ok(())
    }

    async fn generate_one_context(
        &self,
        id: NodeId,
        excluded: &HashSet<String>,
    ) -> AnalyzerResult<()> {
        let excluded_refs: HashSet<&str> = excluded.iter().map(String::as_str).collect();
        if let Some(parent) = self.arena.node(id).parent
            && self.arena.needs_context_generation(parent, &excluded_refs)
        {
            self.arena.runtime(parent).context_ready.wait().await;
        }

        let skeleton = self.arena.skeleton_code(id);
        let ancestor = self.arena.ancestor_context(id, self.settings.max_context_token);
        let (system, user) = prompts::parent_context(&skeleton, &ancestor, &self.settings.locale);

        let content = self.llm.chat(&system, &user).await.map_err(|e| {
            let node = self.arena.node(id);
            tracing::error!(
                "Context generation failed for {}[{}~{}]: {}",
                node.node_type,
                node.start_line,
                node.end_line,
                e
            );
            AnalyzerError::Llm(e)
        })?;

        let parsed: ContextResponse = serde_json::from_str(&clean_llm_json(&content))
            .map_err(|e| AnalyzerError::Analysis(format!("context response: {e}")))?;
        self.arena.set_context(id, &parsed.context);

        let node = self.arena.node(id);
        tracing::debug!(
            "Context ready: {}[{}~{}]",
            node.node_type,
            node.start_line,
            node.end_line
        );
        Ok(())
    }

    // ======================================================================
    // Phase 2: LLM analysis
    // ======================================================================

    /// Run the file's LLM analysis. Batches execute concurrently under
    /// the worker semaphore; child-to-parent order comes from completion
    /// signals, not batch order. Each batch's update queries are written
    /// as soon as the batch succeeds, so earlier batches persist even
    /// when a later one fails; any failure makes the whole call fail
    /// after every batch has settled.
    pub async fn run_llm_analysis(
        self: &Arc<Self>,
        graph: &Arc<GraphClient>,
        cypher_lock: &Arc<tokio::sync::Mutex<()>>,
        control: &Arc<PipelineController>,
        write_batch_size: usize,
        progress: mpsc::UnboundedSender<BatchProgress>,
    ) -> AnalyzerResult<LlmAnalysisOutcome> {
        tracing::debug!("{}: LLM analysis start", self.full_directory);

        self.generate_parent_contexts(control).await?;

        let planner = BatchPlanner::new(self.settings.max_batch_token);
        let batches = planner.plan(&self.arena, true);
        if batches.is_empty() {
            tracing::debug!("{}: no batches to analyse", self.full_directory);
            return Ok(LlmAnalysisOutcome { graph: GraphDelta::default(), query_count: 0 });
        }
        let total_batches = batches.len();
        tracing::debug!("{}: {} batches planned", self.full_directory, total_batches);

        let unit_summary_store = self.new_unit_summary_store();
        let table_summary_store: TableSummaryStore = Arc::new(Mutex::new(BTreeMap::new()));

        let semaphore =
            Arc::new(Semaphore::new(self.settings.max_workers.min(total_batches).max(1)));
        let mut tasks: JoinSet<(usize, String, AnalyzerResult<(GraphDelta, usize)>)> =
            JoinSet::new();

        for batch in batches {
            let processor = Arc::clone(self);
            let graph = Arc::clone(graph);
            let cypher_lock = Arc::clone(cypher_lock);
            let control = Arc::clone(control);
            let semaphore = Arc::clone(&semaphore);
            let unit_store = Arc::clone(&unit_summary_store);
            let table_store = Arc::clone(&table_summary_store);
            let progress = progress.clone();

            tasks.spawn(async move {
                let batch_id = batch.batch_id;
                let label = batch.node_ranges_label();
                let result = processor
                    .process_batch(
                        batch,
                        &graph,
                        &cypher_lock,
                        &control,
                        &semaphore,
                        write_batch_size,
                        total_batches,
                        &unit_store,
                        &table_store,
                        progress,
                    )
                    .await;
                (batch_id, label, result)
            });
        }

        let mut merged = DeltaCollector::new();
        let mut query_count = 0usize;
        let mut failed: Vec<FailedBatch> = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let (batch_id, label, result) = joined
                .map_err(|e| AnalyzerError::Analysis(format!("batch task panicked: {e}")))?;
            match result {
                Ok((delta, count)) => {
                    merged.merge(&delta);
                    query_count += count;
                }
                Err(e) => {
                    tracing::error!("Batch #{} failed ({}): {}", batch_id, label, e);
                    failed.push(FailedBatch {
                        batch_id,
                        node_ranges: label,
                        error: e.to_string(),
                    });
                }
            }
        }

        // Partial output is unsafe: no unit summaries after any failure
        if !failed.is_empty() {
            failed.sort_by_key(|f| f.batch_id);
            let details = failed
                .iter()
                .map(|f| format!("batch #{} ({}): {}", f.batch_id, f.node_ranges, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AnalyzerError::Analysis(format!(
                "{}: {} batch(es) failed - {}",
                self.full_directory,
                failed.len(),
                details
            )));
        }

        let unit_queries = self
            .process_unit_summaries(&unit_summary_store, &table_summary_store)
            .await?;
        if !unit_queries.is_empty() {
            let _write_guard = cypher_lock.lock().await;
            let delta = graph
                .stream_graph(&unit_queries, write_batch_size, control, |_| {})
                .await?;
            query_count += unit_queries.len();
            merged.merge(&delta);
        }

        tracing::debug!("{}: {} update queries written", self.full_directory, query_count);
        Ok(LlmAnalysisOutcome { graph: merged.into_delta(), query_count })
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_batch(
        self: &Arc<Self>,
        batch: AnalysisBatch,
        graph: &Arc<GraphClient>,
        cypher_lock: &Arc<tokio::sync::Mutex<()>>,
        control: &Arc<PipelineController>,
        llm_gate: &Arc<Semaphore>,
        write_batch_size: usize,
        total_batches: usize,
        unit_store: &UnitSummaryStore,
        table_store: &TableSummaryStore,
        progress: mpsc::UnboundedSender<BatchProgress>,
    ) -> AnalyzerResult<(GraphDelta, usize)> {
        let analysis = if control.check_continue().await {
            self.execute_batch_analysis_gated(&batch, unit_store, table_store, Some(llm_gate.as_ref()))
                .await
        } else {
            Err(AnalyzerError::Cancelled)
        };

        if analysis.is_err() {
            for &id in &batch.nodes {
                self.arena.mark_failed(id);
            }
        }
        // Summaries are in memory at this point; completion fires on every
        // exit path so parent batches never park
        for &id in &batch.nodes {
            self.arena.runtime(id).completion.set();
        }

        let queries = analysis?;
        let query_count = queries.len();
        let delta = {
            let _write_guard = cypher_lock.lock().await;
            graph
                .stream_graph(&queries, write_batch_size, control, |graph_batch| {
                    let _ = progress.send(BatchProgress {
                        file: self.file_name.clone(),
                        batch: batch.batch_id,
                        total_batches,
                        graph: graph_batch.delta,
                    });
                })
                .await?
        };

        Ok((delta, query_count))
    }

    /// Wait for the batch's antecedents, run the LLM call, set summaries
    /// and build the update queries. Writing happens in `process_batch`.
    pub(crate) async fn execute_batch_analysis(
        &self,
        batch: &AnalysisBatch,
        unit_store: &UnitSummaryStore,
        table_store: &TableSummaryStore,
    ) -> AnalyzerResult<Vec<String>> {
        self.execute_batch_analysis_gated(batch, unit_store, table_store, None).await
    }

    /// The worker semaphore is taken only around the LLM call itself:
    /// taking it before the completion waits would let a handful of
    /// parent batches park every permit while their children queue.
    async fn execute_batch_analysis_gated(
        &self,
        batch: &AnalysisBatch,
        unit_store: &UnitSummaryStore,
        table_store: &TableSummaryStore,
        llm_gate: Option<&Semaphore>,
    ) -> AnalyzerResult<Vec<String>> {
        // Parent context first, then every child's completion; a failed
        // child makes this batch fail before any LLM tokens are spent.
        for &id in &batch.nodes {
            if let Some(parent) = self.arena.node(id).parent {
                self.arena.runtime(parent).context_ready.wait().await;
            }
            let children = self.arena.node(id).children.clone();
            for child in children {
                self.arena.runtime(child).completion.wait().await;
                if !self.arena.is_ok(child) {
                    self.arena.mark_failed(id);
                }
            }
        }
        if batch.nodes.iter().any(|&id| !self.arena.is_ok(id)) {
            return Err(AnalyzerError::Analysis(format!(
                "batch #{} ({}): child batch failed",
                batch.batch_id,
                batch.node_ranges_label()
            )));
        }

        tracing::debug!("Batch #{} processing ({} nodes)", batch.batch_id, batch.nodes.len());
        let _permit = match llm_gate {
            Some(gate) => Some(gate.acquire().await.map_err(|_| AnalyzerError::Cancelled)?),
            None => None,
        };
        let (code, context) = batch.build_payload(&self.arena, self.settings.max_context_token);
        let (system, user) = prompts::batch_analysis(
            &code,
            &context,
            &self.settings.dialect,
            &self.settings.locale,
        );
        let content = self.llm.chat(&system, &user).await?;
        let llm_result = LlmResult::parse(&content)?;

        if llm_result.analysis().is_empty() {
            return Err(AnalyzerError::Analysis(format!(
                "batch #{}: empty analysis result",
                batch.batch_id
            )));
        }

        self.apply_summaries(batch, &llm_result);
        Ok(self.build_analysis_queries(batch, &llm_result, unit_store, table_store))
    }

    pub(crate) fn new_unit_summary_store(&self) -> UnitSummaryStore {
        Arc::new(Mutex::new(
            self.unit_info.keys().map(|k| (k.clone(), BTreeMap::new())).collect(),
        ))
    }

    fn apply_summaries(&self, batch: &AnalysisBatch, result: &LlmResult) {
        for (&id, analysis) in batch.nodes.iter().zip(result.analysis().iter()) {
            if !analysis.summary.is_empty() {
                self.arena.set_summary(id, &analysis.summary);
            }
        }
    }

    fn build_analysis_queries(
        &self,
        batch: &AnalysisBatch,
        result: &LlmResult,
        unit_store: &UnitSummaryStore,
        table_store: &TableSummaryStore,
    ) -> Vec<String> {
        let mut queries = Vec::new();

        for (&id, analysis) in batch.nodes.iter().zip(result.analysis().iter()) {
            let node = self.arena.node(id);

            // Summary and context persisted on the statement node
            let mut sets = vec![format!(
                "n.summary = '{}'",
                escape_for_cypher(analysis.summary.trim())
            )];
            if let Some(context) = self.arena.context(id) {
                sets.push(format!("n.context = '{}'", escape_for_cypher(&context)));
            }
            queries.push(format!(
                "{match_node} SET {sets} RETURN n",
                match_node = self.match_statement("n", node),
                sets = sets.join(", "),
            ));

            if let Some(unit_key) = &node.unit_key {
                let mut store = unit_store.lock().expect("unit store poisoned");
                if let Some(summaries) = store.get_mut(unit_key) {
                    summaries.insert(
                        format!("{}_{}", node.start_line, node.end_line),
                        analysis.summary.trim().to_string(),
                    );
                }
            }

            // Static refs collected in Phase 1, merged with the LLM's list
            let mut refs: Vec<TableRef> = node.table_refs.clone();
            for llm_table in &analysis.tables {
                let access = TableAccessKind::parse(&llm_table.access);
                if let Some(mut resolved) = self.resolve_table_ref(&llm_table.name, access) {
                    if resolved.db_link.is_empty() {
                        resolved.db_link = llm_table.db_link.clone();
                    }
                    if !refs.iter().any(|r| {
                        r.name == resolved.name
                            && r.schema == resolved.schema
                            && r.access == resolved.access
                    }) {
                        refs.push(resolved);
                    }
                }
            }

            for table_ref in &refs {
                queries.extend(self.build_table_ref_queries(node, table_ref));
                if node.dml && !analysis.summary.is_empty() {
                    let mut store = table_store.lock().expect("table store poisoned");
                    store
                        .entry(self.qualified_table(table_ref))
                        .or_default()
                        .push(analysis.summary.trim().to_string());
                }
            }

            for fk in &node.inferred_fks {
                queries.extend(self.build_inferred_fk_queries(fk));
            }

            for call in &analysis.calls {
                let callee = escape_for_cypher(&call.name);
                let scope = if call.scope == "external" { "external" } else { "internal" };
                queries.push(format!(
                    "{match_node} \
                     MATCH (callee) WHERE (callee:PROCEDURE OR callee:FUNCTION) \
                       AND callee.procedure_name =~ '(?i){callee}' \
                     MERGE (n)-[r:CALL]->(callee) SET r.scope = '{scope}' \
                     RETURN n, r, callee",
                    match_node = self.match_statement("n", node),
                ));
            }
        }

        // Explicit table-level analysis feeds enrichment
        for table_analysis in result.tables() {
            if table_analysis.summary.is_empty() {
                continue;
            }
            let mut store = table_store.lock().expect("table store poisoned");
            store
                .entry(table_analysis.table.to_uppercase())
                .or_default()
                .push(table_analysis.summary.clone());
        }

        queries
    }

    fn qualified_table(&self, table_ref: &TableRef) -> String {
        match &table_ref.schema {
            Some(schema) => format!("{}.{}", schema, table_ref.name),
            None => format!("{}.{}", self.default_schema, table_ref.name),
        }
    }

    fn build_table_ref_queries(&self, node: &StatementNode, table_ref: &TableRef) -> Vec<String> {
        let mut queries = Vec::new();
        let schema = table_ref.schema.clone().unwrap_or_else(|| self.default_schema.clone());
        let table_key = format!(
            "db: '{}', schema: '{}', name: '{}'",
            self.settings.db_name,
            escape_for_cypher(&schema),
            escape_for_cypher(&table_ref.name),
        );

        // Table node, enriched from DDL metadata on first sight
        let mut on_create = vec!["t.table_type = 'BASE TABLE'".to_string()];
        if let Some(meta) = self.catalog.table(&schema, &table_ref.name)
            && !meta.description.is_empty()
        {
            on_create.push(format!(
                "t.description = '{}', t.description_source = 'ddl'",
                escape_for_cypher(&meta.description)
            ));
        }
        if !table_ref.db_link.is_empty() {
            on_create.push(format!("t.db_link = '{}'", escape_for_cypher(&table_ref.db_link)));
        }
        queries.push(format!(
            "MERGE (t:Table {{{table_key}}}) ON CREATE SET {on_create} RETURN t",
            on_create = on_create.join(", "),
        ));

        // Access edge from the statement
        queries.push(format!(
            "{match_node} MATCH (t:Table {{{table_key}}}) \
             MERGE (n)-[r:{edge}]->(t) RETURN n, r, t",
            match_node = self.match_statement("n", node),
            edge = table_ref.access.edge_type(),
        ));

        // Remote tables hang off their DBLink
        if !table_ref.db_link.is_empty() {
            let link = escape_for_cypher(&table_ref.db_link);
            queries.push(format!(
                "MERGE (l:DBLink {{name: '{link}'}}) \
                 WITH l MATCH (t:Table {{{table_key}}}) \
                 MERGE (l)-[r:CONTAINS]->(t) RETURN l, r, t",
            ));
            queries.push(format!(
                "{match_node} MATCH (t:Table {{{table_key}}}) \
                 MERGE (n)-[r:DB_LINK]->(t) SET r.mode = '{mode}' RETURN n, r, t",
                match_node = self.match_statement("n", node),
                mode = table_ref.access.link_mode(),
            ));
        }

        // Columns known from DDL metadata
        if let Some(meta) = self.catalog.table(&schema, &table_ref.name) {
            for column in &table_ref.columns {
                let Some(col_meta) = meta.columns.get(column) else { continue };
                let fqn = column_fqn(&schema, &table_ref.name, column);
                queries.push(format!(
                    "MERGE (c:Column {{fqn: '{fqn}'}}) \
                     SET c.name = '{name}', c.dtype = '{dtype}', c.nullable = {nullable}, \
                         c.description = '{description}' \
                     RETURN c",
                    name = escape_for_cypher(column),
                    dtype = escape_for_cypher(&col_meta.dtype),
                    nullable = col_meta.nullable,
                    description = escape_for_cypher(&col_meta.description),
                ));
                queries.push(format!(
                    "MATCH (t:Table {{{table_key}}}) MATCH (c:Column {{fqn: '{fqn}'}}) \
                     MERGE (t)-[r:HAS_COLUMN]->(c) RETURN t, r, c",
                ));
            }
        }

        queries
    }

    fn build_inferred_fk_queries(&self, fk: &InferredFk) -> Vec<String> {
        let mut queries = Vec::new();
        let src_schema = fk.src_schema.clone().unwrap_or_else(|| self.default_schema.clone());
        let tgt_schema = fk.tgt_schema.clone().unwrap_or_else(|| self.default_schema.clone());

        queries.push(format!(
            "MATCH (a:Table {{db: '{db}', schema: '{src_schema}', name: '{src_table}'}}) \
             MATCH (b:Table {{db: '{db}', schema: '{tgt_schema}', name: '{tgt_table}'}}) \
             MERGE (a)-[r:FK_TO_TABLE {{sourceColumn: '{src_col}', targetColumn: '{tgt_col}'}}]->(b) \
             ON CREATE SET r.type = 'many_to_one', r.source = 'inferred' \
             RETURN a, r, b",
            db = self.settings.db_name,
            src_schema = escape_for_cypher(&src_schema),
            src_table = escape_for_cypher(&fk.src_table),
            tgt_schema = escape_for_cypher(&tgt_schema),
            tgt_table = escape_for_cypher(&fk.tgt_table),
            src_col = escape_for_cypher(&fk.src_column),
            tgt_col = escape_for_cypher(&fk.tgt_column),
        ));

        // Column-level FK when both ends are known from DDL
        let src_known = self
            .catalog
            .table(&src_schema, &fk.src_table)
            .is_some_and(|m| m.columns.contains_key(&fk.src_column));
        let tgt_known = self
            .catalog
            .table(&tgt_schema, &fk.tgt_table)
            .is_some_and(|m| m.columns.contains_key(&fk.tgt_column));
        if src_known && tgt_known {
            queries.push(format!(
                "MATCH (c1:Column {{fqn: '{src}'}}) MATCH (c2:Column {{fqn: '{tgt}'}}) \
                 MERGE (c1)-[r:FK_TO]->(c2) RETURN c1, r, c2",
                src = column_fqn(&src_schema, &fk.src_table, &fk.src_column),
                tgt = column_fqn(&tgt_schema, &fk.tgt_table, &fk.tgt_column),
            ));
        }

        queries
    }

    // ======================================================================
    // Unit summary condensation
    // ======================================================================

    /// Split each unit's accumulated statement summaries into token-bounded
    /// chunks, summarise every chunk, merge the parts into the unit-level
    /// `summary`, and turn per-table DML summaries into the enriched
    /// table descriptions.
    pub(crate) async fn process_unit_summaries(
        self: &Arc<Self>,
        unit_store: &UnitSummaryStore,
        table_store: &TableSummaryStore,
    ) -> AnalyzerResult<Vec<String>> {
        let mut queries = Vec::new();

        let units: Vec<(UnitInfo, BTreeMap<String, String>)> = {
            let store = unit_store.lock().expect("unit store poisoned");
            self.unit_info
                .values()
                .filter_map(|unit| {
                    store
                        .get(&unit.key)
                        .filter(|summaries| !summaries.is_empty())
                        .map(|summaries| (unit.clone(), summaries.clone()))
                })
                .collect()
        };

        for (unit, summaries) in units {
            let chunks = split_summaries_by_token(&summaries, self.settings.max_summary_chunk_token);

            let mut parts = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                let chunk_text = chunk
                    .iter()
                    .map(|(range, text)| format!("{}: {}", range, text))
                    .collect::<Vec<_>>()
                    .join("\n");
                let (system, user) =
                    prompts::chunk_summary(&unit.name, &chunk_text, &self.settings.locale);
                let content = self.llm.chat(&system, &user).await?;
                let parsed: SummaryResponse = serde_json::from_str(&clean_llm_json(&content))
                    .map_err(|e| AnalyzerError::Analysis(format!("chunk summary: {e}")))?;
                parts.push(parsed.summary);
            }

            let summary = if parts.len() == 1 {
                parts.remove(0)
            } else {
                let (system, user) =
                    prompts::merge_summaries(&unit.name, &parts, &self.settings.locale);
                let content = self.llm.chat(&system, &user).await?;
                let parsed: SummaryResponse = serde_json::from_str(&clean_llm_json(&content))
                    .map_err(|e| AnalyzerError::Analysis(format!("merged summary: {e}")))?;
                parsed.summary
            };

            queries.push(format!(
                "MATCH (n:{kind} {{startLine: {start}, {base}}}) \
                 SET n.summary = '{summary}' RETURN n",
                kind = unit.kind,
                start = unit.start_line,
                base = self.node_base_props,
                summary = escape_for_cypher(summary.trim()),
            ));
        }

        let tables: Vec<(String, Vec<String>)> = {
            let store = table_store.lock().expect("table store poisoned");
            store.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (qualified, summaries) in tables {
            if summaries.is_empty() {
                continue;
            }
            let (system, user) =
                prompts::table_summary(&qualified, &summaries, &self.settings.locale);
            let content = self.llm.chat(&system, &user).await?;
            let parsed: TableDescriptionResponse = serde_json::from_str(&clean_llm_json(&content))
                .map_err(|e| AnalyzerError::Analysis(format!("table summary: {e}")))?;

            let (schema, name) = crate::utils::parse_table_identifier(&qualified);
            let mut clauses = vec![format!(
                "t.name =~ '(?i){}'",
                escape_for_cypher(&regex::escape(&name))
            )];
            if let Some(schema) = schema {
                clauses.push(format!(
                    "t.schema =~ '(?i){}'",
                    escape_for_cypher(&regex::escape(&schema))
                ));
            }
            queries.push(format!(
                "MATCH (t:Table) WHERE {clauses} \
                 SET t.analyzed_description = '{analyzed}', t.detailDescription = '{detail}' \
                 RETURN t",
                clauses = clauses.join(" AND "),
                analyzed = escape_for_cypher(&parsed.description),
                detail = escape_for_cypher(&parsed.detail_description),
            ));
        }

        Ok(queries)
    }
}

// ==========================================================================
// Helpers
// ==========================================================================

fn slice_lines(source_lines: &[&str], start: u32, end: u32) -> Vec<(u32, String)> {
    if start == 0 || start > end {
        return Vec::new();
    }
    let from = (start as usize).saturating_sub(1);
    let to = (end as usize).min(source_lines.len());
    if from >= to {
        return Vec::new();
    }
    source_lines[from..to]
        .iter()
        .enumerate()
        .map(|(offset, text)| (start + offset as u32, text.trim_end().to_string()))
        .collect()
}

fn normalize_param_mode(mode: &str) -> String {
    match mode.to_uppercase().replace(' ', "_").as_str() {
        "OUT" => "OUT".to_string(),
        "IN_OUT" | "INOUT" => "IN_OUT".to_string(),
        _ => "IN".to_string(),
    }
}

fn contains_word(haystack_lower: &str, needle_lower: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack_lower[start..].find(needle_lower) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !haystack_lower[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        let after = abs + needle_lower.len();
        let after_ok = after >= haystack_lower.len()
            || !haystack_lower[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if before_ok && after_ok {
            return true;
        }
        start = abs + needle_lower.len().max(1);
    }
    false
}

/// Token-bounded chunking of the accumulated summary map
fn split_summaries_by_token(
    summaries: &BTreeMap<String, String>,
    max_token: usize,
) -> Vec<Vec<(String, String)>> {
    let mut chunks: Vec<Vec<(String, String)>> = Vec::new();
    let mut current: Vec<(String, String)> = Vec::new();
    let mut current_tokens = 0usize;

    for (key, value) in summaries {
        let tokens = estimate_tokens(&format!("{}: {}", key, value));
        if current_tokens + tokens > max_token && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push((key.clone(), value.clone()));
        current_tokens += tokens;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_word() {
        assert!(contains_word("select id from orders", "id"));
        assert!(!contains_word("select order_id from t", "id"));
        assert!(contains_word("where x = :p and y = 2", "p"));
    }

    #[test]
    fn test_normalize_param_mode() {
        assert_eq!(normalize_param_mode("in"), "IN");
        assert_eq!(normalize_param_mode("OUT"), "OUT");
        assert_eq!(normalize_param_mode("IN OUT"), "IN_OUT");
        assert_eq!(normalize_param_mode(""), "IN");
    }

    #[test]
    fn test_split_summaries_by_token() {
        let mut summaries = BTreeMap::new();
        for i in 0..10 {
            summaries.insert(format!("{}_{}", i, i), "x".repeat(100));
        }
        let chunks = split_summaries_by_token(&summaries, 60);
        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_slice_lines() {
        let source = ["a", "b", "c", "d"];
        let lines = slice_lines(&source, 2, 3);
        assert_eq!(lines, vec![(2, "b".to_string()), (3, "c".to_string())]);
        assert!(slice_lines(&source, 0, 2).is_empty());
        assert!(slice_lines(&source, 5, 9).is_empty());
    }
}
