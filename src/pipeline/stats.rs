//! Per-run analysis statistics, summarised at the end of the stream.

use crate::graph::GraphDelta;

#[derive(Debug, Default, Clone)]
pub struct AnalysisStats {
    pub ddl_tables: usize,
    pub ddl_columns: usize,
    pub ddl_fks: usize,

    pub files_completed: usize,
    pub files_failed: Vec<(String, String)>,

    pub static_nodes: usize,
    pub static_relationships: usize,
    pub llm_nodes: usize,
    pub llm_relationships: usize,
    pub llm_batches_executed: usize,
    pub llm_batches_failed: usize,

    pub tables_enriched: usize,
    pub columns_enriched: usize,
    pub fk_relationships_inferred: usize,

    pub tables_vectorized: usize,
    pub columns_vectorized: usize,

    pub etl_count: usize,
    pub data_flows: usize,
}

impl AnalysisStats {
    pub fn add_ddl_result(&mut self, tables: usize, columns: usize, fks: usize) {
        self.ddl_tables += tables;
        self.ddl_columns += columns;
        self.ddl_fks += fks;
    }

    pub fn add_graph_result(&mut self, graph: &GraphDelta, is_static: bool) {
        if is_static {
            self.static_nodes += graph.nodes.len();
            self.static_relationships += graph.relationships.len();
        } else {
            self.llm_nodes += graph.nodes.len();
            self.llm_relationships += graph.relationships.len();
        }
    }

    pub fn mark_file_failed(&mut self, file: &str, reason: &str) {
        self.files_failed.push((file.to_string(), reason.to_string()));
    }

    pub fn summary_line(&self) -> String {
        format!(
            "files={} ddl(T:{} C:{} FK:{}) static(n:{} r:{}) llm(n:{} r:{} batches:{}) \
             enriched(T:{} C:{} FK:{}) vectors(T:{} C:{}) lineage(etl:{} flows:{})",
            self.files_completed,
            self.ddl_tables,
            self.ddl_columns,
            self.ddl_fks,
            self.static_nodes,
            self.static_relationships,
            self.llm_nodes,
            self.llm_relationships,
            self.llm_batches_executed,
            self.tables_enriched,
            self.columns_enriched,
            self.fk_relationships_inferred,
            self.tables_vectorized,
            self.columns_vectorized,
            self.etl_count,
            self.data_flows,
        )
    }
}
