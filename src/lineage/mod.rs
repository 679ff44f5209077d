//! Data lineage extraction
//!
//! Regex-scans ETL source files for data flow: INSERT/MERGE/UPDATE/DELETE
//! targets and FROM/JOIN/USING sources, per procedure. An ETL procedure
//! is one that both reads and writes tables, or writes more than one
//! target. Produces ETL_READS / ETL_WRITES / DATA_FLOWS_TO queries
//! against tables that already exist in the graph; lineage never creates
//! Table nodes.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use crate::utils::{NameCase, escape_for_cypher};

static PROC_SPLIT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)CREATE\s+(?:OR\s+REPLACE\s+)?(?:PROCEDURE|FUNCTION)\s+(\w+)\s*(?:\([^)]*\))?\s*(?:AS|IS)?\s*(.*?)(?=CREATE\s+(?:OR\s+REPLACE\s+)?(?:PROCEDURE|FUNCTION)|$)",
    )
    .unwrap()
});

static INSERT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)INSERT\s+INTO\s+(\w+(?:\.\w+)?)").unwrap());
static MERGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)MERGE\s+INTO\s+(\w+(?:\.\w+)?)").unwrap());
static UPDATE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)UPDATE\s+(\w+(?:\.\w+)?)\s+SET").unwrap());
static DELETE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)DELETE\s+FROM\s+(\w+(?:\.\w+)?)").unwrap());
static FROM_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)FROM\s+(\w+(?:\.\w+)?)").unwrap());
static JOIN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:LEFT\s+|RIGHT\s+|INNER\s+|OUTER\s+|CROSS\s+)?JOIN\s+(\w+(?:\.\w+)?)")
        .unwrap()
});
static USING_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)USING\s*\(\s*SELECT.*?FROM\s+(\w+(?:\.\w+)?)").unwrap());

/// System tables and pseudo-tables never counted as lineage endpoints
const EXCLUDED_TABLES: &[&str] = &[
    "dual",
    "sysdate",
    "systimestamp",
    "user",
    "rownum",
    "all_tables",
    "user_tables",
    "dba_tables",
    "information_schema",
    "pg_catalog",
];

/// Data lineage of one procedure
#[derive(Debug, Clone, Default)]
pub struct LineageInfo {
    pub etl_name: String,
    pub source_tables: Vec<String>,
    pub target_tables: Vec<String>,
    /// ETL, INSERT, MERGE, UPDATE or DELETE
    pub operation_type: String,
    pub file_name: String,
    pub is_etl: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LineageStats {
    pub etl_nodes: usize,
    pub etl_reads: usize,
    pub etl_writes: usize,
    pub data_flows: usize,
}

pub struct LineageAnalyzer {
    name_case: NameCase,
}

impl LineageAnalyzer {
    pub fn new(name_case: NameCase) -> Self {
        Self { name_case }
    }

    /// Extract lineage from one SQL source file. Falls back to treating
    /// the whole file as a single unit when no procedure header is found.
    pub fn analyze_sql_content(&self, sql_content: &str, file_name: &str) -> Vec<LineageInfo> {
        let mut lineages = Vec::new();

        let mut found_procedures = false;
        for cap in PROC_SPLIT_REGEX.captures_iter(sql_content) {
            found_procedures = true;
            let lineage = self.analyze_procedure(&cap[1], &cap[2]);
            if !lineage.source_tables.is_empty() || !lineage.target_tables.is_empty() {
                tracing::debug!(
                    "{}: {} sources -> {} targets",
                    lineage.etl_name,
                    lineage.source_tables.len(),
                    lineage.target_tables.len()
                );
                lineages.push(lineage);
            }
        }

        if !found_procedures {
            let name = if file_name.is_empty() { "UNKNOWN" } else { file_name };
            let lineage = self.analyze_procedure(name, sql_content);
            if !lineage.source_tables.is_empty() || !lineage.target_tables.is_empty() {
                lineages.push(lineage);
            }
        }

        lineages
    }

    fn analyze_procedure(&self, proc_name: &str, body: &str) -> LineageInfo {
        let mut lineage = LineageInfo { etl_name: proc_name.to_string(), ..Default::default() };

        let mut targets: BTreeSet<String> = BTreeSet::new();
        let mut collect_targets = |regex: &Regex, operation: &str, lineage: &mut LineageInfo| {
            for cap in regex.captures_iter(body) {
                if let Some(table) = normalize_table_name(&cap[1]) {
                    if is_excluded(&table) {
                        continue;
                    }
                    targets.insert(table);
                    if lineage.operation_type.is_empty() || lineage.operation_type == "ETL" {
                        lineage.operation_type = operation.to_string();
                    }
                }
            }
        };

        collect_targets(&INSERT_REGEX, "INSERT", &mut lineage);
        collect_targets(&MERGE_REGEX, "MERGE", &mut lineage);
        collect_targets(&UPDATE_REGEX, "UPDATE", &mut lineage);
        collect_targets(&DELETE_REGEX, "DELETE", &mut lineage);

        let mut sources: BTreeSet<String> = BTreeSet::new();
        for regex in [&*FROM_REGEX, &*JOIN_REGEX, &*USING_REGEX] {
            for cap in regex.captures_iter(body) {
                if let Some(table) = normalize_table_name(&cap[1]) {
                    if is_excluded(&table) || targets.contains(&table) {
                        continue;
                    }
                    sources.insert(table);
                }
            }
        }

        lineage.source_tables = sources.into_iter().collect();
        lineage.target_tables = targets.into_iter().collect();

        // Read-and-write, or multi-target writes, mark an ETL procedure
        if !lineage.source_tables.is_empty() && !lineage.target_tables.is_empty() {
            lineage.is_etl = true;
            lineage.operation_type = "ETL".to_string();
        } else if lineage.target_tables.len() > 1 {
            lineage.is_etl = true;
            lineage.operation_type = "ETL".to_string();
        }

        lineage
    }

    /// Build the save queries for the detected ETL procedures. Matching is
    /// case-insensitive on procedure and table names; DATA_FLOWS_TO only
    /// connects Tables both already present.
    pub fn build_save_queries(
        &self,
        lineages: &[LineageInfo],
    ) -> (Vec<String>, LineageStats) {
        let mut queries = Vec::new();
        let mut stats = LineageStats::default();

        for lineage in lineages {
            if !lineage.is_etl {
                continue;
            }

            let proc_name = escape_for_cypher(&self.name_case.apply(&lineage.etl_name));
            let file_name = escape_for_cypher(&lineage.file_name);

            queries.push(format!(
                "MATCH (proc) \
                 WHERE (proc:PROCEDURE OR proc:FUNCTION) \
                   AND proc.procedure_name =~ '(?i){proc_name}' \
                 SET proc.is_etl = true, \
                     proc.etl_operation = '{operation}', \
                     proc.etl_source_count = {sources}, \
                     proc.etl_target_count = {targets} \
                 RETURN proc",
                operation = lineage.operation_type,
                sources = lineage.source_tables.len(),
                targets = lineage.target_tables.len(),
            ));
            stats.etl_nodes += 1;

            for source in &lineage.source_tables {
                let table = escape_for_cypher(&table_name_only(source));
                queries.push(format!(
                    "MATCH (proc) \
                     WHERE (proc:PROCEDURE OR proc:FUNCTION) \
                       AND proc.procedure_name =~ '(?i){proc_name}' \
                     MATCH (t:Table) WHERE t.name =~ '(?i){table}' \
                     MERGE (proc)-[r:ETL_READS]->(t) \
                     SET r.operation = '{operation}', r.file_name = '{file_name}' \
                     RETURN proc, r, t",
                    operation = lineage.operation_type,
                ));
                stats.etl_reads += 1;
            }

            for target in &lineage.target_tables {
                let table = escape_for_cypher(&table_name_only(target));
                queries.push(format!(
                    "MATCH (proc) \
                     WHERE (proc:PROCEDURE OR proc:FUNCTION) \
                       AND proc.procedure_name =~ '(?i){proc_name}' \
                     MATCH (t:Table) WHERE t.name =~ '(?i){table}' \
                     MERGE (proc)-[r:ETL_WRITES]->(t) \
                     SET r.operation = '{operation}', r.file_name = '{file_name}' \
                     RETURN proc, r, t",
                    operation = lineage.operation_type,
                ));
                stats.etl_writes += 1;
            }

            let etl_name = escape_for_cypher(&lineage.etl_name);
            for source in &lineage.source_tables {
                for target in &lineage.target_tables {
                    let src = escape_for_cypher(&table_name_only(source));
                    let tgt = escape_for_cypher(&table_name_only(target));
                    queries.push(format!(
                        "MATCH (src:Table) WHERE src.name =~ '(?i){src}' \
                         MATCH (tgt:Table) WHERE tgt.name =~ '(?i){tgt}' \
                         MERGE (src)-[r:DATA_FLOWS_TO]->(tgt) \
                         SET r.via_etl = '{etl_name}', \
                             r.operation = '{operation}', \
                             r.file_name = '{file_name}' \
                         RETURN src, r, tgt",
                        operation = lineage.operation_type,
                    ));
                    stats.data_flows += 1;
                }
            }
        }

        (queries, stats)
    }
}

fn is_excluded(table: &str) -> bool {
    let name = table_name_only(table).to_lowercase();
    EXCLUDED_TABLES.contains(&name.as_str()) || EXCLUDED_TABLES.contains(&table.to_lowercase().as_str())
}

/// Uppercase-normalised `schema.table` reference
fn normalize_table_name(table: &str) -> Option<String> {
    let normalized = table
        .split('.')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join(".");
    if normalized.is_empty() { None } else { Some(normalized) }
}

fn table_name_only(table_ref: &str) -> String {
    table_ref.rsplit('.').next().unwrap_or(table_ref).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etl_procedure_detected() {
        let sql = "CREATE PROCEDURE etl_x AS BEGIN \
                   INSERT INTO dw.fact SELECT * FROM src.raw; END;";
        let analyzer = LineageAnalyzer::new(NameCase::Original);
        let lineages = analyzer.analyze_sql_content(sql, "etl_x.sql");

        assert_eq!(lineages.len(), 1);
        let lineage = &lineages[0];
        assert!(lineage.is_etl);
        assert_eq!(lineage.etl_name, "etl_x");
        assert_eq!(lineage.operation_type, "ETL");
        assert_eq!(lineage.source_tables, vec!["SRC.RAW"]);
        assert_eq!(lineage.target_tables, vec!["DW.FACT"]);
    }

    #[test]
    fn test_read_only_procedure_is_not_etl() {
        let sql = "CREATE PROCEDURE report AS BEGIN SELECT * FROM sales.orders; END;";
        let analyzer = LineageAnalyzer::new(NameCase::Original);
        let lineages = analyzer.analyze_sql_content(sql, "");
        assert_eq!(lineages.len(), 1);
        assert!(!lineages[0].is_etl);
    }

    #[test]
    fn test_multi_target_write_is_etl() {
        let sql = "CREATE PROCEDURE spread AS BEGIN \
                   INSERT INTO a VALUES (1); INSERT INTO b VALUES (2); END;";
        let analyzer = LineageAnalyzer::new(NameCase::Original);
        let lineages = analyzer.analyze_sql_content(sql, "");
        assert!(lineages[0].is_etl);
        assert_eq!(lineages[0].target_tables.len(), 2);
    }

    #[test]
    fn test_system_tables_excluded() {
        let sql = "CREATE PROCEDURE p AS BEGIN \
                   INSERT INTO t SELECT sysdate FROM dual; END;";
        let analyzer = LineageAnalyzer::new(NameCase::Original);
        let lineages = analyzer.analyze_sql_content(sql, "");
        assert_eq!(lineages[0].target_tables, vec!["T"]);
        assert!(lineages[0].source_tables.is_empty());
    }

    #[test]
    fn test_target_not_double_counted_as_source() {
        let sql = "CREATE PROCEDURE p AS BEGIN \
                   DELETE FROM dw.fact; INSERT INTO dw.fact SELECT * FROM src.raw; END;";
        let analyzer = LineageAnalyzer::new(NameCase::Original);
        let lineages = analyzer.analyze_sql_content(sql, "");
        assert_eq!(lineages[0].target_tables, vec!["DW.FACT"]);
        assert_eq!(lineages[0].source_tables, vec!["SRC.RAW"]);
    }

    #[test]
    fn test_merge_using_subquery_source() {
        let sql = "CREATE PROCEDURE m AS BEGIN \
                   MERGE INTO tgt USING (SELECT id FROM staging.rows) s ON (tgt.id = s.id); END;";
        let analyzer = LineageAnalyzer::new(NameCase::Original);
        let lineages = analyzer.analyze_sql_content(sql, "");
        assert!(lineages[0].source_tables.contains(&"STAGING.ROWS".to_string()));
        assert_eq!(lineages[0].target_tables, vec!["TGT"]);
    }

    #[test]
    fn test_whole_file_fallback_without_procedures() {
        let sql = "INSERT INTO log_t SELECT * FROM events;";
        let analyzer = LineageAnalyzer::new(NameCase::Original);
        let lineages = analyzer.analyze_sql_content(sql, "loader.sql");
        assert_eq!(lineages.len(), 1);
        assert_eq!(lineages[0].etl_name, "loader.sql");
        assert!(lineages[0].is_etl);
    }

    #[test]
    fn test_save_queries_and_stats() {
        let lineage = LineageInfo {
            etl_name: "etl_x".into(),
            source_tables: vec!["SRC.RAW".into()],
            target_tables: vec!["DW.FACT".into()],
            operation_type: "ETL".into(),
            file_name: "etl_x.sql".into(),
            is_etl: true,
        };
        let analyzer = LineageAnalyzer::new(NameCase::Original);
        let (queries, stats) = analyzer.build_save_queries(&[lineage]);

        assert_eq!(stats.etl_nodes, 1);
        assert_eq!(stats.etl_reads, 1);
        assert_eq!(stats.etl_writes, 1);
        assert_eq!(stats.data_flows, 1);
        assert_eq!(queries.len(), 4);
        assert!(queries[0].contains("SET proc.is_etl = true"));
        assert!(queries[3].contains("DATA_FLOWS_TO"));
        // Lineage matches existing tables; it must never MERGE a Table node
        assert!(queries.iter().all(|q| !q.contains("MERGE (src:Table")));
        assert!(queries.iter().all(|q| !q.contains("MERGE (t:Table")));
    }

    #[test]
    fn test_non_etl_lineage_produces_no_queries() {
        let lineage = LineageInfo {
            etl_name: "report".into(),
            source_tables: vec!["SALES.ORDERS".into()],
            is_etl: false,
            ..Default::default()
        };
        let analyzer = LineageAnalyzer::new(NameCase::Original);
        let (queries, stats) = analyzer.build_save_queries(&[lineage]);
        assert!(queries.is_empty());
        assert_eq!(stats.etl_nodes, 0);
    }
}
