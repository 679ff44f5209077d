//! Phase 0 - DDL loader
//!
//! Parses every file under `<base>/ddl`, collects schema/table/column/FK
//! rows with duplicate suppression and precomputed fqns, and loads them
//! with six UNWIND batches per file instead of thousands of single-node
//! MERGEs. Populates the DDL catalog Phase 1 reads. A missing DDL
//! directory is a warning, not a failure.

use serde_json::{Value, json};
use std::sync::Arc;

use crate::ddl::{DdlCatalog, DdlColumnMeta, DdlTableMeta, ParsedDdl, column_fqn, fold_object_name, fold_schema, parse_ddl};
use crate::pipeline::orchestrator::AnalysisRun;
use crate::utils::{AnalyzerResult, NameCase};

const SCHEMA_QUERY: &str = "UNWIND $items AS item \
    MERGE (s:Schema {db: item.db, name: item.name}) \
    RETURN s";

const TABLE_QUERY: &str = "UNWIND $items AS item \
    MERGE (t:Table {db: item.db, schema: item.schema, name: item.name}) \
    SET t.description = item.description, \
        t.description_source = item.description_source, \
        t.table_type = item.table_type \
    RETURN t";

const BELONGS_TO_QUERY: &str = "UNWIND $items AS item \
    MATCH (t:Table {db: item.db, schema: item.schema, name: item.name}) \
    MATCH (s:Schema {db: item.db, name: item.schema}) \
    MERGE (t)-[r:BELONGS_TO]->(s) \
    RETURN t, r, s";

const COLUMN_QUERY: &str = "UNWIND $items AS item \
    MERGE (c:Column {fqn: item.fqn}) \
    SET c.name = item.name, \
        c.dtype = item.dtype, \
        c.description = item.description, \
        c.description_source = item.description_source, \
        c.nullable = item.nullable, \
        c.pk_constraint = CASE WHEN item.pk_constraint IS NOT NULL \
                               THEN item.pk_constraint ELSE c.pk_constraint END \
    RETURN c";

const HAS_COLUMN_QUERY: &str = "UNWIND $items AS item \
    MATCH (t:Table {db: item.table_db, schema: item.table_schema, name: item.table_name}) \
    MATCH (c:Column {fqn: item.fqn}) \
    MERGE (t)-[r:HAS_COLUMN]->(c) \
    RETURN t, r, c";

const FK_REF_TABLE_QUERY: &str = "UNWIND $items AS item \
    MERGE (rt:Table {db: item.to_db, schema: item.to_schema, name: item.to_table}) \
    RETURN rt";

const FK_EDGE_QUERY: &str = "UNWIND $items AS item \
    MATCH (t:Table {db: item.from_db, schema: item.from_schema, name: item.from_table}) \
    MATCH (rt:Table {db: item.to_db, schema: item.to_schema, name: item.to_table}) \
    MERGE (t)-[r:FK_TO_TABLE {sourceColumn: item.from_column, targetColumn: item.to_column}]->(rt) \
    ON CREATE SET r.type = 'many_to_one', r.source = 'ddl' \
    RETURN t, r, rt";

/// Rows collected from one parsed DDL document, ready for UNWIND
#[derive(Debug, Default)]
pub struct DdlRows {
    pub schemas: Vec<Value>,
    pub tables: Vec<Value>,
    pub columns: Vec<Value>,
    pub fks: Vec<Value>,
}

impl DdlRows {
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
    pub fn fk_count(&self) -> usize {
        self.fks.len()
    }
}

/// Fold identifiers, precompute fqns, suppress duplicates, and feed the
/// DDL catalog. Pure apart from the catalog writes.
pub fn collect_ddl_rows(
    parsed: &ParsedDdl,
    db_name: &str,
    name_case: NameCase,
    catalog: &DdlCatalog,
) -> DdlRows {
    let mut rows = DdlRows::default();
    let mut seen_schemas: std::collections::HashSet<(String, String)> = Default::default();
    let mut seen_tables: std::collections::HashSet<(String, String, String)> = Default::default();

    for table in &parsed.tables {
        let schema = fold_schema(table.schema.as_deref().unwrap_or("public"));
        let name = fold_object_name(&table.name, name_case);
        let comment = table.comment.trim().to_string();

        catalog.add_schema(&schema);

        if seen_schemas.insert((db_name.to_string(), schema.clone())) {
            rows.schemas.push(json!({ "db": db_name, "name": schema }));
        }

        if seen_tables.insert((db_name.to_string(), schema.clone(), name.clone())) {
            rows.tables.push(json!({
                "db": db_name,
                "schema": schema,
                "name": name,
                "description": comment,
                "description_source": if comment.is_empty() { "" } else { "ddl" },
                "table_type": table.table_type,
            }));
        }

        let mut column_meta = std::collections::HashMap::new();
        for column in &table.columns {
            let column_name = fold_object_name(&column.name, name_case);
            if column_name.is_empty() {
                continue;
            }
            column_meta.insert(
                column_name.clone(),
                DdlColumnMeta {
                    dtype: column.dtype.clone(),
                    nullable: column.nullable,
                    description: column.comment.clone(),
                },
            );

            let fqn = column_fqn(&schema, &name, &column_name);
            let mut row = json!({
                "fqn": fqn,
                "name": column_name,
                "dtype": column.dtype,
                "description": column.comment,
                "description_source": if column.comment.is_empty() { "" } else { "ddl" },
                "nullable": column.nullable,
                "table_db": db_name,
                "table_schema": schema,
                "table_name": name,
            });
            if table.primary_keys.iter().any(|pk| pk.eq_ignore_ascii_case(&column.name)) {
                row["pk_constraint"] = json!(format!("{}_pkey", name.to_lowercase()));
            }
            rows.columns.push(row);
        }

        catalog.insert_table(
            &schema,
            &name,
            DdlTableMeta {
                description: comment.clone(),
                columns: column_meta,
                original_schema: schema.clone(),
                original_name: name.clone(),
            },
        );

        for fk in &table.foreign_keys {
            let ref_schema = fk
                .ref_schema
                .as_deref()
                .map(fold_schema)
                .unwrap_or_else(|| schema.clone());
            rows.fks.push(json!({
                "from_db": db_name,
                "from_schema": schema,
                "from_table": name,
                "from_column": fold_object_name(&fk.column, name_case),
                "to_db": db_name,
                "to_schema": ref_schema,
                "to_table": fold_object_name(&fk.ref_table, name_case),
                "to_column": fold_object_name(&fk.ref_column, name_case),
            }));
        }
    }

    rows
}

pub async fn run_ddl_phase(run: &Arc<AnalysisRun>) -> AnalyzerResult<()> {
    let ddl_dir = run.config.ddl_dir();
    if !ddl_dir.is_dir() {
        tracing::warn!("DDL directory missing: {} - skipping", ddl_dir.display());
        run.events.message("ℹ️ No DDL directory, skipping schema collection");
        run.events.phase(0.0, "DDL processing", "skipped", 100, None);
        return Ok(());
    }

    let mut ddl_files: Vec<String> = std::fs::read_dir(&ddl_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    ddl_files.sort();

    if ddl_files.is_empty() {
        run.events.message("ℹ️ No DDL files, skipping schema collection");
        run.events.phase(0.0, "DDL processing", "skipped", 100, None);
        return Ok(());
    }

    let total = ddl_files.len();
    run.events.message(format!("📋 [Phase 0] Collecting table schemas ({} DDL files)", total));

    let db_name = run.config.analysis.target_db.to_lowercase();
    let name_case = run.config.analysis.name_case;
    let unwind_batch = run.config.batch.ddl_unwind_batch_size;

    for (idx, ddl_file) in ddl_files.iter().enumerate() {
        if !run.control.check_continue().await {
            return Err(crate::utils::AnalyzerError::Cancelled);
        }

        run.events.message(format!("📄 [{}/{}] {}", idx + 1, total, ddl_file));
        let content = tokio::fs::read_to_string(ddl_dir.join(ddl_file)).await?;
        let parsed = parse_ddl(&content)?;
        let rows = collect_ddl_rows(&parsed, &db_name, name_case, &run.catalog);

        run.events.message(format!(
            "   💾 Saving {} tables, {} columns, {} FKs via UNWIND batches",
            rows.table_count(),
            rows.column_count(),
            rows.fk_count()
        ));

        let mut collector = crate::graph::types::DeltaCollector::new();
        let steps: [(&str, &str, &[Value]); 5] = [
            ("schemas", SCHEMA_QUERY, rows.schemas.as_slice()),
            ("tables", TABLE_QUERY, rows.tables.as_slice()),
            ("table-schema edges", BELONGS_TO_QUERY, rows.tables.as_slice()),
            ("columns", COLUMN_QUERY, rows.columns.as_slice()),
            ("table-column edges", HAS_COLUMN_QUERY, rows.columns.as_slice()),
        ];
        for (step_idx, (label, query, items)) in steps.iter().enumerate() {
            if items.is_empty() {
                continue;
            }
            run.events.message(format!(
                "      📦 [{}/6] Creating {} {}",
                step_idx + 1,
                items.len(),
                label
            ));
            let _write_guard = run.cypher_lock.lock().await;
            let delta = run.graph.batch_unwind(query, items, unwind_batch).await?;
            collector.merge(&delta);
        }

        if !rows.fks.is_empty() {
            run.events
                .message(format!("      📦 [6/6] Creating {} FK relationships", rows.fk_count()));
            let _write_guard = run.cypher_lock.lock().await;
            let ref_delta = run.graph.batch_unwind(FK_REF_TABLE_QUERY, &rows.fks, unwind_batch).await?;
            collector.merge(&ref_delta);
            let fk_delta = run.graph.batch_unwind(FK_EDGE_QUERY, &rows.fks, unwind_batch).await?;
            collector.merge(&fk_delta);
        }

        let delta = collector.into_delta();
        run.events.message(format!(
            "   ✅ Saved: {} nodes, {} relationships",
            delta.nodes.len(),
            delta.relationships.len()
        ));

        let progress = (((idx + 1) * 100) / total) as u8;
        run.events.phase(
            0.0,
            "DDL processing",
            "in_progress",
            progress,
            Some(json!({
                "file": ddl_file,
                "tables": rows.table_count(),
                "columns": rows.column_count(),
                "fks": rows.fk_count(),
            })),
        );
        run.control.update_progress(progress, ddl_file);

        {
            let mut stats = run.stats.lock().expect("stats poisoned");
            stats.add_ddl_result(rows.table_count(), rows.column_count(), rows.fk_count());
        }
        if !delta.is_empty() {
            run.events.data(delta, Some(0), Some(format!("DDL-{}", ddl_file)));
        }
    }

    let stats = run.stats.lock().expect("stats poisoned").clone();
    run.events.message(format!(
        "📊 DDL processing done: {} tables, {} columns, {} FKs",
        stats.ddl_tables, stats.ddl_columns, stats.ddl_fks
    ));
    run.events.phase(0.0, "DDL processing", "completed", 100, None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: one DDL file defining sales.orders with an inline FK and
    /// a COMMENT ON statement - the six UNWIND batch inputs.
    #[test]
    fn test_collect_rows_for_commented_table_with_fk() {
        let ddl = r#"
            CREATE TABLE sales.orders(
                id NUMBER PRIMARY KEY,
                customer_id NUMBER REFERENCES sales.customers.id
            );
            COMMENT ON TABLE sales.orders IS 'Orders';
        "#;
        let parsed = parse_ddl(ddl).unwrap();
        let catalog = DdlCatalog::new();
        let rows = collect_ddl_rows(&parsed, "postgres", NameCase::Original, &catalog);

        assert_eq!(rows.schemas.len(), 1);
        assert_eq!(rows.schemas[0]["name"], "sales");
        assert_eq!(rows.schemas[0]["db"], "postgres");

        assert_eq!(rows.tables.len(), 1);
        let table = &rows.tables[0];
        assert_eq!(table["name"], "ORDERS");
        assert_eq!(table["description"], "Orders");
        assert_eq!(table["description_source"], "ddl");
        assert_eq!(table["table_type"], "BASE TABLE");

        assert_eq!(rows.columns.len(), 2);
        let fqns: Vec<&str> =
            rows.columns.iter().map(|c| c["fqn"].as_str().unwrap()).collect();
        assert!(fqns.contains(&"sales.orders.id"));
        assert!(fqns.contains(&"sales.orders.customer_id"));
        let id_row = rows.columns.iter().find(|c| c["name"] == "ID").unwrap();
        assert_eq!(id_row["pk_constraint"], "orders_pkey");

        assert_eq!(rows.fks.len(), 1);
        let fk = &rows.fks[0];
        assert_eq!(fk["from_column"], "CUSTOMER_ID");
        assert_eq!(fk["to_table"], "CUSTOMERS");
        assert_eq!(fk["to_schema"], "sales");
    }

    #[test]
    fn test_uncommented_table_has_empty_description_source() {
        let parsed = parse_ddl("CREATE TABLE t (a INT);").unwrap();
        let catalog = DdlCatalog::new();
        let rows = collect_ddl_rows(&parsed, "oracle", NameCase::Original, &catalog);
        assert_eq!(rows.tables[0]["description_source"], "");
        assert_eq!(rows.tables[0]["schema"], "public");
    }

    #[test]
    fn test_duplicate_tables_suppressed() {
        let ddl = "CREATE TABLE s.t (a INT); CREATE TABLE s.t (a INT);";
        let parsed = parse_ddl(ddl).unwrap();
        let catalog = DdlCatalog::new();
        let rows = collect_ddl_rows(&parsed, "oracle", NameCase::Original, &catalog);
        assert_eq!(rows.tables.len(), 1);
        assert_eq!(rows.schemas.len(), 1);
    }

    #[test]
    fn test_catalog_populated_for_phase1() {
        let ddl = r#"
            CREATE TABLE hr.emp (id NUMBER, name VARCHAR2(50));
            COMMENT ON COLUMN hr.emp.name IS 'Employee name';
        "#;
        let parsed = parse_ddl(ddl).unwrap();
        let catalog = DdlCatalog::new();
        collect_ddl_rows(&parsed, "oracle", NameCase::Original, &catalog);

        assert!(catalog.schemas().contains("hr"));
        let meta = catalog.table("hr", "EMP").unwrap();
        assert_eq!(meta.columns.len(), 2);
        assert_eq!(meta.columns["NAME"].description, "Employee name");
    }

    #[test]
    fn test_lowercase_name_case_policy() {
        let parsed = parse_ddl("CREATE TABLE S.T (ID NUMBER);").unwrap();
        let catalog = DdlCatalog::new();
        let rows = collect_ddl_rows(&parsed, "oracle", NameCase::Lowercase, &catalog);
        assert_eq!(rows.tables[0]["name"], "t");
        assert_eq!(rows.columns[0]["name"], "id");
        assert_eq!(rows.columns[0]["fqn"], "s.t.id");
    }
}
