//! AST processor scenario tests: static graph shape, completion-signal
//! ordering, failure propagation and unit summary condensation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::analysis::ast_model::AstRoot;
use crate::analysis::batch::BatchPlanner;
use crate::analysis::processor::{AstProcessor, ProcessorSettings, TableSummaryStore};
use crate::analysis::node::TableAccessKind;
use crate::ddl::{DdlCatalog, DdlColumnMeta, DdlTableMeta};
use crate::llm::ChatModel;
use crate::pipeline::control::{PipelineController, PipelinePhase};
use crate::tests::common::{CONTEXT_RESPONSE, MockChatModel, SINGLE_SUMMARY_RESPONSE};

fn settings(max_batch_token: usize) -> ProcessorSettings {
    ProcessorSettings {
        db_name: "postgres".to_string(),
        dialect: "oracle".to_string(),
        locale: "English".to_string(),
        name_case: Default::default(),
        max_workers: 5,
        max_batch_token,
        max_context_token: 300,
        max_summary_chunk_token: 5000,
    }
}

fn build_processor(
    ast_json: &str,
    source: &str,
    llm: Arc<dyn ChatModel>,
    catalog: Arc<DdlCatalog>,
    max_batch_token: usize,
) -> Arc<AstProcessor> {
    let ast: AstRoot = serde_json::from_str(ast_json).expect("test AST parses");
    Arc::new(AstProcessor::new(
        &ast,
        source,
        "procs",
        "sp_a.sql",
        "sales",
        catalog,
        llm,
        settings(max_batch_token),
    ))
}

fn orders_catalog() -> Arc<DdlCatalog> {
    let catalog = DdlCatalog::new();
    catalog.add_schema("sales");
    let mut columns = std::collections::HashMap::new();
    columns.insert(
        "ID".to_string(),
        DdlColumnMeta { dtype: "NUMBER".into(), nullable: false, description: "pk".into() },
    );
    columns.insert(
        "CUSTOMER_ID".to_string(),
        DdlColumnMeta { dtype: "NUMBER".into(), nullable: true, description: String::new() },
    );
    catalog.insert_table(
        "sales",
        "ORDERS",
        DdlTableMeta {
            description: "Orders".into(),
            columns,
            original_schema: "sales".into(),
            original_name: "ORDERS".into(),
        },
    );
    Arc::new(catalog)
}

const SP_A_SOURCE: &str = "CREATE PROCEDURE sp_a(p NUMBER) AS\n\
                           BEGIN\n\
                           SELECT * FROM sales.orders WHERE id = :p;\n\
                           END;";

const SP_A_AST: &str = r#"{
    "children": [{
        "type": "PROCEDURE",
        "name": "sp_a",
        "startLine": 1,
        "endLine": 4,
        "parameters": [{"name": "p", "dtype": "NUMBER", "mode": "IN"}],
        "children": [{"type": "SELECT", "startLine": 3, "endLine": 3}]
    }]
}"#;

#[test]
fn test_static_graph_for_single_leaf_procedure() {
    let llm = Arc::new(MockChatModel::new(SINGLE_SUMMARY_RESPONSE));
    let processor = build_processor(SP_A_AST, SP_A_SOURCE, llm, orders_catalog(), 1000);
    let queries = processor.build_static_graph_queries();
    let joined = queries.join("\n---\n");

    // FILE node plus the statement nodes, keyed by (directory, file_name, startLine)
    assert!(joined.contains("MERGE (f:FILE {startLine: 0, directory: 'procs/sp_a.sql', file_name: 'sp_a.sql'})"));
    assert!(joined.contains("MERGE (n:PROCEDURE {startLine: 1,"));
    assert!(joined.contains("n.procedure_name = 'sp_a'"));
    assert!(joined.contains("n.procedure_type = 'PROCEDURE'"));
    assert!(joined.contains("n.schema_name = 'sales'"));
    assert!(joined.contains("MERGE (n:SELECT {startLine: 3,"));
    // Parent carries placeholder code, leaf carries verbatim code
    assert!(joined.contains("n.summarized_code = "));
    assert!(joined.contains("n.node_code = "));
    // Structure edges
    assert!(joined.contains("MERGE (p)-[r:PARENT_OF]->(c)"));
    assert!(joined.contains("MERGE (f)-[r:CONTAINS]->(n)"));
    // Bind parameter becomes a Variable with a use marker and SCOPE edge
    assert!(joined.contains("MERGE (v:Variable {directory: 'procs/sp_a.sql', file_name: 'sp_a.sql', procedure_name: 'sp_a', name: 'p'})"));
    assert!(joined.contains("v.parameter_type = 'IN'"));
    assert!(joined.contains("v.`3_3` = 'Used'"));
    assert!(joined.contains("MERGE (p)-[r:SCOPE]->(v)"));
}

#[test]
fn test_table_refs_collected_from_statement_body() {
    let llm = Arc::new(MockChatModel::new(SINGLE_SUMMARY_RESPONSE));
    let processor = build_processor(SP_A_AST, SP_A_SOURCE, llm, orders_catalog(), 1000);

    let select = processor
        .arena()
        .iter()
        .find(|n| n.node_type == "SELECT")
        .expect("SELECT node collected");
    assert_eq!(select.table_refs.len(), 1);
    let table_ref = &select.table_refs[0];
    assert_eq!(table_ref.schema.as_deref(), Some("sales"));
    assert_eq!(table_ref.name, "ORDERS");
    assert_eq!(table_ref.access, TableAccessKind::Read);
    // Only columns present in the statement body are attached
    assert_eq!(table_ref.columns, vec!["ID".to_string()]);
}

#[tokio::test]
async fn test_analysis_queries_emit_from_edge_and_unit_summary() {
    let response = r#"{
        "analysis": [{"summary": "reads orders by id", "tables": [], "calls": []}]
    }"#;
    let llm = Arc::new(
        MockChatModel::new(response)
            .respond_when("[SUMMARIES]", r#"{"summary": "sp_a reads orders"}"#)
            .respond_when(
                "[DML SUMMARIES]",
                r#"{"description": "order data", "detailDescription": "read by sp_a"}"#,
            ),
    );
    let processor =
        build_processor(SP_A_AST, SP_A_SOURCE, llm.clone(), orders_catalog(), 1000);

    // No control-flow parents here; this force-fires every context_ready
    let control = Arc::new(PipelineController::new());
    control.set_phase(PipelinePhase::LlmAnalysis, "test");
    processor
        .generate_parent_contexts(&control)
        .await
        .expect("context pass completes");

    let batches = BatchPlanner::new(1000).plan(processor.arena(), true);
    // PROCEDURE parent alone, SELECT leaf alone
    assert_eq!(batches.len(), 2);
    let leaf_batch = batches
        .iter()
        .find(|b| b.nodes.iter().all(|&id| !processor.arena().node(id).has_children))
        .expect("leaf batch exists");

    // Leaves have no antecedents; execute directly
    let unit_store = processor.new_unit_summary_store();
    let table_store: TableSummaryStore = Arc::new(Mutex::new(BTreeMap::new()));
    let queries = processor
        .execute_batch_analysis(leaf_batch, &unit_store, &table_store)
        .await
        .expect("leaf batch analyses");
    let joined = queries.join("\n---\n");

    assert!(joined.contains("SET n.summary = 'reads orders by id'"));
    assert!(joined.contains("MERGE (t:Table {db: 'postgres', schema: 'sales', name: 'ORDERS'})"));
    assert!(joined.contains("MERGE (n)-[r:FROM]->(t)"));
    // DDL-known columns ride along with consistent fqns
    assert!(joined.contains("MERGE (c:Column {fqn: 'sales.orders.id'})"));
    assert!(joined.contains("MERGE (t)-[r:HAS_COLUMN]->(c)"));

    // The unit store accumulated the statement summary
    let unit_queries = processor
        .process_unit_summaries(&unit_store, &table_store)
        .await
        .expect("unit summaries condense");
    let joined = unit_queries.join("\n---\n");
    assert!(joined.contains("MATCH (n:PROCEDURE {startLine: 1,"));
    assert!(joined.contains("SET n.summary = 'sp_a reads orders'"));
    assert!(joined.contains("t.analyzed_description = 'order data'"));
    assert!(joined.contains("t.detailDescription = 'read by sp_a'"));
}

const IF_TWO_SELECTS_SOURCE: &str = "CREATE PROCEDURE sp_b AS\n\
                                     BEGIN\n\
                                     IF x > 0 THEN\n\
                                     SELECT a FROM t;\n\
                                     SELECT b FROM u;\n\
                                     END IF;\n\
                                     END;";

const IF_TWO_SELECTS_AST: &str = r#"{
    "children": [{
        "type": "PROCEDURE",
        "name": "sp_b",
        "startLine": 1,
        "endLine": 7,
        "children": [{
            "type": "IF",
            "startLine": 3,
            "endLine": 6,
            "children": [
                {"type": "SELECT", "startLine": 4, "endLine": 4},
                {"type": "SELECT", "startLine": 5, "endLine": 5}
            ]
        }]
    }]
}"#;

/// Scenario: a parent whose second child's LLM call fails. Both
/// children's completion must fire, the parent observes ok=false, gets
/// no summary, and its own batch fails.
#[tokio::test]
async fn test_child_failure_propagates_to_parent() {
    let llm = Arc::new(
        MockChatModel::new(SINGLE_SUMMARY_RESPONSE)
            .respond_when("[SKELETON]", CONTEXT_RESPONSE)
            .fail_when("SELECT b FROM u"),
    );
    let processor = build_processor(
        IF_TWO_SELECTS_AST,
        IF_TWO_SELECTS_SOURCE,
        llm,
        Arc::new(DdlCatalog::new()),
        // Tiny budget: every leaf lands in its own batch
        1,
    );

    let control = Arc::new(PipelineController::new());
    control.set_phase(PipelinePhase::LlmAnalysis, "test");
    processor
        .generate_parent_contexts(&control)
        .await
        .expect("context generation succeeds");

    let batches = BatchPlanner::new(1).plan(processor.arena(), true);
    assert_eq!(batches.len(), 4); // PROCEDURE, IF, SELECT, SELECT

    let unit_store = processor.new_unit_summary_store();
    let table_store: TableSummaryStore = Arc::new(Mutex::new(BTreeMap::new()));

    // Launch all batches concurrently; completion signals provide the
    // child-before-parent ordering, not the spawn order.
    let mut handles = Vec::new();
    for batch in batches {
        let processor = Arc::clone(&processor);
        let unit_store = Arc::clone(&unit_store);
        let table_store = Arc::clone(&table_store);
        handles.push(tokio::spawn(async move {
            let nodes = batch.nodes.clone();
            let result = processor
                .execute_batch_analysis(&batch, &unit_store, &table_store)
                .await;
            if result.is_err() {
                for &id in &nodes {
                    processor.arena().mark_failed(id);
                }
            }
            for &id in &nodes {
                processor.arena().runtime(id).completion.set();
            }
            (batch.batch_id, result.is_ok())
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.expect("batch task completes"));
    }

    let arena = processor.arena();
    let if_node = arena.iter().find(|n| n.node_type == "IF").expect("IF node");
    let selects: Vec<_> = arena.iter().filter(|n| n.node_type == "SELECT").collect();
    assert_eq!(selects.len(), 2);

    // Completion fired on every node, even failing ones
    for node in arena.iter() {
        assert!(
            arena.runtime(node.id).completion.is_set(),
            "completion must fire for {} at line {}",
            node.node_type,
            node.start_line
        );
    }

    // First SELECT succeeded and kept its summary; second failed
    let first = selects.iter().find(|n| n.start_line == 4).expect("first SELECT");
    let second = selects.iter().find(|n| n.start_line == 5).expect("second SELECT");
    assert!(arena.is_ok(first.id));
    assert!(arena.summary(first.id).is_some());
    assert!(!arena.is_ok(second.id));
    assert!(arena.summary(second.id).is_none());

    // The parent observed the failed child: marked failed, no summary
    assert!(!arena.is_ok(if_node.id));
    assert!(arena.summary(if_node.id).is_none());

    // Exactly the two dependent batches failed (second SELECT, IF) plus
    // the PROCEDURE batch above them
    let failed_count = outcomes.iter().filter(|(_, ok)| !ok).count();
    assert_eq!(failed_count, 3);
}

#[tokio::test]
async fn test_parent_contexts_generated_top_down() {
    let llm = Arc::new(MockChatModel::new(SINGLE_SUMMARY_RESPONSE).respond_when(
        "[SKELETON]",
        r#"{"context": "walks active accounts"}"#,
    ));
    let source = "CREATE PROCEDURE sp_c AS\n\
                  BEGIN\n\
                  FOR r IN (SELECT 1 FROM d) LOOP\n\
                  IF r.x THEN\n\
                  SELECT y FROM z;\n\
                  END IF;\n\
                  END LOOP;\n\
                  END;";
    let ast = r#"{
        "children": [{
            "type": "PROCEDURE", "name": "sp_c", "startLine": 1, "endLine": 8,
            "children": [{
                "type": "FOR", "startLine": 3, "endLine": 7,
                "children": [{
                    "type": "IF", "startLine": 4, "endLine": 6,
                    "children": [{"type": "SELECT", "startLine": 5, "endLine": 5}]
                }]
            }]
        }]
    }"#;
    let processor =
        build_processor(ast, source, llm.clone(), Arc::new(DdlCatalog::new()), 1000);

    let control = Arc::new(PipelineController::new());
    control.set_phase(PipelinePhase::LlmAnalysis, "test");
    processor
        .generate_parent_contexts(&control)
        .await
        .expect("contexts generate");

    let arena = processor.arena();
    // PROCEDURE is excluded from context generation; FOR and IF get one
    for node in arena.iter() {
        assert!(arena.runtime(node.id).context_ready.is_set());
        match node.node_type.as_str() {
            "FOR" | "IF" => assert!(arena.context(node.id).is_some()),
            _ => assert!(arena.context(node.id).is_none()),
        }
    }
    assert_eq!(llm.call_count(), 2);

    // Depth levels run strictly top-down: the FOR skeleton goes to the
    // LLM before the IF nested inside it
    let prompts = llm.user_prompts();
    assert!(prompts[0].contains("FOR r IN"));
    assert!(prompts[1].contains("IF r.x"));

    // The leaf's prompt context chains its ancestors
    let select = arena.iter().find(|n| n.node_type == "SELECT").expect("leaf");
    let chain = arena.ancestor_context(select.id, 300);
    assert!(chain.contains("walks active accounts"));
}

#[test]
fn test_no_analyzable_nodes_still_creates_file_node() {
    let llm = Arc::new(MockChatModel::new(SINGLE_SUMMARY_RESPONSE));
    let processor =
        build_processor(r#"{"children": []}"#, "", llm, Arc::new(DdlCatalog::new()), 1000);

    let queries = processor.build_static_graph_queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains("MERGE (f:FILE"));

    let batches = BatchPlanner::new(1000).plan(processor.arena(), true);
    assert!(batches.is_empty());
}
