//! Phase 3.5 - metadata enrichment
//!
//! Description-less tables get LLM descriptions from sampled rows, then
//! optional fuzzy FK inference confirmed by value overlap. An
//! unreachable Text-to-SQL endpoint aborts this phase only, never the
//! run; single-table failures continue with the next table.

use serde_json::json;
use std::sync::Arc;

use crate::enrichment::{MetadataEnrichmentService, TableColumns, Text2SqlClient};
use crate::pipeline::orchestrator::AnalysisRun;
use crate::utils::{AnalyzerError, AnalyzerResult};

const EMPTY_DESCRIPTION_QUERY: &str = "MATCH (t:Table) \
    WHERE t.description IS NULL OR t.description = '' OR t.description = 'N/A' \
    RETURN t.name AS table_name, t.schema AS schema_name \
    ORDER BY t.schema, t.name";

const TABLE_COLUMNS_QUERY: &str = "MATCH (t:Table)-[:HAS_COLUMN]->(c:Column) \
    RETURN t.name AS table_name, t.schema AS schema_name, \
           collect(c.name) AS columns \
    ORDER BY t.schema, t.name";

pub async fn run_metadata_phase(run: &Arc<AnalysisRun>) -> AnalyzerResult<()> {
    run.events.message("🚀 [Phase 3.5] Metadata enrichment starting");
    run.events.phase(3.5, "Metadata enrichment", "in_progress", 0, None);

    let text2sql_url = run.config.enrichment.text2sql_api_url.clone();
    if text2sql_url.is_empty() {
        run.events.message("⏭️ No Text-to-SQL endpoint configured, skipping enrichment");
        run.events.phase(3.5, "Metadata enrichment", "skipped", 100, None);
        return Ok(());
    }

    let service = MetadataEnrichmentService::new(
        Arc::clone(&run.graph),
        Arc::clone(&run.llm),
        Text2SqlClient::new(&text2sql_url),
        &run.config.analysis.locale,
        run.config.enrichment.fk_sample_size,
        run.config.enrichment.fk_similarity_threshold,
        run.config.enrichment.fk_match_ratio_threshold,
    );

    // One health probe gates the whole phase
    if !service.text2sql().is_available().await {
        tracing::warn!("Text2SQL endpoint unavailable: {}", text2sql_url);
        run.events.message(format!(
            "⚠️ Text-to-SQL endpoint unreachable ({}), skipping enrichment and FK inference",
            text2sql_url
        ));
        run.events.phase(3.5, "Metadata enrichment", "skipped", 100, None);
        return Ok(());
    }

    let tables_to_enrich = {
        let rows = run.graph.execute(&[EMPTY_DESCRIPTION_QUERY.to_string()]).await?;
        rows.into_iter().next().unwrap_or_default()
    };

    if tables_to_enrich.is_empty() {
        run.events.message("✅ Every table already has a description");
    } else {
        let total = tables_to_enrich.len();
        run.events.message(format!("📋 {} tables without a description", total));

        let mut enriched = 0usize;
        let mut tables_updated = 0usize;
        let mut columns_updated = 0usize;

        for (idx, row) in tables_to_enrich.iter().enumerate() {
            if !run.control.check_continue().await {
                return Err(AnalyzerError::Cancelled);
            }

            let table = row.get("table_name").and_then(|v| v.as_str()).unwrap_or("");
            let schema = row.get("schema_name").and_then(|v| v.as_str()).unwrap_or("public");
            if table.is_empty() {
                continue;
            }

            let progress = ((idx * 70) / total) as u8;
            run.events.message(format!(
                "   🔄 [{}/{}] \"{}\".\"{}\"",
                idx + 1,
                total,
                schema,
                table
            ));
            run.events.phase(
                3.5,
                "Metadata enrichment",
                "in_progress",
                progress,
                Some(json!({ "current_table": format!("{}.{}", schema, table), "done": idx, "total": total })),
            );

            match enrich_one_table(run, &service, schema, table).await {
                Ok(Some((t_updated, c_updated))) => {
                    enriched += 1;
                    tables_updated += t_updated;
                    columns_updated += c_updated;
                    run.events.message(format!(
                        "      ✓ descriptions written (table: {}, columns: {})",
                        t_updated, c_updated
                    ));
                    run.events.send(crate::pipeline::events::StreamEvent::CanvasUpdate {
                        update_type: "table_description".to_string(),
                        table_name: table.to_string(),
                        schema: schema.to_string(),
                        changes: Some(json!({ "columns_updated": c_updated })),
                    });
                }
                Ok(None) => {
                    run.events.message("      ⚠️ no sample rows, skipped".to_string());
                }
                Err(e) => {
                    // Per-table failure is non-fatal, move on
                    tracing::warn!("Enrichment failed for {}.{}: {}", schema, table, e);
                    run.events.message(format!("      ⚠️ failed: {:.80}", e.to_string()));
                }
            }
        }

        run.events.message(format!(
            "✅ Enrichment done: {}/{} tables ({} table, {} column descriptions)",
            enriched,
            total,
            tables_updated,
            columns_updated
        ));
        let mut stats = run.stats.lock().expect("stats poisoned");
        stats.tables_enriched = tables_updated;
        stats.columns_enriched = columns_updated;
    }

    if run.config.enrichment.fk_inference_enabled {
        run_fk_inference(run, &service).await?;
    } else {
        run.events.message("⏭️ FK inference disabled");
    }

    run.events.phase(3.5, "Metadata enrichment", "completed", 100, None);
    Ok(())
}

async fn enrich_one_table(
    run: &Arc<AnalysisRun>,
    service: &MetadataEnrichmentService,
    schema: &str,
    table: &str,
) -> AnalyzerResult<Option<(usize, usize)>> {
    let sample_rows = service.fetch_sample_rows(schema, table).await?;
    if sample_rows.is_empty() {
        return Ok(None);
    }

    let columns_query = format!(
        "MATCH (t:Table {{name: '{table}', schema: '{schema}'}})-[:HAS_COLUMN]->(c:Column) \
         RETURN c.name AS column_name, c.dtype AS data_type, c.description AS description \
         ORDER BY c.name",
        table = crate::utils::escape_for_cypher(table),
        schema = crate::utils::escape_for_cypher(schema),
    );
    let columns_info = {
        let rows = run.graph.execute(&[columns_query]).await?;
        rows.into_iter().next().unwrap_or_default()
    };

    let result = service
        .generate_descriptions(schema, table, &sample_rows, &columns_info)
        .await?;

    let _write_guard = run.cypher_lock.lock().await;
    let updated = service.update_descriptions(schema, table, &result).await?;
    Ok(Some(updated))
}

async fn run_fk_inference(
    run: &Arc<AnalysisRun>,
    service: &MetadataEnrichmentService,
) -> AnalyzerResult<()> {
    run.events.message("🔗 [Phase 3.5] FK inference starting");
    run.events.phase(3.5, "FK inference", "in_progress", 70, None);

    let rows = {
        let result = run.graph.execute(&[TABLE_COLUMNS_QUERY.to_string()]).await?;
        result.into_iter().next().unwrap_or_default()
    };

    let tables: Vec<TableColumns> = rows
        .iter()
        .filter_map(|row| {
            let name = row.get("table_name")?.as_str()?.to_string();
            let schema = row.get("schema_name")?.as_str().unwrap_or("public").to_string();
            let columns = row
                .get("columns")?
                .as_array()?
                .iter()
                .filter_map(|c| c.as_str().map(String::from))
                .collect();
            Some(TableColumns { schema, name, columns })
        })
        .collect();

    if tables.len() < 2 {
        run.events.message("ℹ️ Fewer than two tables, FK inference impossible");
        return Ok(());
    }

    let candidates = service.find_fk_candidates(&tables);
    if candidates.is_empty() {
        run.events.message("ℹ️ No FK candidate pairs found");
        return Ok(());
    }
    run.events.message(format!("📊 {} FK candidate pairs", candidates.len()));

    let total = candidates.len();
    let mut verified_count = 0usize;
    for (idx, candidate) in candidates.iter().enumerate() {
        if !run.control.check_continue().await {
            return Err(AnalyzerError::Cancelled);
        }
        if idx % 10 == 0 {
            let progress = (70 + (idx * 30) / total) as u8;
            run.events.phase(
                3.5,
                "FK inference",
                "in_progress",
                progress,
                Some(json!({ "done": idx, "total": total, "verified": verified_count })),
            );
        }

        match service.verify_fk_candidate(candidate).await {
            Ok(Some(verified)) => {
                let _write_guard = run.cypher_lock.lock().await;
                service.save_fk(&verified).await?;
                verified_count += 1;
                run.events.message(format!(
                    "      ✓ FK confirmed: {}.{}.{} → {}.{}.{} (similarity {:.0}%, match {:.0}%)",
                    candidate.from_schema,
                    candidate.from_table,
                    candidate.from_column,
                    candidate.to_schema,
                    candidate.to_table,
                    candidate.to_column,
                    candidate.similarity * 100.0,
                    verified.match_ratio * 100.0,
                ));
                run.events.send(crate::pipeline::events::StreamEvent::RelationshipEvent {
                    action: "created".to_string(),
                    rel_type: "FK_TO_TABLE".to_string(),
                    source: format!("{}.{}", candidate.from_schema, candidate.from_table),
                    target: format!("{}.{}", candidate.to_schema, candidate.to_table),
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("FK verification failed for {:?}: {}", candidate, e);
            }
        }
    }

    {
        let mut stats = run.stats.lock().expect("stats poisoned");
        stats.fk_relationships_inferred = verified_count;
    }
    run.events.message(format!(
        "✅ FK inference done: {}/{} confirmed",
        verified_count, total
    ));
    Ok(())
}
