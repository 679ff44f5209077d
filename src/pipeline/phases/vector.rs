//! Phase 4 - vectoriser
//!
//! Embeds every Table and Column that has a description (or an analysed
//! one) but no vector yet. The Cypher projection appends the analysed
//! description so search hits both; write-back is one UNWIND per
//! sub-batch keyed by element id. Any failure is fatal for the run.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;

use crate::llm::embedding::{format_column_text, format_table_text};
use crate::pipeline::orchestrator::AnalysisRun;
use crate::utils::{AnalyzerError, AnalyzerResult};

const TABLE_SELECT_QUERY: &str = "MATCH (t:Table) \
    WHERE (t.vector IS NULL OR size(t.vector) = 0) \
      AND (t.description IS NOT NULL OR t.analyzed_description IS NOT NULL) \
    RETURN elementId(t) AS tid, \
           t.name AS name, \
           t.schema AS schema, \
           trim( \
             coalesce(t.description, '') + \
             CASE WHEN t.analyzed_description IS NOT NULL AND t.analyzed_description <> '' \
                  THEN ' | AI 분석: ' + t.analyzed_description \
                  ELSE '' \
             END \
           ) AS description \
    ORDER BY t.schema, t.name";

const COLUMN_SELECT_QUERY: &str = "MATCH (t:Table)-[:HAS_COLUMN]->(c:Column) \
    WHERE (c.vector IS NULL OR size(c.vector) = 0) \
      AND (c.description IS NOT NULL OR c.analyzed_description IS NOT NULL) \
    RETURN elementId(c) AS cid, \
           c.name AS column_name, \
           t.name AS table_name, \
           coalesce(c.dtype, '') AS dtype, \
           trim( \
             coalesce(c.description, '') + \
             CASE WHEN c.analyzed_description IS NOT NULL AND c.analyzed_description <> '' \
                  THEN ' | AI 분석: ' + c.analyzed_description \
                  ELSE '' \
             END \
           ) AS description \
    ORDER BY t.schema, t.name, c.name";

const TABLE_UPDATE_QUERY: &str = "UNWIND $items AS item \
    MATCH (t) WHERE elementId(t) = item.tid \
    SET t.vector = item.vector \
    RETURN t";

const COLUMN_UPDATE_QUERY: &str = "UNWIND $items AS item \
    MATCH (c) WHERE elementId(c) = item.cid \
    SET c.vector = item.vector \
    RETURN c";

pub async fn run_vectorize_phase(run: &Arc<AnalysisRun>) -> AnalyzerResult<()> {
    run.events.message("📊 [Phase 4] Table vectorization starting");
    run.events.phase(4.0, "Vectorizing", "in_progress", 0, None);
    vectorize_tables(run).await?;

    run.events.message("📊 [Phase 4] Column vectorization starting");
    run.events.phase(4.0, "Vectorizing", "in_progress", 25, None);
    vectorize_columns(run).await?;

    let stats = run.stats.lock().expect("stats poisoned").clone();
    run.events.phase(
        4.0,
        "Vectorizing",
        "completed",
        100,
        Some(json!({
            "tables_vectorized": stats.tables_vectorized,
            "columns_vectorized": stats.columns_vectorized,
        })),
    );
    Ok(())
}

async fn vectorize_tables(run: &Arc<AnalysisRun>) -> AnalyzerResult<()> {
    let tables = {
        let rows = run.graph.execute(&[TABLE_SELECT_QUERY.to_string()]).await?;
        rows.into_iter().next().unwrap_or_default()
    };
    if tables.is_empty() {
        run.events.message("   ℹ️ No tables need vectorization");
        return Ok(());
    }
    run.events.message(format!("   📋 {} tables to vectorize", tables.len()));

    let batch_size = run.config.batch.vector_batch_size;
    let total = tables.len();
    let total_batches = total.div_ceil(batch_size);

    for (batch_idx, batch) in tables.chunks(batch_size).enumerate() {
        if !run.control.check_continue().await {
            return Err(AnalyzerError::Cancelled);
        }

        // Skip rows whose combined description is still empty
        let mut valid: Vec<(&Value, String)> = Vec::new();
        for item in batch {
            let description = item.get("description").and_then(|v| v.as_str()).unwrap_or("");
            if description.is_empty() {
                continue;
            }
            let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("");
            valid.push((item, format_table_text(name, description)));
        }
        if valid.is_empty() {
            continue;
        }

        run.events.message(format!(
            "      🔄 [{}/{}] embedding {} tables",
            batch_idx + 1,
            total_batches,
            valid.len()
        ));
        let texts: Vec<String> = valid.iter().map(|(_, text)| text.clone()).collect();
        let started = Instant::now();
        let vectors = run.embeddings.embed_batch(&texts).await?;
        tracing::info!(
            "Embedding API returned {} vectors in {:.2}s",
            vectors.len(),
            started.elapsed().as_secs_f64()
        );
        validate_dimensions(run, &vectors)?;

        let updates: Vec<Value> = valid
            .iter()
            .zip(vectors.iter())
            .filter(|(_, vector)| !vector.is_empty())
            .map(|((item, _), vector)| json!({ "tid": item["tid"], "vector": vector }))
            .collect();

        if !updates.is_empty() {
            let _write_guard = run.cypher_lock.lock().await;
            run.graph
                .execute_with_params(TABLE_UPDATE_QUERY, json!({ "items": updates }))
                .await?;
            let mut stats = run.stats.lock().expect("stats poisoned");
            stats.tables_vectorized += updates.len();
        }

        let progress = ((batch_idx + 1) * 25 / total_batches) as u8;
        run.events.phase(
            4.0,
            "Vectorizing",
            "in_progress",
            progress,
            Some(json!({ "step": "table_embedding", "batch": batch_idx + 1, "total_batches": total_batches })),
        );
    }

    let stats = run.stats.lock().expect("stats poisoned").clone();
    run.events
        .message(format!("   ✅ Table vectorization done: {} tables", stats.tables_vectorized));
    Ok(())
}

async fn vectorize_columns(run: &Arc<AnalysisRun>) -> AnalyzerResult<()> {
    let columns = {
        let rows = run.graph.execute(&[COLUMN_SELECT_QUERY.to_string()]).await?;
        rows.into_iter().next().unwrap_or_default()
    };
    if columns.is_empty() {
        run.events.message("   ℹ️ No columns need vectorization");
        return Ok(());
    }
    run.events.message(format!("   📋 {} columns to vectorize", columns.len()));

    let batch_size = run.config.batch.vector_batch_size;
    let total = columns.len();
    let total_batches = total.div_ceil(batch_size);

    for (batch_idx, batch) in columns.chunks(batch_size).enumerate() {
        if !run.control.check_continue().await {
            return Err(AnalyzerError::Cancelled);
        }

        let texts: Vec<String> = batch
            .iter()
            .map(|item| {
                format_column_text(
                    item.get("column_name").and_then(|v| v.as_str()).unwrap_or(""),
                    item.get("table_name").and_then(|v| v.as_str()).unwrap_or(""),
                    item.get("dtype").and_then(|v| v.as_str()).unwrap_or(""),
                    item.get("description").and_then(|v| v.as_str()).unwrap_or(""),
                )
            })
            .collect();

        run.events.message(format!(
            "      🔄 [{}/{}] embedding {} columns",
            batch_idx + 1,
            total_batches,
            texts.len()
        ));
        let started = Instant::now();
        let vectors = run.embeddings.embed_batch(&texts).await?;
        tracing::info!(
            "Embedding API returned {} vectors in {:.2}s",
            vectors.len(),
            started.elapsed().as_secs_f64()
        );
        validate_dimensions(run, &vectors)?;

        let updates: Vec<Value> = batch
            .iter()
            .zip(vectors.iter())
            .filter(|(_, vector)| !vector.is_empty())
            .map(|(item, vector)| json!({ "cid": item["cid"], "vector": vector }))
            .collect();

        if !updates.is_empty() {
            let _write_guard = run.cypher_lock.lock().await;
            run.graph
                .execute_with_params(COLUMN_UPDATE_QUERY, json!({ "items": updates }))
                .await?;
            let mut stats = run.stats.lock().expect("stats poisoned");
            stats.columns_vectorized += updates.len();
        }

        let progress = (25 + (batch_idx + 1) * 75 / total_batches) as u8;
        run.events.phase(
            4.0,
            "Vectorizing",
            "in_progress",
            progress,
            Some(json!({ "step": "column_embedding", "batch": batch_idx + 1, "total_batches": total_batches })),
        );
    }

    let stats = run.stats.lock().expect("stats poisoned").clone();
    run.events
        .message(format!("   ✅ Column vectorization done: {} columns", stats.columns_vectorized));
    Ok(())
}

fn validate_dimensions(run: &Arc<AnalysisRun>, vectors: &[Vec<f64>]) -> AnalyzerResult<()> {
    let expected = run.embeddings.dimension();
    for vector in vectors {
        if !vector.is_empty() && vector.len() != expected {
            return Err(AnalyzerError::Analysis(format!(
                "embedding dimension mismatch: expected {}, got {}",
                expected,
                vector.len()
            )));
        }
    }
    Ok(())
}
