//! Phase 5 - lineage extraction
//!
//! Scans every SQL file under the source directory for ETL patterns and
//! writes ETL_READS / ETL_WRITES / DATA_FLOWS_TO onto the graph built by
//! the earlier phases. A missing source directory skips the phase; any
//! other failure aborts the run.

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::lineage::{LineageAnalyzer, LineageInfo};
use crate::pipeline::orchestrator::AnalysisRun;
use crate::utils::{AnalyzerError, AnalyzerResult};

pub async fn run_lineage_phase(run: &Arc<AnalysisRun>) -> AnalyzerResult<()> {
    let source_dir = run.config.src_dir();
    if !source_dir.is_dir() {
        run.events.message("ℹ️ No source directory, skipping lineage analysis");
        return Ok(());
    }

    let mut sql_files: Vec<PathBuf> = Vec::new();
    collect_sql_files(&source_dir, &mut sql_files)?;
    if sql_files.is_empty() {
        run.events.message("ℹ️ No SQL files, skipping lineage analysis");
        return Ok(());
    }
    sql_files.sort();

    let total = sql_files.len();
    tracing::info!("Lineage analysis over {} SQL files", total);
    run.events.message(format!(
        "🔍 [Phase 5] Scanning {} SQL files for ETL patterns",
        total
    ));
    run.events.phase(5.0, "Lineage analysis", "in_progress", 0, Some(json!({ "total_files": total })));

    let analyzer = LineageAnalyzer::new(run.config.analysis.name_case);
    let mut all_lineages: Vec<LineageInfo> = Vec::new();
    let mut files_with_etl = 0usize;

    for (idx, sql_file) in sql_files.iter().enumerate() {
        if !run.control.check_continue().await {
            return Err(AnalyzerError::Cancelled);
        }

        let file_name = sql_file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let content = tokio::fs::read_to_string(sql_file).await.map_err(|e| {
            AnalyzerError::Analysis(format!("lineage scan failed for {}: {}", file_name, e))
        })?;

        let mut etl_lineages: Vec<LineageInfo> = analyzer
            .analyze_sql_content(&content, &file_name)
            .into_iter()
            .filter(|l| l.is_etl)
            .collect();

        if etl_lineages.is_empty() {
            run.events
                .message(format!("   ⏭️ [{}/{}] {}: no ETL pattern", idx + 1, total, file_name));
        } else {
            files_with_etl += 1;
            for lineage in etl_lineages.iter_mut() {
                lineage.file_name = file_name.clone();
                run.events.send(crate::pipeline::events::StreamEvent::NodeEvent {
                    action: "updated".to_string(),
                    node_type: "PROCEDURE".to_string(),
                    node_name: lineage.etl_name.clone(),
                });
            }
            run.events.message(format!(
                "   ✅ [{}/{}] {}: {} ETL procedure(s)",
                idx + 1,
                total,
                file_name,
                etl_lineages.len()
            ));
            all_lineages.extend(etl_lineages);
        }

        let progress = (((idx + 1) * 80) / total) as u8;
        run.events.phase(
            5.0,
            "Lineage analysis",
            "in_progress",
            progress,
            Some(json!({
                "current_file": file_name,
                "done": idx + 1,
                "total": total,
                "etl_found": all_lineages.len(),
            })),
        );
    }

    tracing::info!("Lineage scan done: {}/{} files with ETL patterns", files_with_etl, total);

    if all_lineages.is_empty() {
        run.events.message("ℹ️ No ETL patterns, no lineage relationships created");
        run.events.phase(5.0, "Lineage analysis", "completed", 100, Some(json!({ "etl_nodes": 0 })));
        return Ok(());
    }

    run.events
        .message(format!("💾 Saving {} ETL patterns to the graph", all_lineages.len()));
    run.events.phase(5.0, "Lineage analysis", "in_progress", 85, None);

    let (queries, stats) = analyzer.build_save_queries(&all_lineages);
    let delta = {
        let _write_guard = run.cypher_lock.lock().await;
        run.graph
            .stream_graph(&queries, run.config.batch.graph_query_batch_size, &run.control, |_| {})
            .await?
    };

    {
        let mut run_stats = run.stats.lock().expect("stats poisoned");
        run_stats.etl_count = stats.etl_nodes;
        run_stats.data_flows = stats.data_flows;
    }

    run.events.message(format!(
        "✅ Lineage saved: {} ETL procedures, {} ETL_READS, {} ETL_WRITES, {} DATA_FLOWS_TO",
        stats.etl_nodes, stats.etl_reads, stats.etl_writes, stats.data_flows
    ));
    if !delta.is_empty() {
        run.events.data(delta, Some(100), None);
    }
    run.events.phase(
        5.0,
        "Lineage analysis",
        "completed",
        100,
        Some(json!({
            "etl_nodes": stats.etl_nodes,
            "etl_reads": stats.etl_reads,
            "etl_writes": stats.etl_writes,
            "data_flows": stats.data_flows,
        })),
    );
    Ok(())
}

fn collect_sql_files(dir: &std::path::Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_sql_files(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("sql")) {
            out.push(path);
        }
    }
    Ok(())
}
