//! Phase 1 - static graph builder
//!
//! Builds every file's AST processor and static graph in parallel under
//! the file semaphore. Work inside a file is sequential. Any file
//! failure marks it PH1_FAIL (its Phase 2 is skipped) and aborts the run:
//! partial output is unsafe.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::analysis::processor::{AstProcessor, ProcessorSettings};
use crate::analysis::ast_model::AstRoot;
use crate::graph::GraphDelta;
use crate::pipeline::file_context::{FileAnalysisContext, FileStatus};
use crate::pipeline::orchestrator::AnalysisRun;
use crate::utils::{AnalyzerError, AnalyzerResult};

const QUEUE_WAIT: Duration = Duration::from_secs(300);

enum FileOutcome {
    Success {
        index: usize,
        processor: Arc<AstProcessor>,
        graph: GraphDelta,
    },
    Error {
        index: usize,
        message: String,
    },
}

pub async fn run_phase1(
    run: &Arc<AnalysisRun>,
    contexts: &mut [FileAnalysisContext],
) -> AnalyzerResult<()> {
    if contexts.is_empty() {
        run.events.message("ℹ️ No source files to analyse");
        return Ok(());
    }

    let total = contexts.len();
    let (tx, mut rx) = mpsc::unbounded_channel::<FileOutcome>();
    let mut tasks: JoinSet<()> = JoinSet::new();

    for (index, ctx) in contexts.iter().enumerate() {
        let run = Arc::clone(run);
        let tx = tx.clone();
        let directory = ctx.directory.clone();
        let file_name = ctx.file_name.clone();

        tasks.spawn(async move {
            let Ok(_permit) = Arc::clone(&run.file_semaphore).acquire_owned().await else {
                return;
            };
            let outcome = match process_file(&run, &directory, &file_name).await {
                Ok((processor, graph)) => FileOutcome::Success { index, processor, graph },
                Err(e) => FileOutcome::Error { index, message: e.to_string() },
            };
            let _ = tx.send(outcome);
        });
    }
    drop(tx);

    let mut completed = 0usize;
    let mut failed = false;
    while completed < total {
        let outcome = tokio::time::timeout(QUEUE_WAIT, rx.recv())
            .await
            .map_err(|_| AnalyzerError::Analysis("Phase 1 result wait timed out".into()))?
            .ok_or_else(|| AnalyzerError::Analysis("Phase 1 workers hung up".into()))?;

        completed += 1;
        let progress = ((completed * 50) / total) as u8;

        match outcome {
            FileOutcome::Success { index, processor, graph } => {
                let ctx = &mut contexts[index];
                ctx.status = FileStatus::Ph1Ok;
                ctx.processor = Some(processor);

                {
                    let mut stats = run.stats.lock().expect("stats poisoned");
                    stats.files_completed = completed;
                    stats.add_graph_result(&graph, true);
                }

                run.events
                    .message(format!("   ✓ [{}/{}] {}", completed, total, ctx.display_name()));
                let unit_count = graph.count_label("PROCEDURE") + graph.count_label("FUNCTION");
                let statement_count: usize = ["SELECT", "INSERT", "UPDATE", "DELETE", "MERGE"]
                    .iter()
                    .map(|label| graph.count_label(label))
                    .sum();
                if unit_count + statement_count > 0 {
                    run.events.message(format!(
                        "      → {} procedures/functions, {} SQL statements, {} relationships",
                        unit_count,
                        statement_count,
                        graph.relationships.len()
                    ));
                }

                run.events.phase(
                    1.0,
                    "AST graph build",
                    "in_progress",
                    progress,
                    Some(json!({
                        "file": ctx.file_name,
                        "nodes": graph.nodes.len(),
                        "relationships": graph.relationships.len(),
                        "completed": completed,
                        "total": total,
                    })),
                );
                if !graph.is_empty() {
                    run.events.data(graph, Some(progress), Some(ctx.display_name()));
                }
            }
            FileOutcome::Error { index, message } => {
                let ctx = &mut contexts[index];
                ctx.status = FileStatus::Ph1Fail;
                ctx.error_message = message.chars().take(100).collect();
                failed = true;

                tracing::error!("Phase 1 failed for {}: {}", ctx.display_name(), message);
                run.events.message(format!(
                    "   ❌ [{}/{}] {}: {:.80}",
                    completed,
                    total,
                    ctx.display_name(),
                    message
                ));
                {
                    let mut stats = run.stats.lock().expect("stats poisoned");
                    stats.mark_file_failed(&ctx.display_name(), "Phase 1 failed");
                }
                run.events.phase(
                    1.0,
                    "AST graph build",
                    "in_progress",
                    progress,
                    Some(json!({
                        "file": ctx.file_name,
                        "status": "failed",
                        "completed": completed,
                        "total": total,
                    })),
                );
            }
        }
        run.control.update_progress(progress, "");
    }

    while tasks.join_next().await.is_some() {}

    if failed {
        return Err(AnalyzerError::Analysis(
            "Phase 1 failed for at least one file; partial output is unsafe".into(),
        ));
    }
    Ok(())
}

async fn process_file(
    run: &Arc<AnalysisRun>,
    directory: &str,
    file_name: &str,
) -> AnalyzerResult<(Arc<AstProcessor>, GraphDelta)> {
    let (ast, source) = load_file_assets(run, directory, file_name).await?;

    let default_schema = run.catalog.resolve_default_schema(directory);
    let settings = ProcessorSettings {
        db_name: run.config.analysis.target_db.to_lowercase(),
        dialect: run.config.analysis.target_db.clone(),
        locale: run.config.analysis.locale.clone(),
        name_case: run.config.analysis.name_case,
        max_workers: run.config.concurrency.max_concurrency,
        max_batch_token: run.config.batch.max_batch_token,
        max_context_token: run.config.batch.max_context_token,
        max_summary_chunk_token: run.config.batch.max_summary_chunk_token,
    };

    let processor = Arc::new(AstProcessor::new(
        &ast,
        &source,
        directory,
        file_name,
        &default_schema,
        Arc::clone(&run.catalog),
        Arc::clone(&run.llm),
        settings,
    ));

    let queries = processor.build_static_graph_queries();
    let graph = {
        let _write_guard = run.cypher_lock.lock().await;
        run.graph
            .stream_graph(
                &queries,
                run.config.batch.graph_query_batch_size,
                &run.control,
                |_| {},
            )
            .await?
    };

    Ok((processor, graph))
}

async fn load_file_assets(
    run: &Arc<AnalysisRun>,
    directory: &str,
    file_name: &str,
) -> AnalyzerResult<(AstRoot, String)> {
    let src_path = run.config.src_dir().join(directory).join(file_name);
    let base_name = std::path::Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let ast_path = run
        .config
        .ast_dir()
        .join(directory)
        .join(format!("{}.json", base_name));

    let source = tokio::fs::read_to_string(&src_path).await?;
    let ast_json = tokio::fs::read_to_string(&ast_path).await?;
    let ast: AstRoot = serde_json::from_str(&ast_json)?;
    Ok((ast, source))
}
