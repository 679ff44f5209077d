//! Phase 2 - LLM analysis
//!
//! Runs every PH1_OK file's LLM analysis in parallel under the file
//! semaphore, reusing the processors built in Phase 1. Batch-level
//! write progress streams through as `batch_progress` deltas. Any file
//! failure aborts the run; partial results are not accepted.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::analysis::processor::BatchProgress;
use crate::graph::GraphDelta;
use crate::pipeline::file_context::{FileAnalysisContext, FileStatus};
use crate::pipeline::orchestrator::AnalysisRun;
use crate::utils::{AnalyzerError, AnalyzerResult};

const QUEUE_WAIT: Duration = Duration::from_secs(300);
/// Bound on one file's entire LLM pass
const FILE_TIMEOUT: Duration = Duration::from_secs(600);

enum Phase2Outcome {
    Progress(BatchProgress),
    Success { index: usize, graph: GraphDelta, query_count: usize },
    Error { index: usize, message: String },
}

pub async fn run_phase2(
    run: &Arc<AnalysisRun>,
    contexts: &mut [FileAnalysisContext],
) -> AnalyzerResult<()> {
    let eligible: Vec<usize> = contexts
        .iter()
        .enumerate()
        .filter(|(_, ctx)| ctx.status == FileStatus::Ph1Ok && ctx.processor.is_some())
        .map(|(index, _)| index)
        .collect();

    if eligible.is_empty() {
        run.events.message("ℹ️ No files eligible for LLM analysis");
        return Ok(());
    }

    let total = eligible.len();
    let (tx, mut rx) = mpsc::unbounded_channel::<Phase2Outcome>();

    // Bridge batch-level progress into the same outcome stream
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<BatchProgress>();
    let bridge_tx = tx.clone();
    let bridge = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            if bridge_tx.send(Phase2Outcome::Progress(progress)).is_err() {
                break;
            }
        }
    });

    let mut tasks: JoinSet<()> = JoinSet::new();
    for index in eligible {
        let run = Arc::clone(run);
        let tx = tx.clone();
        let progress_tx = progress_tx.clone();
        let processor = contexts[index]
            .processor
            .clone()
            .expect("eligibility filter checked processor");

        tasks.spawn(async move {
            let Ok(_permit) = Arc::clone(&run.file_semaphore).acquire_owned().await else {
                return;
            };
            let analysis = tokio::time::timeout(
                FILE_TIMEOUT,
                processor.run_llm_analysis(
                    &run.graph,
                    &run.cypher_lock,
                    &run.control,
                    run.config.batch.graph_query_batch_size,
                    progress_tx,
                ),
            )
            .await;

            let outcome = match analysis {
                Ok(Ok(outcome)) => Phase2Outcome::Success {
                    index,
                    graph: outcome.graph,
                    query_count: outcome.query_count,
                },
                Ok(Err(e)) => Phase2Outcome::Error { index, message: e.to_string() },
                Err(_) => Phase2Outcome::Error {
                    index,
                    message: format!("LLM analysis timed out after {}s", FILE_TIMEOUT.as_secs()),
                },
            };
            let _ = tx.send(outcome);
        });
    }
    drop(tx);
    drop(progress_tx);

    let mut completed = 0usize;
    let mut failed = false;
    while completed < total {
        let outcome = tokio::time::timeout(QUEUE_WAIT, rx.recv())
            .await
            .map_err(|_| AnalyzerError::Analysis("Phase 2 result wait timed out".into()))?
            .ok_or_else(|| AnalyzerError::Analysis("Phase 2 workers hung up".into()))?;

        match outcome {
            Phase2Outcome::Progress(progress) => {
                run.events.message(format!(
                    "      📦 {}: batch {} saved ({} nodes)",
                    progress.file,
                    progress.batch,
                    progress.graph.nodes.len()
                ));
                if !progress.graph.is_empty() {
                    run.events.data(progress.graph, None, Some(progress.file));
                }
                continue;
            }
            Phase2Outcome::Success { index, graph, query_count } => {
                completed += 1;
                let progress = (50 + (completed * 50) / total) as u8;
                let ctx = &mut contexts[index];
                ctx.status = FileStatus::Ph2Ok;

                {
                    let mut stats = run.stats.lock().expect("stats poisoned");
                    stats.llm_batches_executed += 1;
                    stats.add_graph_result(&graph, false);
                }

                let summaries = graph
                    .nodes
                    .iter()
                    .filter(|n| n.properties.get("summary").is_some_and(|s| !s.as_str().unwrap_or("").is_empty()))
                    .count();
                run.events.message(format!(
                    "   ✓ [{}/{}] {} ({} queries)",
                    completed,
                    total,
                    ctx.display_name(),
                    query_count
                ));
                if summaries > 0 || !graph.relationships.is_empty() {
                    run.events.message(format!(
                        "      → {} summaries written, {} relationships updated",
                        summaries,
                        graph.relationships.len()
                    ));
                }

                run.events.phase(
                    2.0,
                    "AI analysis",
                    "in_progress",
                    progress,
                    Some(json!({
                        "file": ctx.file_name,
                        "queries": query_count,
                        "nodes_updated": graph.nodes.len(),
                        "relationships_updated": graph.relationships.len(),
                        "completed": completed,
                        "total": total,
                    })),
                );
                if !graph.is_empty() {
                    run.events.data(graph, Some(progress), Some(ctx.display_name()));
                }
                run.control.update_progress(progress, "");
            }
            Phase2Outcome::Error { index, message } => {
                completed += 1;
                failed = true;
                let progress = (50 + (completed * 50) / total) as u8;
                let ctx = &mut contexts[index];
                ctx.status = FileStatus::Ph2Fail;
                ctx.error_message = message.chars().take(100).collect();

                tracing::error!("Phase 2 failed for {}: {}", ctx.display_name(), message);
                run.events.message(format!(
                    "   ❌ [{}/{}] {}: {:.120}",
                    completed,
                    total,
                    ctx.display_name(),
                    message
                ));
                {
                    let mut stats = run.stats.lock().expect("stats poisoned");
                    stats.llm_batches_failed += 1;
                    stats.mark_file_failed(&ctx.display_name(), "Phase 2 failed");
                }
                run.events.phase(
                    2.0,
                    "AI analysis",
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
    }

    while tasks.join_next().await.is_some() {}
    bridge.abort();

    if failed {
        return Err(AnalyzerError::Analysis(
            "Phase 2 failed for at least one file; partial output is unsafe".into(),
        ));
    }
    Ok(())
}
