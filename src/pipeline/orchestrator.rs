//! Analysis run orchestrator
//!
//! Owns everything the phases share: the graph client, the single cypher
//! mutex that serialises every write path, the file semaphore, the DDL
//! catalog, the controller, the event sink and the run statistics. Runs
//! the phases strictly in order; each drains fully before the next
//! starts.

use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::ddl::DdlCatalog;
use crate::graph::GraphClient;
use crate::llm::{ChatModel, EmbeddingModel};
use crate::pipeline::control::{PipelineController, PipelinePhase};
use crate::pipeline::events::EventSink;
use crate::pipeline::file_context::FileAnalysisContext;
use crate::pipeline::phases;
use crate::pipeline::stats::AnalysisStats;
use crate::utils::{AnalyzerError, AnalyzerResult};

pub struct AnalysisRun {
    pub config: Arc<Config>,
    pub graph: Arc<GraphClient>,
    pub llm: Arc<dyn ChatModel>,
    pub embeddings: Arc<dyn EmbeddingModel>,
    pub control: Arc<PipelineController>,
    pub events: EventSink,
    /// Serialises every write-path use of the graph client. Lives here,
    /// not in the client, because it also guards phase-internal state.
    pub cypher_lock: Arc<tokio::sync::Mutex<()>>,
    pub file_semaphore: Arc<Semaphore>,
    pub catalog: Arc<DdlCatalog>,
    pub stats: Mutex<AnalysisStats>,
    pub trace_id: String,
}

impl AnalysisRun {
    pub fn new(
        config: Arc<Config>,
        graph: Arc<GraphClient>,
        llm: Arc<dyn ChatModel>,
        embeddings: Arc<dyn EmbeddingModel>,
        control: Arc<PipelineController>,
        events: EventSink,
    ) -> Self {
        let file_concurrency = config.concurrency.file_concurrency;
        Self {
            config,
            graph,
            llm,
            embeddings,
            control,
            events,
            cypher_lock: Arc::new(tokio::sync::Mutex::new(())),
            file_semaphore: Arc::new(Semaphore::new(file_concurrency)),
            catalog: Arc::new(DdlCatalog::new()),
            stats: Mutex::new(AnalysisStats::default()),
            trace_id: format!("stream-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    /// `(directory, file_name)` pairs under `<base>/src`, recursively
    pub fn discover_source_files(&self) -> AnalyzerResult<Vec<(String, String)>> {
        let src_dir = self.config.src_dir();
        if !src_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        walk_sql_files(&src_dir, &src_dir, &mut files)?;
        files.sort();
        Ok(files)
    }

    /// Run the full pipeline. Emits the terminal `error` event itself so
    /// callers only need to drain the event stream.
    pub async fn run(self: &Arc<Self>, files: Vec<(String, String)>) -> AnalyzerResult<()> {
        match self.run_inner(files).await {
            Ok(()) => {
                self.control.set_phase(PipelinePhase::Completed, "analysis complete");
                let summary = self.stats.lock().expect("stats poisoned").summary_line();
                self.events.message("✅ Analysis complete");
                self.events.complete(Some(summary));
                Ok(())
            }
            // A stop lands wherever the pipeline happened to be; batch
            // failures caused by it still count as a cancellation
            Err(e) if e.is_cancelled() || self.control.is_stopped() => {
                self.control.set_phase(PipelinePhase::Cancelled, "stopped by operator");
                self.events.message("⏹️ Analysis stopped");
                self.events.complete(None);
                Err(AnalyzerError::Cancelled)
            }
            Err(e) => {
                self.control.set_phase(PipelinePhase::Failed, "analysis failed");
                tracing::error!("[{}] analysis failed: {}", self.trace_id, e);
                self.events
                    .error(e.to_string(), e.error_type(), &self.trace_id);
                Err(e)
            }
        }
    }

    async fn run_inner(self: &Arc<Self>, files: Vec<(String, String)>) -> AnalyzerResult<()> {
        let total_files = files.len();
        self.events.message("🚀 Starting DBMS code analysis");
        self.events
            .message(format!("📦 Project: {}", self.config.analysis.project_name));
        self.events.message(format!("📊 {} SQL files to analyse", total_files));

        self.graph.ensure_constraints().await?;
        self.events.message("🔌 Graph store connected, constraints ensured");

        if self.graph.check_nodes_exist(&files).await? {
            self.events.message("🔄 Previous analysis found → incremental update");
        } else {
            self.events.message("🆕 Fresh analysis");
        }

        // Phase 0: DDL
        self.checkpoint()?;
        self.control.set_phase(PipelinePhase::DdlProcessing, "DDL processing");
        phases::ddl::run_ddl_phase(self).await?;

        // Phase 1: static graphs
        self.checkpoint()?;
        self.control.set_phase(PipelinePhase::AstGeneration, "AST graph build");
        self.events
            .message(format!("🔍 [Phase 1] Building static graphs ({} files)", total_files));
        let mut contexts: Vec<FileAnalysisContext> = files
            .iter()
            .map(|(directory, file_name)| FileAnalysisContext::new(directory, file_name))
            .collect();
        phases::ast::run_phase1(self, &mut contexts).await?;

        // Phase 2: LLM analysis over the same processors
        self.checkpoint()?;
        self.control.set_phase(PipelinePhase::LlmAnalysis, "AI analysis");
        self.events.message("🤖 [Phase 2] LLM analysis");
        phases::llm::run_phase2(self, &mut contexts).await?;

        // Phase 3.5: enrichment; endpoint trouble never kills the run
        self.checkpoint()?;
        self.control
            .set_phase(PipelinePhase::TableEnrichment, "metadata enrichment");
        phases::metadata::run_metadata_phase(self).await?;

        // Phase 4: vectors
        self.checkpoint()?;
        self.control.set_phase(PipelinePhase::Vectorizing, "vectorizing");
        phases::vector::run_vectorize_phase(self).await?;

        // Phase 5: lineage
        self.checkpoint()?;
        self.control.update_progress(0, "lineage analysis");
        phases::lineage::run_lineage_phase(self).await?;

        Ok(())
    }

    fn checkpoint(&self) -> AnalyzerResult<()> {
        if self.control.is_stopped() {
            Err(AnalyzerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn walk_sql_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, String)>,
) -> AnalyzerResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_sql_files(root, &path, out)?;
            continue;
        }
        let is_sql = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("sql"));
        if !is_sql {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let directory = path
            .parent()
            .and_then(|p| p.strip_prefix(root).ok())
            .and_then(|p| p.to_str())
            .unwrap_or("")
            .replace('\\', "/");
        out.push((directory, file_name.to_string()));
    }
    Ok(())
}
