//! Analyzer error types
//!
//! One error enum for the whole pipeline, mapped onto the failure kinds
//! each phase can produce. Graph-write failures carry the query count and
//! the failing batch index so a failed run can be diagnosed from the final
//! error event alone.

use crate::llm::LlmError;

/// Pipeline-wide error type
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("graph write failed (queries={query_count}, batch={batch_index:?}): {message}")]
    GraphWrite { message: String, query_count: usize, batch_index: Option<usize> },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("analysis error: {0}")]
    Analysis(String),

    #[error("pipeline stopped")]
    Cancelled,

    #[error("enrichment unavailable: {0}")]
    Enrichment(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type AnalyzerResult<T> = Result<T, AnalyzerError>;

impl AnalyzerError {
    /// Stable error type tag used in the terminal `error` stream event
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Io(_) => "IoError",
            Self::GraphWrite { .. } => "GraphWriteError",
            Self::Llm(_) => "LlmError",
            Self::Analysis(_) => "AnalysisError",
            Self::Cancelled => "PipelineCancelled",
            Self::Enrichment(_) => "EnrichmentError",
            Self::Json(_) => "JsonError",
        }
    }

    /// True when the error means "the operator stopped the run", not a fault
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
