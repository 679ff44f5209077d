//! LLM data models
//!
//! Request/response structures for the analysis scenarios, the error
//! type, and the normaliser for the two response shapes the analysis
//! prompt is allowed to return.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::text::clean_llm_json;

// ============================================================================
// LLM Error Types
// ============================================================================

/// LLM service errors
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API key not configured")]
    NotConfigured,

    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM response parsing error: {0}")]
    ParseError(String),

    #[error("LLM timeout after {0}s")]
    Timeout(u64),

    #[error("LLM rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("Embedding error: {0}")]
    EmbeddingError(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::ApiError(_))
    }
}

// ============================================================================
// Provider seams (mockable in tests)
// ============================================================================

/// Chat completion seam. One call per analysis batch; the response body
/// must be a JSON document after code-fence cleanup.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;
}

/// Embedding seam. One call per vectoriser sub-batch.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, LlmError>;

    /// Model-defined vector dimension, for write-back validation
    fn dimension(&self) -> usize;
}

// ============================================================================
// Batch analysis response
// ============================================================================

/// How a statement touches a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableAccess {
    pub name: String,
    /// read | write | execute
    #[serde(default = "default_access")]
    pub access: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub db_link: String,
}

fn default_access() -> String {
    "read".to_string()
}

/// A procedure/function call site detected in a statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRef {
    pub name: String,
    /// internal | external
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    "internal".to_string()
}

/// Per-node analysis entry, aligned with the batch's node order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAnalysis {
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tables: Vec<TableAccess>,
    #[serde(default)]
    pub calls: Vec<CallRef>,
}

/// Table-level analysis entry produced alongside DML summaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableAnalysis {
    pub table: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AnalysisDocument {
    #[serde(default)]
    analysis: Vec<NodeAnalysis>,
    #[serde(default, rename = "tableAnalysis")]
    table_analysis: Vec<TableAnalysis>,
}

/// The analysis prompt may answer with either a single document carrying
/// an `analysis` array, or a two-element array of (general, table)
/// documents. Both normalise to the same variant data here.
#[derive(Debug, Clone)]
pub enum LlmResult {
    AnalysisOnly(Vec<NodeAnalysis>),
    GeneralAndTable { analysis: Vec<NodeAnalysis>, tables: Vec<TableAnalysis> },
}

impl LlmResult {
    pub fn parse(content: &str) -> Result<Self, LlmError> {
        let cleaned = clean_llm_json(content);
        let value: serde_json::Value = serde_json::from_str(&cleaned)
            .map_err(|e| LlmError::ParseError(format!("{}; content: {:.200}", e, cleaned)))?;

        match value {
            serde_json::Value::Object(_) => {
                let doc: AnalysisDocument = serde_json::from_value(value)
                    .map_err(|e| LlmError::ParseError(e.to_string()))?;
                if doc.table_analysis.is_empty() {
                    Ok(Self::AnalysisOnly(doc.analysis))
                } else {
                    Ok(Self::GeneralAndTable { analysis: doc.analysis, tables: doc.table_analysis })
                }
            }
            serde_json::Value::Array(mut parts) => {
                if parts.is_empty() {
                    return Err(LlmError::ParseError("empty result array".to_string()));
                }
                let general: AnalysisDocument = serde_json::from_value(parts.remove(0))
                    .map_err(|e| LlmError::ParseError(format!("general part: {}", e)))?;
                let tables: Vec<TableAnalysis> = if parts.is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_value(parts.remove(0))
                        .map_err(|e| LlmError::ParseError(format!("table part: {}", e)))?
                };
                Ok(Self::GeneralAndTable { analysis: general.analysis, tables })
            }
            other => Err(LlmError::ParseError(format!("unexpected result shape: {}", other))),
        }
    }

    pub fn analysis(&self) -> &[NodeAnalysis] {
        match self {
            Self::AnalysisOnly(analysis) => analysis,
            Self::GeneralAndTable { analysis, .. } => analysis,
        }
    }

    pub fn tables(&self) -> &[TableAnalysis] {
        match self {
            Self::AnalysisOnly(_) => &[],
            Self::GeneralAndTable { tables, .. } => tables,
        }
    }
}

// ============================================================================
// Simple response documents
// ============================================================================

/// Response of the parent-context extraction prompt
#[derive(Debug, Clone, Deserialize)]
pub struct ContextResponse {
    #[serde(default)]
    pub context: String,
}

/// Response of the chunk/merge summary prompts
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryResponse {
    #[serde(default)]
    pub summary: String,
}

/// Response of the table enrichment prompt
#[derive(Debug, Clone, Deserialize)]
pub struct TableDescriptionResponse {
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "detailDescription")]
    pub detail_description: String,
}

/// Response of the sample-data description prompt (Phase 3.5)
#[derive(Debug, Clone, Deserialize)]
pub struct SampleDescriptionResponse {
    #[serde(default, rename = "tableDescription")]
    pub table_description: String,
    #[serde(default)]
    pub columns: Vec<SampleColumnDescription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SampleColumnDescription {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analysis_only_shape() {
        let content = r#"{"analysis": [{"summary": "reads orders", "tables": [{"name": "sales.orders"}]}]}"#;
        let result = LlmResult::parse(content).unwrap();
        assert_eq!(result.analysis().len(), 1);
        assert_eq!(result.analysis()[0].summary, "reads orders");
        assert_eq!(result.analysis()[0].tables[0].access, "read");
        assert!(result.tables().is_empty());
    }

    #[test]
    fn test_parse_general_and_table_tuple_shape() {
        let content = r#"[
            {"analysis": [{"summary": "inserts into fact"}]},
            [{"table": "dw.fact", "summary": "daily load target"}]
        ]"#;
        let result = LlmResult::parse(content).unwrap();
        assert_eq!(result.analysis().len(), 1);
        assert_eq!(result.tables().len(), 1);
        assert_eq!(result.tables()[0].table, "dw.fact");
    }

    #[test]
    fn test_parse_fenced_response() {
        let content = "```json\n{\"analysis\": [{\"summary\": \"x\"},]}\n```";
        let result = LlmResult::parse(content).unwrap();
        assert_eq!(result.analysis().len(), 1);
    }

    #[test]
    fn test_parse_rejects_scalar() {
        assert!(LlmResult::parse("42").is_err());
        assert!(LlmResult::parse("[]").is_err());
    }
}
