//! Embedding client for table/column vectorization

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::models::{EmbeddingModel, LlmError};

pub struct EmbeddingClient {
    http_client: Client,
    api_base: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl EmbeddingClient {
    pub fn new(api_base: &str, api_key: &str, model: &str, dimension: usize) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build embedding HTTP client: {}. Using defaults.", e);
                Client::default()
            });

        Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingModel for EmbeddingClient {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if self.api_key.is_empty() {
            return Err(LlmError::NotConfigured);
        }

        // Providers reject empty inputs; substitute a placeholder
        let inputs: Vec<String> = texts
            .iter()
            .map(|t| if t.trim().is_empty() { "empty".to_string() } else { t.clone() })
            .collect();

        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: inputs,
            encoding_format: "float".to_string(),
        };

        let url = format!("{}/embeddings", self.api_base);
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::EmbeddingError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::EmbeddingError(format!("API error {}: {}", status, error_text)));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LlmError::EmbeddingError(e.to_string()))?;

        let mut items = body.data;
        items.sort_by_key(|d| d.index);
        Ok(items.into_iter().map(|d| d.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Format table metadata for embedding
pub fn format_table_text(table_name: &str, description: &str) -> String {
    if description.is_empty() {
        format!("Table: {}", table_name)
    } else {
        format!("Table: {} | Description: {}", table_name, description)
    }
}

/// Format column metadata for embedding
pub fn format_column_text(
    column_name: &str,
    table_name: &str,
    dtype: &str,
    description: &str,
) -> String {
    let mut parts = vec![format!("Column: {}.{}", table_name, column_name), format!("Type: {}", dtype)];
    if !description.is_empty() {
        parts.push(format!("Description: {}", description));
    }
    parts.join(" | ")
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
    encoding_format: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_table_text() {
        assert_eq!(
            format_table_text("ORDERS", "Customer orders"),
            "Table: ORDERS | Description: Customer orders"
        );
        assert_eq!(format_table_text("ORDERS", ""), "Table: ORDERS");
    }

    #[test]
    fn test_format_column_text() {
        assert_eq!(
            format_column_text("ID", "ORDERS", "NUMBER", "Primary key"),
            "Column: ORDERS.ID | Type: NUMBER | Description: Primary key"
        );
        assert_eq!(format_column_text("ID", "ORDERS", "NUMBER", ""), "Column: ORDERS.ID | Type: NUMBER");
    }
}
