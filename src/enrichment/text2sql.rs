//! Text-to-SQL sampling endpoint client
//!
//! The only live-database access in the pipeline, and it is read-only:
//! `POST /direct_sql` runs a sampling query, `GET /health` gates the
//! whole enrichment phase.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::llm::LlmError;

pub struct Text2SqlClient {
    http_client: Client,
    base_url: String,
}

impl Text2SqlClient {
    pub fn new(base_url: &str) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build Text2SQL HTTP client: {}. Using defaults.", e);
                Client::default()
            });
        Self { http_client, base_url: base_url.trim_end_matches('/').to_string() }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One health probe controls the whole enrichment phase
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!("Text2SQL health probe failed: {}", e);
                false
            }
        }
    }

    /// Run a read-only sampling query; returns the row objects
    pub async fn fetch_rows(&self, sql: &str) -> Result<Vec<Value>, LlmError> {
        let url = format!("{}/direct_sql", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&DirectSqlRequest { sql: sql.to_string() })
            .send()
            .await
            .map_err(|e| LlmError::ApiError(format!("Text2SQL request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(LlmError::ApiError(format!("Text2SQL error {}: {}", status, text)));
        }

        let body: DirectSqlResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Text2SQL response: {e}")))?;
        Ok(body.rows)
    }
}

#[derive(Debug, Serialize)]
struct DirectSqlRequest {
    sql: String,
}

#[derive(Debug, Deserialize)]
struct DirectSqlResponse {
    #[serde(default)]
    rows: Vec<Value>,
}
