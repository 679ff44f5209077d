//! Graph store client
//!
//! All graph mutations flow through this client. It speaks the store's
//! HTTP transactional Cypher API (`POST /db/{database}/tx/commit`) with
//! `resultDataContents: ["row", "graph"]` so every write returns the
//! touched nodes and relationships.
//!
//! Concurrency contract: safe to share for reads; callers must hold the
//! orchestrator's cypher mutex around every write-path method. The mutex
//! lives in the orchestrator because it also guards phase-internal state.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::types::{DeltaCollector, GraphBatch, GraphDelta, GraphNode, GraphRelationship};
use crate::pipeline::control::PipelineController;
use crate::utils::{AnalyzerError, AnalyzerResult};

const CONSTRAINT_QUERIES: &[&str] = &[
    "CREATE CONSTRAINT table_unique IF NOT EXISTS FOR (t:Table) \
     REQUIRE (t.db, t.schema, t.name) IS UNIQUE",
    "CREATE CONSTRAINT column_unique IF NOT EXISTS FOR (c:Column) \
     REQUIRE (c.fqn) IS UNIQUE",
];

pub struct GraphClient {
    http_client: Client,
    endpoint: String,
    user: String,
    password: String,
}

impl GraphClient {
    pub fn new(uri: &str, user: &str, password: &str, database: &str) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build graph HTTP client: {}. Using defaults.", e);
                Client::default()
            });

        let endpoint = format!("{}/db/{}/tx/commit", uri.trim_end_matches('/'), database);
        Self { http_client, endpoint, user: user.to_string(), password: password.to_string() }
    }

    /// Create the Table/Column uniqueness constraints. Runs once per
    /// connection; "already exists" responses are swallowed.
    pub async fn ensure_constraints(&self) -> AnalyzerResult<()> {
        for query in CONSTRAINT_QUERIES {
            if let Err(e) = self.run_statements(&[Statement::plain(query)]).await {
                tracing::debug!("Constraint creation skipped: {}", e);
            }
        }
        Ok(())
    }

    /// Sequential auto-commit execution for reads and small CRUD.
    /// Returns each query's result rows as JSON objects keyed by column.
    pub async fn execute(&self, queries: &[String]) -> AnalyzerResult<Vec<Vec<Value>>> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            let response =
                self.run_statements(&[Statement::plain(query)]).await.map_err(|message| {
                    AnalyzerError::GraphWrite { message, query_count: queries.len(), batch_index: None }
                })?;
            results.push(response.first_result_rows());
        }
        Ok(results)
    }

    /// Single parameterised query; returns its rows.
    pub async fn execute_with_params(
        &self,
        query: &str,
        params: Value,
    ) -> AnalyzerResult<Vec<Value>> {
        let response = self
            .run_statements(&[Statement::with_params(query, params)])
            .await
            .map_err(|message| AnalyzerError::GraphWrite {
                message,
                query_count: 1,
                batch_index: None,
            })?;
        Ok(response.first_result_rows())
    }

    /// Streamed write used by Phase 1/2: executes `queries` in sub-batches
    /// of `batch_size`, hands each sub-batch's deduplicated delta to
    /// `on_batch`, and returns the merged delta. Checks the pipeline
    /// control gate between batches and stops iteration cleanly when the
    /// run is cancelled.
    pub async fn stream_graph(
        &self,
        queries: &[String],
        batch_size: usize,
        control: &PipelineController,
        mut on_batch: impl FnMut(GraphBatch),
    ) -> AnalyzerResult<GraphDelta> {
        if queries.is_empty() {
            return Ok(GraphDelta::default());
        }

        let batch_size = batch_size.max(1);
        let total_batches = queries.len().div_ceil(batch_size);
        let mut merged = DeltaCollector::new();

        for (batch_idx, chunk) in queries.chunks(batch_size).enumerate() {
            if !control.check_continue().await {
                tracing::info!("Graph stream stopped at batch {}/{}", batch_idx, total_batches);
                return Ok(merged.into_delta());
            }

            let mut batch_collector = DeltaCollector::new();
            for query in chunk {
                let response =
                    self.run_statements(&[Statement::plain(query)]).await.map_err(|message| {
                        AnalyzerError::GraphWrite {
                            message,
                            query_count: queries.len(),
                            batch_index: Some(batch_idx),
                        }
                    })?;
                response.collect_graph(&mut batch_collector);
            }

            let delta = batch_collector.into_delta();
            merged.merge(&delta);
            on_batch(GraphBatch { delta, batch: batch_idx + 1, total_batches });
        }

        Ok(merged.into_delta())
    }

    /// One parameterised UNWIND query per sub-batch of `batch_size` items.
    /// Collapses thousands of single-node MERGEs into a handful of calls;
    /// returns the touched nodes and relationships.
    pub async fn batch_unwind(
        &self,
        query: &str,
        items: &[Value],
        batch_size: usize,
    ) -> AnalyzerResult<GraphDelta> {
        if items.is_empty() {
            return Ok(GraphDelta::default());
        }

        let mut collector = DeltaCollector::new();
        for (batch_idx, chunk) in items.chunks(batch_size.max(1)).enumerate() {
            let params = serde_json::json!({ "items": chunk });
            let response = self
                .run_statements(&[Statement::with_params(query, params)])
                .await
                .map_err(|message| AnalyzerError::GraphWrite {
                    message,
                    query_count: items.len(),
                    batch_index: Some(batch_idx),
                })?;
            response.collect_graph(&mut collector);
        }
        Ok(collector.into_delta())
    }

    /// Single UNWIND existence probe over (directory, file_name) pairs.
    pub async fn check_nodes_exist(&self, pairs: &[(String, String)]) -> AnalyzerResult<bool> {
        if pairs.is_empty() {
            return Ok(false);
        }

        let query = "UNWIND $pairs AS target \
                     MATCH (n) \
                     WHERE n.directory = target.directory AND n.file_name = target.file_name \
                     RETURN COUNT(n) > 0 AS exists";
        let params = serde_json::json!({
            "pairs": pairs
                .iter()
                .map(|(d, f)| serde_json::json!({ "directory": d, "file_name": f }))
                .collect::<Vec<_>>()
        });

        let rows = self.execute_with_params(query, params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("exists"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn run_statements(&self, statements: &[Statement<'_>]) -> Result<TxResponse, String> {
        let body = TxRequest { statements };

        let response = self
            .http_client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("graph store request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(format!("graph store returned {}: {}", status, text));
        }

        let tx: TxResponse = response
            .json()
            .await
            .map_err(|e| format!("graph store response parse failed: {}", e))?;

        if let Some(err) = tx.errors.first() {
            return Err(format!("{}: {}", err.code, err.message));
        }
        Ok(tx)
    }
}

// ============================================================================
// Transactional API wire types
// ============================================================================

#[derive(Serialize)]
struct TxRequest<'a> {
    statements: &'a [Statement<'a>],
}

#[derive(Serialize)]
struct Statement<'a> {
    statement: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
    #[serde(rename = "resultDataContents")]
    result_data_contents: &'static [&'static str],
}

impl<'a> Statement<'a> {
    fn plain(statement: &'a str) -> Self {
        Self { statement, parameters: None, result_data_contents: &["row", "graph"] }
    }

    fn with_params(statement: &'a str, parameters: Value) -> Self {
        Self { statement, parameters: Some(parameters), result_data_contents: &["row", "graph"] }
    }
}

#[derive(Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Deserialize)]
struct TxResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Deserialize)]
struct TxRow {
    #[serde(default)]
    row: Option<Vec<Value>>,
    #[serde(default)]
    graph: Option<TxGraph>,
}

#[derive(Deserialize)]
struct TxGraph {
    #[serde(default)]
    nodes: Vec<TxNode>,
    #[serde(default)]
    relationships: Vec<TxRelationship>,
}

#[derive(Deserialize)]
struct TxNode {
    id: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct TxRelationship {
    id: String,
    #[serde(rename = "type")]
    rel_type: String,
    #[serde(rename = "startNode")]
    start_node: String,
    #[serde(rename = "endNode")]
    end_node: String,
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct TxError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl TxResponse {
    /// Rows of the first result, as objects keyed by column name
    fn first_result_rows(&self) -> Vec<Value> {
        let Some(result) = self.results.first() else {
            return Vec::new();
        };
        result
            .data
            .iter()
            .filter_map(|row| row.row.as_ref())
            .map(|values| {
                let mut object = serde_json::Map::new();
                for (column, value) in result.columns.iter().zip(values.iter()) {
                    object.insert(column.clone(), value.clone());
                }
                Value::Object(object)
            })
            .collect()
    }

    fn collect_graph(&self, collector: &mut DeltaCollector) {
        for result in &self.results {
            for row in &result.data {
                let Some(graph) = &row.graph else { continue };
                for node in &graph.nodes {
                    collector.add_node(GraphNode {
                        node_id: node.id.clone(),
                        labels: node.labels.clone(),
                        properties: node.properties.clone(),
                    });
                }
                for rel in &graph.relationships {
                    collector.add_relationship(GraphRelationship {
                        relationship_id: rel.id.clone(),
                        rel_type: rel.rel_type.clone(),
                        properties: rel.properties.clone(),
                        start_node_id: rel.start_node.clone(),
                        end_node_id: rel.end_node.clone(),
                    });
                }
            }
        }
    }
}
