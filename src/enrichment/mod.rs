//! Metadata enrichment (Phase 3.5)
//!
//! Tables left without a description get one from sampled rows plus the
//! LLM; column descriptions come along. Optionally, cross-table foreign
//! keys are inferred from column-name similarity confirmed by sampled
//! value overlap.

pub mod text2sql;

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::graph::GraphClient;
use crate::llm::{ChatModel, SampleDescriptionResponse, prompts};
use crate::utils::{AnalyzerError, AnalyzerResult, clean_llm_json, escape_for_cypher, name_similarity};

pub use text2sql::Text2SqlClient;

/// A candidate FK pair from column-name similarity
#[derive(Debug, Clone)]
pub struct FkCandidate {
    pub from_schema: String,
    pub from_table: String,
    pub from_column: String,
    pub to_schema: String,
    pub to_table: String,
    pub to_column: String,
    pub similarity: f64,
}

/// A candidate confirmed by value overlap
#[derive(Debug, Clone)]
pub struct VerifiedFk {
    pub candidate: FkCandidate,
    pub match_ratio: f64,
}

/// Table/column descriptions produced from sample rows
#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    pub table_description: String,
    pub column_descriptions: Vec<(String, String)>,
}

pub struct MetadataEnrichmentService {
    graph: Arc<GraphClient>,
    llm: Arc<dyn ChatModel>,
    text2sql: Text2SqlClient,
    locale: String,
    sample_size: usize,
    similarity_threshold: f64,
    match_ratio_threshold: f64,
}

impl MetadataEnrichmentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<GraphClient>,
        llm: Arc<dyn ChatModel>,
        text2sql: Text2SqlClient,
        locale: &str,
        sample_size: usize,
        similarity_threshold: f64,
        match_ratio_threshold: f64,
    ) -> Self {
        Self {
            graph,
            llm,
            text2sql,
            locale: locale.to_string(),
            sample_size,
            similarity_threshold,
            match_ratio_threshold,
        }
    }

    pub fn text2sql(&self) -> &Text2SqlClient {
        &self.text2sql
    }

    /// Sample up to `sample_size` rows of a table
    pub async fn fetch_sample_rows(&self, schema: &str, table: &str) -> AnalyzerResult<Vec<Value>> {
        let sql = format!(
            "SELECT * FROM \"{}\".\"{}\" LIMIT {}",
            schema, table, self.sample_size
        );
        self.text2sql.fetch_rows(&sql).await.map_err(AnalyzerError::Llm)
    }

    /// Ask the LLM for table and column descriptions from sampled rows
    pub async fn generate_descriptions(
        &self,
        schema: &str,
        table: &str,
        sample_rows: &[Value],
        columns_info: &[Value],
    ) -> AnalyzerResult<EnrichmentResult> {
        let sample_text = serde_json::to_string_pretty(sample_rows)?;
        let columns_text = serde_json::to_string_pretty(columns_info)?;
        let (system, user) =
            prompts::sample_description(table, schema, &sample_text, &columns_text, &self.locale);

        let content = self.llm.chat(&system, &user).await?;
        let parsed: SampleDescriptionResponse = serde_json::from_str(&clean_llm_json(&content))
            .map_err(|e| AnalyzerError::Analysis(format!("sample description: {e}")))?;

        Ok(EnrichmentResult {
            table_description: parsed.table_description,
            column_descriptions: parsed
                .columns
                .into_iter()
                .filter(|c| !c.description.is_empty())
                .map(|c| (c.name, c.description))
                .collect(),
        })
    }

    /// Write descriptions back; caller holds the cypher mutex.
    /// Returns (tables_updated, columns_updated).
    pub async fn update_descriptions(
        &self,
        schema: &str,
        table: &str,
        result: &EnrichmentResult,
    ) -> AnalyzerResult<(usize, usize)> {
        let mut queries = Vec::new();
        let mut tables_updated = 0;

        if !result.table_description.is_empty() {
            queries.push(format!(
                "MATCH (t:Table {{schema: '{schema}', name: '{table}'}}) \
                 SET t.description = '{description}', t.description_source = 'llm' \
                 RETURN t",
                schema = escape_for_cypher(schema),
                table = escape_for_cypher(table),
                description = escape_for_cypher(&result.table_description),
            ));
            tables_updated = 1;
        }

        for (column, description) in &result.column_descriptions {
            queries.push(format!(
                "MATCH (t:Table {{schema: '{schema}', name: '{table}'}})-[:HAS_COLUMN]->(c:Column) \
                 WHERE c.name =~ '(?i){column}' \
                 SET c.description = '{description}', c.description_source = 'llm' \
                 RETURN c",
                schema = escape_for_cypher(schema),
                table = escape_for_cypher(table),
                column = escape_for_cypher(&regex::escape(column)),
                description = escape_for_cypher(description),
            ));
        }

        let columns_updated = result.column_descriptions.len();
        if !queries.is_empty() {
            self.graph.execute(&queries).await?;
        }
        Ok((tables_updated, columns_updated))
    }

    /// Column pairs across tables whose names are similar above the
    /// threshold. Pure name analysis; the data check comes next.
    pub fn find_fk_candidates(&self, tables: &[TableColumns]) -> Vec<FkCandidate> {
        let mut candidates = Vec::new();

        for (i, from) in tables.iter().enumerate() {
            for to in tables.iter().skip(i + 1) {
                for from_col in &from.columns {
                    for to_col in &to.columns {
                        let similarity = name_similarity(from_col, to_col);
                        if similarity < self.similarity_threshold {
                            continue;
                        }
                        // Generic id-style names pair with everything
                        if from_col.eq_ignore_ascii_case("id") && to_col.eq_ignore_ascii_case("id")
                        {
                            continue;
                        }
                        candidates.push(FkCandidate {
                            from_schema: from.schema.clone(),
                            from_table: from.name.clone(),
                            from_column: from_col.clone(),
                            to_schema: to.schema.clone(),
                            to_table: to.name.clone(),
                            to_column: to_col.clone(),
                            similarity,
                        });
                    }
                }
            }
        }

        candidates
    }

    /// Confirm a candidate by sampled value overlap: the share of source
    /// values present in the target must reach the match-ratio threshold.
    pub async fn verify_fk_candidate(
        &self,
        candidate: &FkCandidate,
    ) -> AnalyzerResult<Option<VerifiedFk>> {
        let from_values = self
            .sample_column_values(&candidate.from_schema, &candidate.from_table, &candidate.from_column)
            .await?;
        if from_values.is_empty() {
            return Ok(None);
        }
        let to_values = self
            .sample_column_values(&candidate.to_schema, &candidate.to_table, &candidate.to_column)
            .await?;
        if to_values.is_empty() {
            return Ok(None);
        }

        let to_set: HashSet<&String> = to_values.iter().collect();
        let matched = from_values.iter().filter(|v| to_set.contains(v)).count();
        let match_ratio = matched as f64 / from_values.len() as f64;

        if match_ratio >= self.match_ratio_threshold {
            Ok(Some(VerifiedFk { candidate: candidate.clone(), match_ratio }))
        } else {
            Ok(None)
        }
    }

    async fn sample_column_values(
        &self,
        schema: &str,
        table: &str,
        column: &str,
    ) -> AnalyzerResult<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT \"{column}\" FROM \"{schema}\".\"{table}\" \
             WHERE \"{column}\" IS NOT NULL LIMIT {limit}",
            limit = self.sample_size,
        );
        let rows = self.text2sql.fetch_rows(&sql).await.map_err(AnalyzerError::Llm)?;
        Ok(rows
            .iter()
            .filter_map(|row| row.as_object())
            .flat_map(|obj| obj.values())
            .map(value_as_key)
            .collect())
    }

    /// Persist a confirmed FK; caller holds the cypher mutex
    pub async fn save_fk(&self, verified: &VerifiedFk) -> AnalyzerResult<()> {
        let c = &verified.candidate;
        let query = format!(
            "MATCH (a:Table {{schema: '{from_schema}', name: '{from_table}'}}) \
             MATCH (b:Table {{schema: '{to_schema}', name: '{to_table}'}}) \
             MERGE (a)-[r:FK_TO_TABLE {{sourceColumn: '{from_column}', targetColumn: '{to_column}'}}]->(b) \
             ON CREATE SET r.type = 'many_to_one', r.source = 'inferred' \
             SET r.match_ratio = {match_ratio:.3} \
             RETURN a, r, b",
            from_schema = escape_for_cypher(&c.from_schema),
            from_table = escape_for_cypher(&c.from_table),
            to_schema = escape_for_cypher(&c.to_schema),
            to_table = escape_for_cypher(&c.to_table),
            from_column = escape_for_cypher(&c.from_column),
            to_column = escape_for_cypher(&c.to_column),
            match_ratio = verified.match_ratio,
        );
        self.graph.execute(&[query]).await?;
        Ok(())
    }
}

/// One table's column list, loaded from the graph for FK inference
#[derive(Debug, Clone)]
pub struct TableColumns {
    pub schema: String,
    pub name: String,
    pub columns: Vec<String>,
}

fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(schema: &str, name: &str, columns: &[&str]) -> TableColumns {
        TableColumns {
            schema: schema.to_string(),
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn service() -> MetadataEnrichmentService {
        MetadataEnrichmentService {
            graph: Arc::new(GraphClient::new("http://127.0.0.1:7474", "neo4j", "neo4j", "neo4j")),
            llm: Arc::new(NoopChat),
            text2sql: Text2SqlClient::new("http://127.0.0.1:9999"),
            locale: "English".into(),
            sample_size: 25,
            similarity_threshold: 0.8,
            match_ratio_threshold: 0.7,
        }
    }

    struct NoopChat;

    #[async_trait::async_trait]
    impl ChatModel for NoopChat {
        async fn chat(&self, _: &str, _: &str) -> Result<String, crate::llm::LlmError> {
            Ok("{}".to_string())
        }
    }

    #[test]
    fn test_fk_candidates_by_name_similarity() {
        let tables = [
            table("sales", "ORDERS", &["ID", "CUSTOMER_ID", "ORDER_DATE"]),
            table("sales", "CUSTOMERS", &["CUSTOMER_ID", "NAME"]),
        ];
        let candidates = service().find_fk_candidates(&tables);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].from_column, "CUSTOMER_ID");
        assert_eq!(candidates[0].to_table, "CUSTOMERS");
        assert!(candidates[0].similarity > 0.99);
    }

    #[test]
    fn test_generic_id_pairs_skipped() {
        let tables = [table("s", "A", &["ID"]), table("s", "B", &["ID"])];
        assert!(service().find_fk_candidates(&tables).is_empty());
    }

    #[test]
    fn test_dissimilar_columns_not_candidates() {
        let tables = [table("s", "A", &["ORDER_DATE"]), table("s", "B", &["CUSTOMER_NAME"])];
        assert!(service().find_fk_candidates(&tables).is_empty());
    }
}
