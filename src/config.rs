use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::NameCase;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub graph: GraphStoreConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub concurrency: ConcurrencyConfig,
    pub batch: BatchConfig,
    pub enrichment: EnrichmentConfig,
    pub analysis: AnalysisConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphStoreConfig {
    /// HTTP endpoint of the graph store (transactional Cypher API)
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout_secs: u64,
    /// Append every prompt/response exchange to `<project>/logs/` when set
    pub audit_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub dimension: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Files processed in parallel in Phases 1 and 2
    pub file_concurrency: usize,
    /// Simultaneous LLM batches per file
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_token: usize,
    pub max_summary_chunk_token: usize,
    pub max_context_token: usize,
    /// Graph write sub-batch size in Phases 1 and 2
    pub graph_query_batch_size: usize,
    pub ddl_unwind_batch_size: usize,
    pub vector_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Text-to-SQL sampling endpoint; enrichment is skipped when empty
    pub text2sql_api_url: String,
    pub fk_sample_size: usize,
    pub fk_inference_enabled: bool,
    pub fk_similarity_threshold: f64,
    pub fk_match_ratio_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Root containing `src/`, `ddl/` and `analysis/`
    pub base_dir: String,
    pub project_name: String,
    /// Target DBMS, lowercased into the `db` node property
    pub target_db: String,
    pub locale: String,
    pub name_case: NameCase,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "graphline")]
#[command(version, about = "Graphline - legacy code knowledge-graph pipeline")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Analysis base directory (overrides config file)
    #[arg(long, value_name = "DIR")]
    pub base_dir: Option<String>,

    /// Project name (overrides config file)
    #[arg(long, value_name = "NAME")]
    pub project: Option<String>,

    /// Target DBMS, e.g. "oracle" or "postgres" (overrides config file)
    #[arg(long, value_name = "DB")]
    pub target: Option<String>,

    /// Identifier case policy: original, uppercase or lowercase
    #[arg(long, value_name = "CASE")]
    pub name_case: Option<String>,

    /// Summary language, e.g. "English" (overrides config file)
    #[arg(long, value_name = "LOCALE")]
    pub locale: Option<String>,

    /// Logging level (overrides config file, e.g. "info,graphline=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and
    /// file support.
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with GRAPHLINE_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(cli_args)
    }

    pub fn load_with_args(cli_args: CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Supported environment variables:
    /// - GRAPHLINE_GRAPH_URI / _GRAPH_USER / _GRAPH_PASSWORD / _GRAPH_DATABASE
    /// - GRAPHLINE_LLM_API_BASE / _LLM_API_KEY / _LLM_MODEL
    /// - GRAPHLINE_EMBEDDING_API_KEY / _EMBEDDING_MODEL
    /// - GRAPHLINE_TEXT2SQL_API_URL
    /// - GRAPHLINE_BASE_DIR / _PROJECT_NAME / _TARGET_DB
    /// - GRAPHLINE_LOG_LEVEL
    fn apply_env_overrides(&mut self) {
        let overrides: &mut [(&str, &mut String)] = &mut [
            ("GRAPHLINE_GRAPH_URI", &mut self.graph.uri),
            ("GRAPHLINE_GRAPH_USER", &mut self.graph.user),
            ("GRAPHLINE_GRAPH_PASSWORD", &mut self.graph.password),
            ("GRAPHLINE_GRAPH_DATABASE", &mut self.graph.database),
            ("GRAPHLINE_LLM_API_BASE", &mut self.llm.api_base),
            ("GRAPHLINE_LLM_API_KEY", &mut self.llm.api_key),
            ("GRAPHLINE_LLM_MODEL", &mut self.llm.model),
            ("GRAPHLINE_EMBEDDING_API_KEY", &mut self.embedding.api_key),
            ("GRAPHLINE_EMBEDDING_MODEL", &mut self.embedding.model),
            ("GRAPHLINE_TEXT2SQL_API_URL", &mut self.enrichment.text2sql_api_url),
            ("GRAPHLINE_BASE_DIR", &mut self.analysis.base_dir),
            ("GRAPHLINE_PROJECT_NAME", &mut self.analysis.project_name),
            ("GRAPHLINE_TARGET_DB", &mut self.analysis.target_db),
            ("GRAPHLINE_LOG_LEVEL", &mut self.logging.level),
        ];
        for (name, slot) in overrides.iter_mut() {
            if let Ok(value) = std::env::var(*name) {
                **slot = value;
                tracing::info!("Override {} from env", name);
            }
        }
    }

    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(base_dir) = &args.base_dir {
            self.analysis.base_dir = base_dir.clone();
        }
        if let Some(project) = &args.project {
            self.analysis.project_name = project.clone();
        }
        if let Some(target) = &args.target {
            self.analysis.target_db = target.clone();
        }
        if let Some(name_case) = &args.name_case {
            self.analysis.name_case = NameCase::parse(name_case);
        }
        if let Some(locale) = &args.locale {
            self.analysis.locale = locale.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.graph.uri.is_empty() {
            anyhow::bail!("graph.uri cannot be empty");
        }
        if self.analysis.base_dir.is_empty() {
            anyhow::bail!("analysis.base_dir cannot be empty (set --base-dir)");
        }
        if self.batch.max_batch_token == 0 {
            anyhow::bail!("batch.max_batch_token must be > 0");
        }
        if self.concurrency.file_concurrency == 0 || self.concurrency.max_concurrency == 0 {
            anyhow::bail!("concurrency bounds must be > 0");
        }
        if !(0.0..=1.0).contains(&self.enrichment.fk_similarity_threshold)
            || !(0.0..=1.0).contains(&self.enrichment.fk_match_ratio_threshold)
        {
            anyhow::bail!("enrichment thresholds must be within [0, 1]");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    // ------------------------------------------------------------------
    // Derived paths (`<base>/src`, `<base>/ddl`, `<base>/analysis`)
    // ------------------------------------------------------------------

    pub fn src_dir(&self) -> PathBuf {
        Path::new(&self.analysis.base_dir).join("src")
    }

    pub fn ddl_dir(&self) -> PathBuf {
        Path::new(&self.analysis.base_dir).join("ddl")
    }

    pub fn ast_dir(&self) -> PathBuf {
        Path::new(&self.analysis.base_dir).join("analysis")
    }

    pub fn audit_log_path(&self) -> Option<PathBuf> {
        if !self.llm.audit_enabled {
            return None;
        }
        Some(
            Path::new(&self.analysis.project_name)
                .join("logs")
                .join("llm_audit.jsonl"),
        )
    }
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            uri: "http://127.0.0.1:7474".to_string(),
            user: "neo4j".to_string(),
            password: "neo4j".to_string(),
            database: "neo4j".to_string(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4.1".to_string(),
            max_tokens: 32768,
            temperature: 0.2,
            timeout_secs: 120,
            audit_enabled: true,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { file_concurrency: 5, max_concurrency: 5 }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_token: 1000,
            max_summary_chunk_token: 5000,
            max_context_token: 300,
            graph_query_batch_size: 40,
            ddl_unwind_batch_size: 500,
            vector_batch_size: 50,
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            text2sql_api_url: String::new(),
            fk_sample_size: 25,
            fk_inference_enabled: true,
            fk_similarity_threshold: 0.8,
            fk_match_ratio_threshold: 0.7,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_dir: String::new(),
            project_name: "graphline".to_string(),
            target_db: "postgres".to_string(),
            locale: "English".to_string(),
            name_case: NameCase::Original,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,graphline=debug".to_string(),
            file: Some("logs/graphline.log".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.concurrency.file_concurrency, 5);
        assert_eq!(config.concurrency.max_concurrency, 5);
        assert_eq!(config.batch.ddl_unwind_batch_size, 500);
        assert_eq!(config.batch.vector_batch_size, 50);
        assert_eq!(config.enrichment.fk_sample_size, 25);
        assert_eq!(config.analysis.name_case, NameCase::Original);
    }

    #[test]
    fn test_toml_section_parsing() {
        let toml = r#"
            [analysis]
            base_dir = "/data/legacy"
            target_db = "oracle"
            name_case = "uppercase"

            [batch]
            max_batch_token = 2000
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.analysis.base_dir, "/data/legacy");
        assert_eq!(config.analysis.name_case, NameCase::Uppercase);
        assert_eq!(config.batch.max_batch_token, 2000);
        // Untouched sections keep defaults
        assert_eq!(config.graph.database, "neo4j");
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default();
        config.analysis.base_dir = "/data/app".to_string();
        assert_eq!(config.src_dir(), PathBuf::from("/data/app/src"));
        assert_eq!(config.ddl_dir(), PathBuf::from("/data/app/ddl"));
        assert_eq!(config.ast_dir(), PathBuf::from("/data/app/analysis"));
    }
}
