pub mod error;
pub mod signal;
pub mod text;

pub use error::{AnalyzerError, AnalyzerResult};
pub use signal::SignalFlag;
pub use text::{
    NameCase, clean_llm_json, escape_for_cypher, estimate_tokens, name_similarity,
    parse_table_identifier,
};
