pub mod client;
pub mod embedding;
pub mod models;
pub mod prompts;

pub use client::LlmClient;
pub use embedding::EmbeddingClient;
pub use models::{
    ChatModel, ContextResponse, EmbeddingModel, LlmError, LlmResult, NodeAnalysis,
    SampleDescriptionResponse, SummaryResponse, TableAccess, TableAnalysis,
    TableDescriptionResponse,
};
