pub mod ast_model;
pub mod batch;
pub mod node;
pub mod processor;

pub use ast_model::{AstNode, AstParameter, AstRoot};
pub use batch::{AnalysisBatch, BatchPlanner};
pub use node::{NodeArena, NodeId, StatementNode, TableAccessKind, TableRef};
pub use processor::{AstProcessor, BatchProgress, LlmAnalysisOutcome, ProcessorSettings, UnitInfo};
