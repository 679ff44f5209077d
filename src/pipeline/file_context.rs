//! Per-file analysis state shared between Phase 1 and Phase 2.
//!
//! Phase 1 failures short-circuit the file's Phase 2 LLM calls; the
//! failure reason is kept for the final report.

use std::sync::Arc;

use crate::analysis::processor::AstProcessor;

/// File analysis status
///
/// PENDING → PH1_OK → PH2_OK on the happy path;
/// PENDING → PH1_FAIL skips Phase 2 for the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Ph1Ok,
    Ph1Fail,
    Ph2Ok,
    Ph2Fail,
    Skipped,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ph1Ok => "PH1_OK",
            Self::Ph1Fail => "PH1_FAIL",
            Self::Ph2Ok => "PH2_OK",
            Self::Ph2Fail => "PH2_FAIL",
            Self::Skipped => "SKIPPED",
        }
    }
}

/// Per-file context: the processor built in Phase 1 carries the node
/// arena and unit info that Phase 2 reuses.
pub struct FileAnalysisContext {
    pub directory: String,
    pub file_name: String,
    pub processor: Option<Arc<AstProcessor>>,
    pub status: FileStatus,
    pub error_message: String,
}

impl FileAnalysisContext {
    pub fn new(directory: &str, file_name: &str) -> Self {
        Self {
            directory: directory.to_string(),
            file_name: file_name.to_string(),
            processor: None,
            status: FileStatus::Pending,
            error_message: String::new(),
        }
    }

    pub fn display_name(&self) -> String {
        if self.directory.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.directory, self.file_name)
        }
    }
}
