pub mod control;
pub mod events;
pub mod file_context;
pub mod orchestrator;
pub mod phases;
pub mod stats;

pub use control::{PipelineController, PipelinePhase, PipelineStatus};
pub use events::{EventSink, StreamEvent};
pub use file_context::{FileAnalysisContext, FileStatus};
pub use orchestrator::AnalysisRun;
pub use stats::AnalysisStats;
