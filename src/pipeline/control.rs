//! Pipeline control - pause/resume/stop across phases
//!
//! Models the run state of a single analysis session. Every batch in
//! every phase calls `check_continue()` at its boundary; an in-flight LLM
//! call is never interrupted, the pipeline aborts at the next boundary.

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Pipeline phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Idle,
    DdlProcessing,
    AstGeneration,
    LlmAnalysis,
    TableEnrichment,
    Vectorizing,
    UserStory,
    Completed,
    Failed,
    Cancelled,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::DdlProcessing => "ddl_processing",
            Self::AstGeneration => "ast_generation",
            Self::LlmAnalysis => "llm_analysis",
            Self::TableEnrichment => "table_enrichment",
            Self::Vectorizing => "vectorizing",
            Self::UserStory => "user_story",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal or idle states cannot be paused or stopped
    fn is_controllable(&self) -> bool {
        !matches!(self, Self::Idle | Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Static description of a controllable phase, exposed by the control surface
#[derive(Debug, Clone, Serialize)]
pub struct PhaseInfo {
    pub phase: PipelinePhase,
    pub name: &'static str,
    pub description: &'static str,
    pub order: u32,
    #[serde(rename = "canPause")]
    pub can_pause: bool,
}

pub fn pipeline_phases() -> Vec<PhaseInfo> {
    vec![
        PhaseInfo {
            phase: PipelinePhase::DdlProcessing,
            name: "DDL processing",
            description: "Parse DDL and create schema/table/column nodes",
            order: 0,
            can_pause: true,
        },
        PhaseInfo {
            phase: PipelinePhase::AstGeneration,
            name: "AST graph build",
            description: "Parse procedures/functions into the static graph",
            order: 1,
            can_pause: true,
        },
        PhaseInfo {
            phase: PipelinePhase::LlmAnalysis,
            name: "AI analysis",
            description: "LLM summaries and statement-table relationships",
            order: 2,
            can_pause: true,
        },
        PhaseInfo {
            phase: PipelinePhase::TableEnrichment,
            name: "Table enrichment",
            description: "Update table/column descriptions from analysis",
            order: 3,
            can_pause: true,
        },
        PhaseInfo {
            phase: PipelinePhase::UserStory,
            name: "User story generation",
            description: "Produce user story documents from summaries",
            order: 4,
            can_pause: false,
        },
    ]
}

#[derive(Debug)]
struct ControlState {
    phase: PipelinePhase,
    paused: bool,
    stopped: bool,
    progress: u8,
    message: String,
}

/// Snapshot of the run state for the control surface
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    #[serde(rename = "currentPhase")]
    pub current_phase: PipelinePhase,
    #[serde(rename = "phaseName")]
    pub phase_name: String,
    #[serde(rename = "phaseOrder")]
    pub phase_order: i32,
    #[serde(rename = "isPaused")]
    pub is_paused: bool,
    #[serde(rename = "isStopped")]
    pub is_stopped: bool,
    #[serde(rename = "phaseProgress")]
    pub phase_progress: u8,
    #[serde(rename = "phaseMessage")]
    pub phase_message: String,
    pub phases: Vec<PhaseInfo>,
}

/// Single-session pipeline controller.
///
/// Two signals drive `check_continue()`: the paused flag and a resume
/// broadcast. `stop()` clears the paused flag and wakes every waiter so
/// nothing stays parked, then all waiters observe `stopped`.
pub struct PipelineController {
    state: Mutex<ControlState>,
    resume: Notify,
}

impl Default for PipelineController {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                phase: PipelinePhase::Idle,
                paused: false,
                stopped: false,
                progress: 0,
                message: String::new(),
            }),
            resume: Notify::new(),
        }
    }

    /// Gate checked at every batch boundary.
    ///
    /// Returns `false` immediately when stopped, blocks while paused until
    /// resumed (or stopped), returns `true` otherwise.
    pub async fn check_continue(&self) -> bool {
        loop {
            let notified = self.resume.notified();
            {
                let state = self.state.lock().expect("controller state poisoned");
                if state.stopped {
                    return false;
                }
                if !state.paused {
                    return true;
                }
                tracing::info!("Pipeline paused, waiting for resume");
            }
            notified.await;
        }
    }

    /// Pause the run. No-op in idle/terminal states. Returns whether the
    /// request applied.
    pub fn pause(&self) -> bool {
        let mut state = self.state.lock().expect("controller state poisoned");
        if !state.phase.is_controllable() || state.stopped {
            return false;
        }
        state.paused = true;
        tracing::info!("Pipeline pause requested");
        true
    }

    /// Resume a paused run
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock().expect("controller state poisoned");
        if !state.paused || state.stopped {
            return false;
        }
        state.paused = false;
        drop(state);
        self.resume.notify_waiters();
        tracing::info!("Pipeline resume requested");
        true
    }

    /// Stop the run. Wakes paused waiters so they observe the stop.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock().expect("controller state poisoned");
        if !state.phase.is_controllable() {
            return false;
        }
        state.stopped = true;
        state.paused = false;
        drop(state);
        self.resume.notify_waiters();
        tracing::info!("Pipeline stop requested");
        true
    }

    /// Reset to idle for the next run
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("controller state poisoned");
        state.phase = PipelinePhase::Idle;
        state.paused = false;
        state.stopped = false;
        state.progress = 0;
        state.message.clear();
        drop(state);
        self.resume.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().expect("controller state poisoned").stopped
    }

    pub fn set_phase(&self, phase: PipelinePhase, message: &str) {
        let mut state = self.state.lock().expect("controller state poisoned");
        state.phase = phase;
        state.message = message.to_string();
        state.progress = 0;
        tracing::info!("Pipeline phase: {} - {}", phase.as_str(), message);
    }

    pub fn update_progress(&self, progress: u8, message: &str) {
        let mut state = self.state.lock().expect("controller state poisoned");
        state.progress = progress.min(100);
        if !message.is_empty() {
            state.message = message.to_string();
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let state = self.state.lock().expect("controller state poisoned");
        let phases = pipeline_phases();
        let info = phases.iter().find(|p| p.phase == state.phase);
        PipelineStatus {
            current_phase: state.phase,
            phase_name: info
                .map(|p| p.name.to_string())
                .unwrap_or_else(|| state.phase.as_str().to_string()),
            phase_order: info.map(|p| p.order as i32).unwrap_or(-1),
            is_paused: state.paused,
            is_stopped: state.stopped,
            phase_progress: state.progress,
            phase_message: state.message.clone(),
            phases,
        }
    }

    pub fn phases(&self) -> Vec<PhaseInfo> {
        pipeline_phases()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_check_continue_passes_when_running() {
        let controller = PipelineController::new();
        controller.set_phase(PipelinePhase::LlmAnalysis, "running");
        assert!(controller.check_continue().await);
    }

    #[tokio::test]
    async fn test_check_continue_false_after_stop() {
        let controller = PipelineController::new();
        controller.set_phase(PipelinePhase::LlmAnalysis, "running");
        assert!(controller.stop());
        assert!(!controller.check_continue().await);
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let controller = Arc::new(PipelineController::new());
        controller.set_phase(PipelinePhase::LlmAnalysis, "running");
        assert!(controller.pause());

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.check_continue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "check_continue must block while paused");

        assert!(controller.resume());
        let passed = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("resume must unblock waiters")
            .expect("waiter panicked");
        assert!(passed);
    }

    #[tokio::test]
    async fn test_stop_unblocks_paused_waiters() {
        let controller = Arc::new(PipelineController::new());
        controller.set_phase(PipelinePhase::AstGeneration, "running");
        controller.pause();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.check_continue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.stop();
        let passed = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("stop must unblock waiters")
            .expect("waiter panicked");
        assert!(!passed, "stopped waiters must observe is_stopped");
    }

    #[test]
    fn test_pause_ignored_when_idle() {
        let controller = PipelineController::new();
        assert!(!controller.pause());
        assert!(!controller.stop());
    }

    #[test]
    fn test_status_snapshot() {
        let controller = PipelineController::new();
        controller.set_phase(PipelinePhase::DdlProcessing, "parsing");
        controller.update_progress(40, "tables");
        let status = controller.status();
        assert_eq!(status.phase_order, 0);
        assert_eq!(status.phase_progress, 40);
        assert_eq!(status.phase_message, "tables");
        assert_eq!(status.phases.len(), 5);
    }
}
