//! Job lifecycle state machines.

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// Coordinator stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Preprocess,
    ModeSelect,
    Dispatch,
    Compute,
    Aggregate,
    Postprocess,
    Persist,
    Done,
    Aborted,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Aborted)
    }

    /// Stage that follows on success
    pub fn next(&self) -> Option<Stage> {
        use Stage::*;
        match self {
            Init => Some(Preprocess),
            Preprocess => Some(ModeSelect),
            ModeSelect => Some(Dispatch),
            Dispatch => Some(Compute),
            Compute => Some(Aggregate),
            Aggregate => Some(Postprocess),
            Postprocess => Some(Persist),
            Persist => Some(Done),
            Done | Aborted => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "INIT",
            Stage::Preprocess => "PREPROCESS",
            Stage::ModeSelect => "MODE_SELECT",
            Stage::Dispatch => "DISPATCH",
            Stage::Compute => "COMPUTE",
            Stage::Aggregate => "AGGREGATE",
            Stage::Postprocess => "POSTPROCESS",
            Stage::Persist => "PERSIST",
            Stage::Done => "DONE",
            Stage::Aborted => "ABORTED",
        };
        write!(f, "{}", s)
    }
}

/// Worker stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStage {
    IdleWait,
    Bound,
    Compute,
    Return,
    Done,
    /// Not needed for this job
    Skipped,
    /// The coordinator called the job off
    Aborted,
}

/// Mutable state of a running job
#[derive(Debug)]
pub struct JobState {
    stage: Stage,
    started: Instant,
    warnings: Vec<String>,
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

impl JobState {
    pub fn new() -> Self {
        Self {
            stage: Stage::Init,
            started: Instant::now(),
            warnings: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to the successor stage
    ///
    /// # Errors
    /// Returns an error if `to` does not follow the current stage.
    pub fn advance(&mut self, to: Stage) -> Result<()> {
        if self.stage.next() != Some(to) {
            return Err(EngineError::Execution(format!(
                "invalid stage transition {} -> {}",
                self.stage, to
            )));
        }
        debug!(from = %self.stage, to = %to, "Stage transition");
        self.stage = to;
        Ok(())
    }

    /// Abort from any non-terminal stage; returns the stage aborted in
    pub fn abort(&mut self) -> Stage {
        let at = self.stage;
        if !at.is_terminal() {
            debug!(from = %at, "Job aborted");
            self.stage = Stage::Aborted;
        }
        at
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = JobState::new();
        let mut stage = Stage::Init;
        while let Some(next) = stage.next() {
            state.advance(next).unwrap();
            stage = next;
        }
        assert_eq!(state.stage(), Stage::Done);
    }

    #[test]
    fn test_skipping_a_stage_is_rejected() {
        let mut state = JobState::new();
        state.advance(Stage::Preprocess).unwrap();
        assert!(state.advance(Stage::Dispatch).is_err());
        assert_eq!(state.stage(), Stage::Preprocess);
    }

    #[test]
    fn test_abort_from_any_stage() {
        let mut state = JobState::new();
        state.advance(Stage::Preprocess).unwrap();
        assert_eq!(state.abort(), Stage::Preprocess);
        assert_eq!(state.stage(), Stage::Aborted);
        assert!(state.advance(Stage::ModeSelect).is_err());
    }

    #[test]
    fn test_warnings_accumulate() {
        let mut state = JobState::new();
        state.warn("smoothing disabled");
        assert_eq!(state.warnings(), &["smoothing disabled".to_string()]);
        assert_eq!(state.take_warnings().len(), 1);
        assert!(state.warnings().is_empty());
    }
}
