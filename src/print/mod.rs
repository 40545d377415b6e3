//! Print job execution.
//!
//! [`sequence::PrintSequence`] is the pure per-job state machine; it turns inputs
//! (completions, user requests) into effects. [`controller::PrintController`] is
//! the task that owns the hardware-facing resources and executes those effects.

pub mod controller;
pub mod sequence;

pub use controller::{ControllerSettings, PrintController, PrintHandle};
pub use sequence::{PrintEffect, PrintInput, PrintSequence, PrintStep};

use crate::print_job::JobError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Outcome of a print attempt, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub enum PrintResult {
    #[default]
    None,
    Success,
    Failure,
    Abort,
}

impl PrintResult {
    /// Record `other` unless the current result is already worse.
    pub fn latch(&mut self, other: PrintResult) {
        if other > *self {
            *self = other;
        }
    }

    pub fn is_bad(self) -> bool {
        matches!(self, PrintResult::Failure | PrintResult::Abort)
    }
}

/// Notifications published to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "value", rename_all = "camelCase")]
pub enum PrintEvent {
    PrintStarting,
    RequestDispensePrintSolution,
    StartingLayer(usize),
    LampStatusChange(bool),
    PrintPausable(bool),
    PrintPaused,
    PrintResumed,
    PrintComplete(bool),
    PrintAborted,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PrintError {
    #[error("A print job is already active")]
    Busy,
    #[error("No print job is active")]
    NoJob,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Invalid print job: {0}")]
    InvalidJob(#[from] JobError),
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

/// Snapshot of the print controller, published after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintStatus {
    pub job_id: Option<Uuid>,
    pub step: PrintStep,
    pub step_code: &'static str,
    pub current_layer: usize,
    pub total_layers: usize,
    pub paused: bool,
    pub pause_pending: bool,
    pub lamp_on: bool,
    pub result: PrintResult,
    pub started_at: Option<DateTime<Utc>>,
}

impl PrintStatus {
    pub fn idle() -> Self {
        Self {
            job_id: None,
            step: PrintStep::Idle,
            step_code: PrintStep::Idle.code(),
            current_layer: 0,
            total_layers: 0,
            paused: false,
            pause_pending: false,
            lamp_on: false,
            result: PrintResult::None,
            started_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.step, PrintStep::Idle | PrintStep::Terminal(_))
    }
}

impl Default for PrintStatus {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_only_gets_worse() {
        let mut result = PrintResult::None;
        result.latch(PrintResult::Failure);
        result.latch(PrintResult::Success);
        assert_eq!(result, PrintResult::Failure);
        result.latch(PrintResult::Abort);
        result.latch(PrintResult::Failure);
        assert_eq!(result, PrintResult::Abort);
        assert!(result.is_bad());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&PrintEvent::StartingLayer(3)).unwrap();
        assert_eq!(json, r#"{"event":"startingLayer","value":3}"#);
        let json = serde_json::to_string(&PrintEvent::PrintPaused).unwrap();
        assert_eq!(json, r#"{"event":"printPaused"}"#);
    }
}
