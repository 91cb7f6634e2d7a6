//! Published orchestrator state.

use crate::error::FlowError;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Orchestrator lifecycle.
///
/// ```text
/// IDLE -> RUNNING -> PAUSED -> RUNNING
///                 -> COMPLETED
///                 -> ERROR -> RUNNING (recover)
///                 -> ABORTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Aborted,
}

impl OrchestratorState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// A protocol is in flight or waiting to continue.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Error)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Aborted)
                | (Running, Paused | Completed | Error | Aborted)
                | (Paused, Running | Aborted | Error)
                | (Error, Running | Aborted)
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Per-pump rates in µl/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PumpStatus {
    pub commanded: f64,
    pub observed: Option<f64>,
}

fn error_text<S: Serializer>(error: &Option<FlowError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Snapshot of a protocol run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionState {
    pub run_id: Option<Uuid>,
    pub protocol: String,
    pub state: OrchestratorState,
    /// Index of the step most recently started
    pub step_index: usize,
    pub step_count: usize,
    pub pumps: BTreeMap<String, PumpStatus>,
    /// Run time, excluding time spent paused
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Delivery time already counted against the current step
    #[serde(with = "humantime_serde")]
    pub step_elapsed: Duration,
    #[serde(serialize_with = "error_text")]
    pub error: Option<FlowError>,
    pub paused: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub(crate) fn idle<'a>(pumps: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            run_id: None,
            protocol: String::new(),
            state: OrchestratorState::Idle,
            step_index: 0,
            step_count: 0,
            pumps: pumps
                .into_iter()
                .map(|id| (id.to_string(), PumpStatus::default()))
                .collect(),
            elapsed: Duration::ZERO,
            step_elapsed: Duration::ZERO,
            error: None,
            paused: false,
            started_at: None,
        }
    }
}

/// Notifications pushed to monitoring collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
    StepStarted {
        step: usize,
    },
    StepCompleted {
        step: usize,
    },
    StepFailed {
        step: usize,
        error: FlowError,
    },
    Retrying {
        step: usize,
        attempt: u32,
        error: FlowError,
        backoff: Duration,
    },
}
