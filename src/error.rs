//! Custom error types for the fluidics engine.
//!
//! This module defines the primary error type, `FlowError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle everything that can go wrong between a configuration file and a pump
//! turning on.
//!
//! ## Error Hierarchy
//!
//! - **Construction**: `Configuration`, `DisconnectedNetwork`. Fatal, raised
//!   before any hardware exists.
//! - **Path resolution**: `Unreachable`, `AmbiguousPath`, `Routing`. Fatal for
//!   the affected step.
//! - **Step validation**: `InvalidStep`, `RateExceeded`. Raised by the step
//!   compiler before any hardware is touched.
//! - **Transient I/O**: `Communication`, `Timeout`. Retried by the orchestrator
//!   according to its [`RetryPolicy`](crate::error_recovery::RetryPolicy).
//! - **Hardware reported**: `Rejected`, `HardwareFault`. Never retried.
//! - **Session**: `NotConnected`, `Connection`, `InvalidTransition`,
//!   `StopFailed`.
//!
//! `FlowError` is `Clone` so that the error which put the orchestrator into
//! its ERROR state can be published inside an
//! [`ExecutionState`](crate::orchestrator::ExecutionState) snapshot.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// One channel that could not be stopped during a `stop_all`.
#[derive(Debug, Clone, PartialEq)]
pub struct StopFailure {
    /// Channel identifier (pump or valve id).
    pub channel: String,
    /// The error the channel reported.
    pub error: FlowError,
}

impl std::fmt::Display for StopFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.channel, self.error)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network is disconnected: point '{0}' is unreachable from every reservoir")]
    DisconnectedNetwork(String),

    #[error("No fluid path from '{from}' to '{to}'")]
    Unreachable { from: String, to: String },

    #[error("Ambiguous path from '{from}' to '{to}': {candidates} equal-volume routes, assign valves explicitly")]
    AmbiguousPath {
        from: String,
        to: String,
        candidates: usize,
    },

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Invalid step {step}: {reason}")]
    InvalidStep { step: usize, reason: String },

    #[error("Step {step}: rate {rate} exceeds maximum {max_rate} of pump '{pump}'")]
    RateExceeded {
        step: usize,
        pump: String,
        rate: f64,
        max_rate: f64,
    },

    #[error("Communication error on '{channel}': {message}")]
    Communication { channel: String, message: String },

    #[error("Timeout on '{channel}' after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },

    #[error("'{channel}' rejected command: {message}")]
    Rejected { channel: String, message: String },

    #[error("Hardware fault on '{channel}': {message}")]
    HardwareFault { channel: String, message: String },

    #[error("Fluid system not connected: {0}")]
    NotConnected(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Cannot {action} while {from}")]
    InvalidTransition { from: String, action: String },

    #[error("Stop failed on {} channel(s): {}", .0.len(), format_failures(.0))]
    StopFailed(Vec<StopFailure>),
}

fn format_failures(failures: &[StopFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl FlowError {
    /// Errors that the orchestrator retries locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Communication { .. } | Self::Timeout { .. })
    }

    /// Errors reported by the hardware itself. These put the orchestrator
    /// straight into ERROR.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::HardwareFault { .. })
    }

    /// Errors raised before any hardware is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::DisconnectedNetwork(_)
                | Self::Unreachable { .. }
                | Self::AmbiguousPath { .. }
                | Self::Routing(_)
                | Self::InvalidStep { .. }
                | Self::RateExceeded { .. }
        )
    }

    pub(crate) fn communication(channel: &str, message: impl Into<String>) -> Self {
        Self::Communication {
            channel: channel.to_string(),
            message: message.into(),
        }
    }
}

impl From<figment::Error> for FlowError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}
