//! Core library for the rust_fluidics engine.
//!
//! Drives pump/valve fluidic networks through multi-step protocols. A
//! protocol names fluids, targets and rates; the engine resolves tubing
//! paths through the network, primes dead volume, switches valves, and
//! sequences pump commands over the configured hardware family.
//!
//! ```text
//! Protocol -> StepCompiler -> Orchestrator control loop -> FluidSystem
//!                  |                                          |
//!            FluidicNetwork                          HardwareChannel (bus)
//! ```
//!
//! Start with [`bootstrap::launch`] for file-driven setup, or build an
//! [`Orchestrator`] over any [`FluidSystem`] directly.

pub mod bootstrap;
pub mod compiler;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod network;
pub mod orchestrator;
pub mod protocol;
pub mod system;
pub mod tracing_setup;

pub use error::{FlowError, FlowResult};
pub use network::{FluidPath, FluidicNetwork, RoutingState};
pub use orchestrator::{ExecutionState, Orchestrator, OrchestratorEvent, OrchestratorState};
pub use protocol::{Amount, FlowStep, Protocol, ProtocolStep};
pub use system::{build_system, build_system_with, FluidSystem, SimulatedSystem};
