//! Protocol orchestration.
//!
//! [`Orchestrator`] is a cheap-to-clone handle. API calls are serialized
//! through a session lock; the protocol itself runs on a spawned control
//! loop that owns all hardware actuation while it lives. The loop reacts to
//! pause and abort at every suspension point: before each command and
//! during every wait.
//!
//! Observers read state through [`Orchestrator::snapshot`] or
//! [`Orchestrator::watch_state`] and receive [`OrchestratorEvent`]s through
//! [`Orchestrator::subscribe_events`].

mod control_loop;
mod state;

pub use state::{ExecutionState, OrchestratorEvent, OrchestratorState, PumpStatus};

use crate::compiler::StepCompiler;
use crate::config::OrchestratorConfig;
use crate::error::{FlowError, FlowResult};
use crate::error_recovery::retry_transient;
use crate::protocol::Protocol;
use crate::system::FluidSystem;
use chrono::Utc;
use control_loop::{Control, Cursor, Run};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// State shared between the handle and the control loop.
pub(crate) struct Shared {
    system: Arc<dyn FluidSystem>,
    config: OrchestratorConfig,
    state: watch::Sender<ExecutionState>,
    events: broadcast::Sender<OrchestratorEvent>,
    compiler: Mutex<StepCompiler>,
}

impl Shared {
    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn current(&self) -> OrchestratorState {
        self.state.borrow().state
    }

    fn transition(&self, to: OrchestratorState) {
        let mut from = to;
        self.state.send_modify(|s| {
            from = s.state;
            s.state = to;
            s.paused = to == OrchestratorState::Paused;
        });
        if from != to {
            info!(%from, %to, "state transition");
            self.emit(OrchestratorEvent::StateChanged { from, to });
        }
    }
}

#[derive(Default)]
struct Session {
    started: bool,
    protocol: Option<Arc<Protocol>>,
    cursor: Cursor,
    run: Option<Run>,
}

impl Session {
    /// Wait for the current run segment to exit and keep its cursor.
    async fn join(&mut self, shared: &Shared) {
        let Some(run) = self.run.take() else {
            return;
        };
        match run.handle.await {
            Ok(cursor) => self.cursor = cursor,
            Err(err) => {
                error!(error = %err, "control loop task failed");
                self.cursor = Cursor::at(shared.state.borrow().step_index);
            }
        }
    }
}

/// Handle to the orchestration engine.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
    session: Arc<Mutex<Session>>,
}

impl Orchestrator {
    pub fn new(system: Arc<dyn FluidSystem>, config: OrchestratorConfig) -> Self {
        let network = Arc::clone(system.network());
        let idle = ExecutionState::idle(network.pumps().iter().map(|p| p.id.as_str()));
        let (state, _) = watch::channel(idle);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                system,
                config,
                state,
                events,
                compiler: Mutex::new(StepCompiler::new(network)),
            }),
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    pub fn system(&self) -> &Arc<dyn FluidSystem> {
        &self.shared.system
    }

    /// Current execution state.
    pub fn snapshot(&self) -> ExecutionState {
        self.shared.state.borrow().clone()
    }

    pub fn state(&self) -> OrchestratorState {
        self.shared.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<ExecutionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the run leaves RUNNING.
    pub async fn wait_settled(&self) -> ExecutionState {
        let mut rx = self.watch_state();
        let settled = rx
            .wait_for(|s| s.state != OrchestratorState::Running)
            .await
            .map(|s| s.clone());
        settled.unwrap_or_else(|_| self.snapshot())
    }

    fn invalid(&self, action: &str) -> FlowError {
        FlowError::InvalidTransition {
            from: self.shared.current().to_string(),
            action: action.to_string(),
        }
    }

    /// Connect the fluid system and check that every channel answers.
    ///
    /// # Errors
    /// `NotConnected` naming the link or the first silent channel.
    pub async fn start_orchestration(&self) -> FlowResult<()> {
        let mut session = self.session.lock().await;
        if session.started && self.shared.system.is_connected() {
            return Ok(());
        }
        self.check_connectivity().await?;
        session.started = true;
        info!(system = self.shared.system.name(), "orchestration started");
        Ok(())
    }

    async fn check_connectivity(&self) -> FlowResult<()> {
        let system = &self.shared.system;
        system
            .connect()
            .await
            .map_err(|e| FlowError::NotConnected(format!("{} system unreachable: {e}", system.name())))?;
        for channel in system.channel_ids() {
            let status = retry_transient(
                &self.shared.config.retry,
                || system.query(&channel),
                |attempt, err, _| warn!(channel = %channel, attempt, error = %err, "status query failed"),
            )
            .await;
            if let Err(err) = status {
                return Err(FlowError::NotConnected(format!("channel '{channel}' unreachable: {err}")));
            }
        }
        Ok(())
    }

    /// Validate `protocol` and start running it.
    ///
    /// Validation errors are returned here and no hardware is touched.
    /// A new protocol may start from IDLE or after a finished run.
    pub async fn start_protocol(&self, protocol: Protocol) -> FlowResult<()> {
        let mut session = self.session.lock().await;
        if !session.started {
            return Err(FlowError::NotConnected(
                "orchestration not started, call start_orchestration first".into(),
            ));
        }
        let current = self.shared.current();
        if !matches!(
            current,
            OrchestratorState::Idle | OrchestratorState::Completed | OrchestratorState::Aborted
        ) {
            return Err(self.invalid("start a protocol"));
        }

        let routing = self.shared.system.routing().await;
        {
            let mut compiler = self.shared.compiler.lock().await;
            compiler.validate(&protocol, &routing)?;
            compiler.invalidate_all();
        }
        session.join(&self.shared).await;

        let run_id = Uuid::new_v4();
        let protocol = Arc::new(protocol);
        let pumps = self.shared.system.network().pumps().iter().map(|p| p.id.as_str());
        let mut fresh = ExecutionState::idle(pumps);
        fresh.run_id = Some(run_id);
        fresh.protocol = protocol.name.clone();
        fresh.step_count = protocol.len();
        fresh.started_at = Some(Utc::now());
        self.shared.state.send_replace(fresh);
        info!(%run_id, protocol = %protocol.name, steps = protocol.len(), "protocol accepted");

        self.shared.transition(OrchestratorState::Running);
        session.protocol = Some(Arc::clone(&protocol));
        session.cursor = Cursor::default();
        session.run = Some(control_loop::spawn(Arc::clone(&self.shared), protocol, Cursor::default()));
        Ok(())
    }

    /// Stop all hardware and hold the run. Pausing a paused run does nothing.
    pub async fn pause(&self) -> FlowResult<()> {
        let mut session = self.session.lock().await;
        match self.shared.current() {
            OrchestratorState::Paused => return Ok(()),
            OrchestratorState::Running => {}
            _ => return Err(self.invalid("pause")),
        }
        if let Some(run) = &session.run {
            let _ = run.control.send(Control::Pause);
        }
        session.join(&self.shared).await;
        match self.shared.current() {
            OrchestratorState::Paused => Ok(()),
            OrchestratorState::Error => Err(self.error_or_invalid("pause")),
            _ => Err(self.invalid("pause")),
        }
    }

    fn error_or_invalid(&self, action: &str) -> FlowError {
        self.shared
            .state
            .borrow()
            .error
            .clone()
            .unwrap_or_else(|| self.invalid(action))
    }

    /// Continue a paused run. Paths are re-primed and the interrupted step
    /// delivers only what it still owes.
    pub async fn resume(&self) -> FlowResult<()> {
        let mut session = self.session.lock().await;
        if self.shared.current() != OrchestratorState::Paused {
            return Err(self.invalid("resume"));
        }
        self.restart(&mut session).await
    }

    /// Leave ERROR after the operator has dealt with the cause.
    ///
    /// # Errors
    /// `NotConnected` if the hardware still does not answer; the state
    /// stays ERROR.
    pub async fn recover(&self) -> FlowResult<()> {
        let mut session = self.session.lock().await;
        if self.shared.current() != OrchestratorState::Error {
            return Err(self.invalid("recover"));
        }
        session.join(&self.shared).await;
        if session.protocol.is_none() {
            return Err(self.invalid("recover"));
        }
        self.check_connectivity().await?;
        self.shared.state.send_modify(|s| s.error = None);
        info!("recovering from error");
        self.restart(&mut session).await
    }

    async fn restart(&self, session: &mut Session) -> FlowResult<()> {
        let Some(protocol) = session.protocol.clone() else {
            return Err(self.invalid("resume"));
        };
        self.shared.compiler.lock().await.invalidate_all();
        self.shared.transition(OrchestratorState::Running);
        session.run = Some(control_loop::spawn(
            Arc::clone(&self.shared),
            protocol,
            session.cursor.clone(),
        ));
        Ok(())
    }

    /// Stop all hardware and end the run. No recovery is attempted.
    ///
    /// The run reaches ABORTED even when stopping fails; the stop failure
    /// is returned and kept in the snapshot.
    pub async fn abort(&self) -> FlowResult<()> {
        let mut session = self.session.lock().await;
        match self.shared.current() {
            OrchestratorState::Completed | OrchestratorState::Aborted => Err(self.invalid("abort")),
            OrchestratorState::Running => {
                if let Some(run) = &session.run {
                    let _ = run.control.send(Control::Abort);
                }
                session.join(&self.shared).await;
                let error = self.shared.state.borrow().error.clone();
                match (self.shared.current(), error) {
                    (OrchestratorState::Aborted, Some(err @ FlowError::StopFailed(_))) => Err(err),
                    (OrchestratorState::Aborted, _) => Ok(()),
                    // Finished or failed before noticing the request.
                    _ => Err(self.invalid("abort")),
                }
            }
            OrchestratorState::Idle | OrchestratorState::Paused | OrchestratorState::Error => {
                session.join(&self.shared).await;
                let stopped = self.shared.system.stop_all().await;
                if let Err(err) = &stopped {
                    error!(error = %err, "stop on abort failed");
                    self.shared.state.send_modify(|s| s.error = Some(err.clone()));
                }
                self.shared.transition(OrchestratorState::Aborted);
                stopped
            }
        }
    }

    /// Abort whatever is running and disconnect the hardware.
    pub async fn shutdown(&self) -> FlowResult<()> {
        if self.shared.current().is_active() {
            if let Err(err) = self.abort().await {
                warn!(error = %err, "abort during shutdown");
            }
        }
        let mut session = self.session.lock().await;
        session.join(&self.shared).await;
        session.started = false;
        self.shared.system.disconnect().await?;
        info!("orchestration shut down");
        Ok(())
    }
}
