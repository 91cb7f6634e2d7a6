//! The control loop.
//!
//! One task per run segment: it starts at a [`Cursor`], dispatches
//! concurrency groups in order, and exits on completion, error, or a
//! pause/abort request. The cursor it returns is where a later resume or
//! recovery picks up.

use super::state::{OrchestratorEvent, OrchestratorState};
use super::Shared;
use crate::compiler::{CommandKind, CompiledCommand};
use crate::error::{FlowError, FlowResult};
use crate::error_recovery::retry_transient;
use crate::protocol::{Protocol, ProtocolStep};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Requests from the API to the running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Control {
    Run,
    Pause,
    Abort,
}

/// Position within a protocol.
#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct Cursor {
    /// First step of the group in progress
    pub step: usize,
    /// Delivery already counted, per step of the current group
    pub delivered: HashMap<usize, Duration>,
    /// Steps of the current group that finished
    pub done: HashSet<usize>,
}

impl Cursor {
    pub fn at(step: usize) -> Self {
        Self {
            step,
            ..Self::default()
        }
    }
}

/// A spawned run segment.
pub(super) struct Run {
    pub control: watch::Sender<Control>,
    pub handle: JoinHandle<Cursor>,
}

pub(super) fn spawn(shared: Arc<Shared>, protocol: Arc<Protocol>, cursor: Cursor) -> Run {
    let (control, rx) = watch::channel(Control::Run);
    let elapsed_before = shared.state.borrow().elapsed;
    let control_loop = ControlLoop {
        shared,
        protocol,
        cursor,
        control: rx,
        active: Vec::new(),
        segment_start: Instant::now(),
        elapsed_before,
    };
    Run {
        control,
        handle: tokio::spawn(control_loop.run()),
    }
}

/// A group member whose route and priming are done, waiting for its flow
/// to start.
struct Prepared {
    start: Vec<CompiledCommand>,
    member: Member,
}

/// A step whose delivery is under way.
struct Member {
    index: usize,
    started: Instant,
    hold: Duration,
    delivered_before: Duration,
    teardown: Vec<CompiledCommand>,
}

impl Member {
    fn end(&self) -> Instant {
        self.started + self.hold
    }

    fn delivered_at(&self, now: Instant) -> Duration {
        self.delivered_before + now.saturating_duration_since(self.started).min(self.hold)
    }
}

struct ControlLoop {
    shared: Arc<Shared>,
    protocol: Arc<Protocol>,
    cursor: Cursor,
    control: watch::Receiver<Control>,
    active: Vec<Member>,
    segment_start: Instant,
    elapsed_before: Duration,
}

impl ControlLoop {
    async fn run(mut self) -> Cursor {
        let outcome = self.execute().await;
        self.record_progress();
        match outcome {
            Ok(None) => {
                self.publish(|_| {});
                info!(protocol = %self.protocol.name, "protocol completed");
                self.shared.transition(OrchestratorState::Completed);
            }
            Ok(Some(Control::Pause)) => match self.shared.system.stop_all().await {
                Ok(()) => {
                    self.clear_rates();
                    self.shared.transition(OrchestratorState::Paused);
                }
                Err(err) => {
                    error!(error = %err, "stop on pause failed");
                    self.fail(err);
                }
            },
            Ok(Some(_)) => {
                let stopped = self.shared.system.stop_all().await;
                self.clear_rates();
                if let Err(err) = stopped {
                    error!(error = %err, "stop on abort failed");
                    self.shared.state.send_modify(|s| s.error = Some(err));
                }
                self.shared.transition(OrchestratorState::Aborted);
            }
            Err(err) => {
                let step = self.shared.state.borrow().step_index;
                error!(step, error = %err, "step failed, stopping all channels");
                self.shared.emit(OrchestratorEvent::StepFailed {
                    step,
                    error: err.clone(),
                });
                if let Err(stop_err) = self.shared.system.stop_all().await {
                    error!(error = %stop_err, "stop after failure did not complete");
                }
                self.clear_rates();
                self.fail(err);
            }
        }
        self.cursor
    }

    fn fail(&self, err: FlowError) {
        self.shared.state.send_modify(|s| s.error = Some(err));
        self.shared.transition(OrchestratorState::Error);
    }

    /// Run every remaining group. `Some(control)` means interrupted.
    async fn execute(&mut self) -> FlowResult<Option<Control>> {
        let groups = self.protocol.groups();
        let first = groups
            .iter()
            .position(|g| g.contains(&self.cursor.step))
            .unwrap_or(groups.len());

        for (group_index, range) in groups.into_iter().enumerate().skip(first) {
            if let Some(control) = self.interrupted() {
                return Ok(Some(control));
            }
            if self.cursor.step != range.start {
                self.cursor = Cursor::at(range.start);
            }
            if let Some(control) = self.run_group(group_index, range).await? {
                return Ok(Some(control));
            }
        }
        self.cursor = Cursor::at(self.protocol.len());
        Ok(None)
    }

    async fn run_group(&mut self, group_index: usize, range: Range<usize>) -> FlowResult<Option<Control>> {
        let group = (range.len() > 1).then_some(group_index);
        if let Some(group) = group {
            debug!(group, steps = ?range, "dispatching concurrency group");
        }

        // Routes and priming for every member first, so no delivery runs
        // while a later member is still priming.
        let mut prepared = Vec::with_capacity(range.len());
        for index in range {
            if self.cursor.done.contains(&index) {
                continue;
            }
            let step = &self.protocol.steps[index];
            let delivered = self.cursor.delivered.get(&index).copied().unwrap_or_default();
            if delivered >= full_hold(index, step)? {
                // Finished before the interruption; the stop already ended its flow.
                self.cursor.done.insert(index);
                continue;
            }

            self.publish(|s| {
                s.step_index = index;
                s.step_elapsed = delivered;
            });
            self.shared.emit(OrchestratorEvent::StepStarted { step: index });
            info!(step = index, delivered = ?delivered, "step started");

            let routing = self.shared.system.routing().await;
            let compiled = self
                .shared
                .compiler
                .lock()
                .await
                .compile_remaining(index, step, &routing, group, delivered)?;
            let (setup, hold, teardown) = compiled.split_hold();
            let flow_on = setup
                .iter()
                .rposition(|c| matches!(c.kind, CommandKind::SetFlow { .. }))
                .unwrap_or(setup.len());
            let (prime, start) = setup.split_at(flow_on);
            for command in prime {
                if let Some(control) = self.dispatch(command).await? {
                    return Ok(Some(control));
                }
            }
            prepared.push(Prepared {
                start: start.to_vec(),
                member: Member {
                    index,
                    started: Instant::now(),
                    hold: hold.unwrap_or_default(),
                    delivered_before: delivered,
                    teardown: teardown.to_vec(),
                },
            });
        }

        // Start every delivery back to back. Each hold runs from its own start.
        for Prepared { start, mut member } in prepared {
            for command in &start {
                if let Some(control) = self.dispatch(command).await? {
                    return Ok(Some(control));
                }
            }
            member.started = Instant::now();
            self.active.push(member);
        }

        // Finish members in order of their end time.
        self.active.sort_by_key(Member::end);
        while !self.active.is_empty() {
            let end = self.active[0].end();
            if let Some(control) = self.sleep_until(end).await {
                return Ok(Some(control));
            }
            let member = self.active.remove(0);
            let mut outcome = Ok(None);
            for command in &member.teardown {
                outcome = self.dispatch(command).await;
                if !matches!(outcome, Ok(None)) {
                    break;
                }
            }
            if outcome.is_err() {
                self.active.insert(0, member);
                return outcome;
            }
            let delivered = member.delivered_before + member.started.elapsed();
            self.cursor.delivered.insert(member.index, delivered);
            self.cursor.done.insert(member.index);
            self.publish(|s| s.step_elapsed = delivered);
            self.shared.emit(OrchestratorEvent::StepCompleted { step: member.index });
            info!(step = member.index, ?delivered, "step completed");
            if let Ok(Some(control)) = outcome {
                return Ok(Some(control));
            }
        }
        Ok(None)
    }

    /// Issue one command. Transient failures retry this command only; a
    /// pause or abort cuts the command and its retries short.
    async fn dispatch(&mut self, command: &CompiledCommand) -> FlowResult<Option<Control>> {
        if let Some(control) = self.interrupted() {
            return Ok(Some(control));
        }
        let system = Arc::clone(&self.shared.system);
        match &command.kind {
            CommandKind::ConfigureRoute(path) => {
                let configure = with_retry(&self.shared, command.step, || system.configure_route(path));
                match interruptible(&mut self.control, configure).await {
                    Ok(result) => result?,
                    Err(control) => return Ok(Some(control)),
                }
                debug!(step = command.step, from = %path.from(), to = %path.to(), "route configured");
            }
            CommandKind::SetFlow { pump, rate } => {
                let set = with_retry(&self.shared, command.step, || system.set_flow(pump, *rate));
                match interruptible(&mut self.control, set).await {
                    Ok(result) => result?,
                    Err(control) => return Ok(Some(control)),
                }
                let observed = match system.query(pump).await {
                    Ok(state) => state.rate,
                    Err(err) => {
                        debug!(pump = %pump, error = %err, "rate readback failed");
                        None
                    }
                };
                self.publish(|s| {
                    let status = s.pumps.entry(pump.clone()).or_default();
                    status.commanded = *rate;
                    status.observed = observed;
                });
            }
            CommandKind::Wait { duration, purpose } => {
                debug!(step = command.step, ?duration, ?purpose, "waiting");
                if let Some(control) = self.sleep_until(Instant::now() + *duration).await {
                    return Ok(Some(control));
                }
            }
        }
        Ok(None)
    }

    fn interrupted(&self) -> Option<Control> {
        requested(&self.control)
    }

    /// Sleep until `deadline` unless a pause or abort arrives first.
    async fn sleep_until(&mut self, deadline: Instant) -> Option<Control> {
        interruptible(&mut self.control, tokio::time::sleep_until(deadline))
            .await
            .err()
    }

    /// Fold partial deliveries of flowing steps into the cursor.
    fn record_progress(&mut self) {
        let now = Instant::now();
        let mut current = None;
        for member in self.active.drain(..) {
            let delivered = member.delivered_at(now);
            self.cursor.delivered.insert(member.index, delivered);
            current = Some(delivered);
        }
        self.publish(|s| {
            if let Some(delivered) = current {
                s.step_elapsed = delivered;
            }
        });
    }

    fn clear_rates(&self) {
        self.publish(|s| {
            for status in s.pumps.values_mut() {
                status.commanded = 0.0;
                status.observed = None;
            }
        });
    }

    fn publish(&self, update: impl FnOnce(&mut super::ExecutionState)) {
        let elapsed = self.elapsed_before + self.segment_start.elapsed();
        self.shared.state.send_modify(|s| {
            s.elapsed = elapsed;
            update(s);
        });
    }
}

/// Retry transient failures of one command under the configured policy.
async fn with_retry<F, Fut>(shared: &Shared, step: usize, op: F) -> FlowResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FlowResult<()>>,
{
    retry_transient(&shared.config.retry, op, |attempt, err, backoff| {
        warn!(step, attempt, error = %err, ?backoff, "command failed, retrying");
        shared.emit(OrchestratorEvent::Retrying {
            step,
            attempt,
            error: err.clone(),
            backoff,
        });
    })
    .await
}

fn requested(control: &watch::Receiver<Control>) -> Option<Control> {
    match *control.borrow() {
        Control::Run => None,
        other => Some(other),
    }
}

/// Drive `work` to completion unless a pause or abort arrives first.
async fn interruptible<T>(control: &mut watch::Receiver<Control>, work: impl Future<Output = T>) -> Result<T, Control> {
    tokio::pin!(work);
    loop {
        if let Some(request) = requested(control) {
            return Err(request);
        }
        tokio::select! {
            output = &mut work => return Ok(output),
            changed = control.changed() => {
                if changed.is_err() {
                    // Handle dropped: nobody can resume us.
                    return Err(Control::Abort);
                }
            }
        }
    }
}

/// Delivery or incubation time of a step.
fn full_hold(index: usize, step: &ProtocolStep) -> FlowResult<Duration> {
    match step {
        ProtocolStep::Flow(flow) => flow.delivery_time(index),
        ProtocolStep::Incubate { duration } => Ok(*duration),
    }
}
