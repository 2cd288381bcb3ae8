// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// The run state machine: IDLE -> ARMING -> RUNNING <-> PAUSED -> STOPPING ->
// IDLE, with FAULT reachable from any non-IDLE state. Trigger sources
// (internal timer, debounced external edge, manual pulse) feed a depth-1
// control channel consumed by a single run task, so at most one cycle per
// program executes at any instant; a trigger arriving while the slot is
// occupied is dropped and counted, never queued behind it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::{info, warn};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use argus_elements::clock_trait::ClockTrait;
use argus_elements::io_trait::{EdgeEvent, EdgeKind, InputLine};
use argus_elements::types::{RunState, ServerEvent, TriggerMode,
                            TriggerSource};

use crate::diagnostics::{CAMERA_UNHEALTHY_THRESHOLD, Diagnostics};
use crate::inspect_engine::{ArmedEngine, SharedCamera, SharedIo};
use crate::program_store::ProgramStore;
use crate::result_sink::ResultSink;

struct ControllerState {
    run_state: RunState,
    program_id: Option<i64>,

    // Depth-1 control channel into the run task. Dropping it closes the
    // channel, which ends the run task after any in-flight cycle.
    trigger_tx: Option<mpsc::Sender<TriggerSource>>,

    paused: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,

    source_tasks: Vec<JoinHandle<()>>,
}

pub struct TriggerController {
    state: Arc<tokio::sync::Mutex<ControllerState>>,
    store: Arc<ProgramStore>,
    camera: SharedCamera,
    io: SharedIo,
    sink: Arc<ResultSink>,
    diagnostics: Arc<Diagnostics>,
    clock: Arc<dyn ClockTrait>,
    events: broadcast::Sender<ServerEvent>,
}

impl TriggerController {
    pub fn new(store: Arc<ProgramStore>, camera: SharedCamera, io: SharedIo,
               sink: Arc<ResultSink>, diagnostics: Arc<Diagnostics>,
               clock: Arc<dyn ClockTrait>,
               events: broadcast::Sender<ServerEvent>) -> Self {
        TriggerController {
            state: Arc::new(tokio::sync::Mutex::new(ControllerState {
                run_state: RunState::Idle,
                program_id: None,
                trigger_tx: None,
                paused: Arc::new(AtomicBool::new(false)),
                stopping: Arc::new(AtomicBool::new(false)),
                source_tasks: Vec::new(),
            })),
            store,
            camera,
            io,
            sink,
            diagnostics,
            clock,
            events,
        }
    }

    fn emit_state(&self, program_id: i64, state: RunState) {
        let _ = self.events.send(ServerEvent::State { program_id, state });
    }

    pub async fn run_state(&self) -> (RunState, Option<i64>) {
        let state = self.state.lock().await;
        (state.run_state, state.program_id)
    }

    // True whenever a run session holds resources (any non-IDLE state).
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.run_state != RunState::Idle
    }

    pub async fn start(&self, program_id: i64) -> Result<(), CanonicalError> {
        {
            let mut state = self.state.lock().await;
            if state.run_state != RunState::Idle {
                return Err(failed_precondition_error(&format!(
                    "cannot start while {:?}", state.run_state)));
            }
            state.run_state = RunState::Arming;
            state.program_id = Some(program_id);
        }
        self.emit_state(program_id, RunState::Arming);

        let engine = match ArmedEngine::arm(
            program_id, &self.store, self.camera.clone(), self.io.clone(),
            self.diagnostics.clone()).await {
            Ok(engine) => engine,
            Err(e) => {
                let mut state = self.state.lock().await;
                state.run_state = RunState::Idle;
                state.program_id = None;
                drop(state);
                self.emit_state(program_id, RunState::Idle);
                return Err(e);
            }
        };
        // Subscribe before committing to the run so a subscription failure
        // rolls back to IDLE cleanly.
        let external_edges = match engine.program().trigger {
            TriggerMode::External { .. } => {
                let subscription = self.io.lock().unwrap()
                    .subscribe(InputLine::TRIGGER, EdgeKind::Rising);
                match subscription {
                    Ok(edges) => Some(edges),
                    Err(e) => {
                        let mut state = self.state.lock().await;
                        state.run_state = RunState::Idle;
                        state.program_id = None;
                        drop(state);
                        self.emit_state(program_id, RunState::Idle);
                        return Err(e);
                    }
                }
            }
            _ => None,
        };
        self.store.mark_running(program_id);

        let (trigger_tx, trigger_rx) = mpsc::channel::<TriggerSource>(1);
        let paused = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));

        let mut source_tasks = Vec::new();
        match engine.program().trigger {
            TriggerMode::Internal { period_ms } => {
                source_tasks.push(self.spawn_internal_source(
                    period_ms, trigger_tx.clone(), paused.clone(),
                    stopping.clone()));
            }
            TriggerMode::External { debounce_ms } => {
                source_tasks.push(self.spawn_external_source(
                    debounce_ms, external_edges.unwrap(), trigger_tx.clone(),
                    paused.clone(), stopping.clone()));
            }
            TriggerMode::Manual => (),
        }

        {
            let mut state = self.state.lock().await;
            state.run_state = RunState::Running;
            state.trigger_tx = Some(trigger_tx);
            state.paused = paused;
            state.stopping = stopping.clone();
            state.source_tasks = source_tasks;
        }
        // Spawned after the state commit so a fast first-cycle fault cannot
        // be overwritten by the RUNNING transition.
        tokio::spawn(Self::run_loop(
            engine, trigger_rx, self.state.clone(), self.store.clone(),
            self.sink.clone(), self.diagnostics.clone(), self.events.clone(),
            stopping));

        info!("Started program {}", program_id);
        self.emit_state(program_id, RunState::Running);
        Ok(())
    }

    fn spawn_internal_source(&self, period_ms: u64,
                             trigger_tx: mpsc::Sender<TriggerSource>,
                             paused: Arc<AtomicBool>,
                             stopping: Arc<AtomicBool>) -> JoinHandle<()> {
        let clock = self.clock.clone();
        let diagnostics = self.diagnostics.clone();
        tokio::spawn(async move {
            let period = Duration::from_millis(period_ms);
            loop {
                clock.sleep(period).await;
                if stopping.load(Ordering::Relaxed) {
                    break;
                }
                if paused.load(Ordering::Relaxed) {
                    continue;
                }
                match trigger_tx.try_send(TriggerSource::Internal) {
                    Ok(()) => diagnostics.trigger_accepted(),
                    Err(TrySendError::Full(_)) => diagnostics.trigger_dropped(),
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        })
    }

    fn spawn_external_source(&self, debounce_ms: u64,
                             mut edges: mpsc::UnboundedReceiver<EdgeEvent>,
                             trigger_tx: mpsc::Sender<TriggerSource>,
                             paused: Arc<AtomicBool>,
                             stopping: Arc<AtomicBool>) -> JoinHandle<()> {
        let diagnostics = self.diagnostics.clone();
        tokio::spawn(async move {
            let debounce = Duration::from_millis(debounce_ms);
            let mut last_accepted: Option<Instant> = None;
            while let Some(event) = edges.recv().await {
                if stopping.load(Ordering::Relaxed) {
                    break;
                }
                if paused.load(Ordering::Relaxed) {
                    continue;
                }
                // An edge is accepted only if the previous accepted edge was
                // more than debounce_ms ago.
                if let Some(last) = last_accepted {
                    if event.at.duration_since(last) <= debounce {
                        continue;
                    }
                }
                last_accepted = Some(event.at);
                match trigger_tx.try_send(TriggerSource::External) {
                    Ok(()) => diagnostics.trigger_accepted(),
                    Err(TrySendError::Full(_)) => diagnostics.trigger_dropped(),
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        })
    }

    // The single consumer of the control channel. Runs cycles strictly
    // serially; exits when the channel closes (stop) or on a fault
    // escalation, then settles the state machine.
    async fn run_loop(mut engine: ArmedEngine,
                      mut trigger_rx: mpsc::Receiver<TriggerSource>,
                      state: Arc<tokio::sync::Mutex<ControllerState>>,
                      store: Arc<ProgramStore>, sink: Arc<ResultSink>,
                      diagnostics: Arc<Diagnostics>,
                      events: broadcast::Sender<ServerEvent>,
                      stopping: Arc<AtomicBool>) {
        let program_id = engine.program().id;
        let mut fault: Option<String> = None;
        while let Some(source) = trigger_rx.recv().await {
            if stopping.load(Ordering::Relaxed) {
                break;
            }
            let result = engine.run_cycle(source).await;
            diagnostics.per_cycle(&result);
            if let Err(e) = sink.append(result) {
                diagnostics.persistence_failure();
                fault = Some(format!(
                    "cycle result could not be persisted: {}", e.message));
                break;
            }
            if engine.consecutive_capture_failures()
                >= CAMERA_UNHEALTHY_THRESHOLD {
                fault = Some(
                    "camera unhealthy: repeated capture failures".to_string());
                break;
            }
            if engine.internal_errors_excessive() {
                fault = Some(
                    "repeated internal evaluation errors".to_string());
                break;
            }
        }
        engine.disarm();
        store.clear_running();
        stopping.store(true, Ordering::Relaxed);

        let next = match fault {
            Some(message) => {
                warn!("Program {} run faulted: {}", program_id, message);
                let _ = events.send(ServerEvent::Error {
                    code: "FAULT".to_string(),
                    message,
                });
                RunState::Fault
            }
            None => {
                info!("Program {} run stopped", program_id);
                RunState::Idle
            }
        };
        {
            let mut locked = state.lock().await;
            locked.run_state = next;
            locked.trigger_tx = None;
            for task in locked.source_tasks.drain(..) {
                task.abort();
            }
            if next == RunState::Idle {
                locked.program_id = None;
            }
        }
        let _ = events.send(ServerEvent::State { program_id, state: next });
    }

    // Accepted only while RUNNING and no cycle is executing or pending.
    pub async fn trigger_manual(&self) -> Result<(), CanonicalError> {
        let state = self.state.lock().await;
        if state.run_state != RunState::Running {
            return Err(failed_precondition_error(&format!(
                "manual trigger rejected while {:?}", state.run_state)));
        }
        let trigger_tx = state.trigger_tx.as_ref().ok_or_else(
            || failed_precondition_error("no active run"))?;
        match trigger_tx.try_send(TriggerSource::Manual) {
            Ok(()) => {
                self.diagnostics.trigger_accepted();
                Ok(())
            }
            Err(TrySendError::Full(_)) =>
                Err(failed_precondition_error(
                    "manual trigger rejected: cycle in progress")),
            Err(TrySendError::Closed(_)) =>
                Err(failed_precondition_error("no active run")),
        }
    }

    // Stops accepting new triggers; an in-flight cycle completes.
    pub async fn pause(&self) -> Result<(), CanonicalError> {
        let program_id;
        {
            let mut state = self.state.lock().await;
            if state.run_state != RunState::Running {
                return Err(failed_precondition_error(&format!(
                    "cannot pause while {:?}", state.run_state)));
            }
            state.run_state = RunState::Paused;
            state.paused.store(true, Ordering::Relaxed);
            program_id = state.program_id.unwrap_or_default();
        }
        self.emit_state(program_id, RunState::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), CanonicalError> {
        let program_id;
        {
            let mut state = self.state.lock().await;
            if state.run_state != RunState::Paused {
                return Err(failed_precondition_error(&format!(
                    "cannot resume while {:?}", state.run_state)));
            }
            state.run_state = RunState::Running;
            state.paused.store(false, Ordering::Relaxed);
            program_id = state.program_id.unwrap_or_default();
        }
        self.emit_state(program_id, RunState::Running);
        Ok(())
    }

    // Cooperative: the flag is checked between cycles and the control
    // channel closes, so the run task winds down after any in-flight cycle.
    pub async fn stop(&self) -> Result<(), CanonicalError> {
        let program_id;
        {
            let mut state = self.state.lock().await;
            match state.run_state {
                RunState::Running | RunState::Paused => (),
                other => {
                    return Err(failed_precondition_error(&format!(
                        "cannot stop while {:?}", other)));
                }
            }
            state.run_state = RunState::Stopping;
            state.stopping.store(true, Ordering::Relaxed);
            state.trigger_tx = None;
            program_id = state.program_id.unwrap_or_default();
        }
        self.emit_state(program_id, RunState::Stopping);
        Ok(())
    }

    // Leaves FAULT. Re-enables control only; inspection does not restart
    // until an explicit start().
    pub async fn reset(&self) -> Result<(), CanonicalError> {
        let program_id;
        {
            let mut state = self.state.lock().await;
            if state.run_state != RunState::Fault {
                return Err(failed_precondition_error(&format!(
                    "cannot reset while {:?}", state.run_state)));
            }
            for task in state.source_tasks.drain(..) {
                task.abort();
            }
            state.run_state = RunState::Idle;
            program_id = state.program_id.take().unwrap_or_default();
            state.trigger_tx = None;
        }
        info!("Fault cleared for program {}", program_id);
        self.emit_state(program_id, RunState::Idle);
        Ok(())
    }
}

// mod tests.
