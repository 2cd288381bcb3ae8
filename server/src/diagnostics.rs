// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Run-time observability: bounded rolling windows of per-tool matching rates
// and cycle times, health counters, the first-cycle quality check, and
// degradation alerts. Everything here is advisory; nothing in this module
// can stall or abort a cycle.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::RgbImage;
use log::warn;
use serde::Serialize;
use tokio::sync::broadcast;

use argus_elements::clock_trait::ClockTrait;
use argus_elements::image_utils::consistency_check;
use argus_elements::types::{CycleResult, HealthReport, HealthStatus,
                            RunState, ServerEvent, ToolStatus, Verdict,
                            WarningKind};
use argus_elements::value_stats::{ValueStats, ValueStatsAccumulator};

// Rolling window length for per-tool rates and cycle times.
const WINDOW_CAPACITY: usize = 100;

// The degradation rule: mean of the most recent TAIL_LENGTH rates more than
// DEGRADATION_POINTS below the window mean.
const TAIL_LENGTH: usize = 20;
const DEGRADATION_POINTS: f64 = 5.0;

// One degradation warning per tool within this span.
const DEGRADATION_COOLDOWN: Duration = Duration::from_secs(300);

// Consecutive capture failures at which the camera is reported unhealthy.
pub const CAMERA_UNHEALTHY_THRESHOLD: u32 = 3;

struct ToolWindow {
    rates: ValueStatsAccumulator,
    errors: i64,
    last_degradation: Option<Instant>,
}

#[derive(Default)]
struct Counters {
    triggers_accepted: i64,
    triggers_dropped: i64,
    cycles_ok: i64,
    cycles_ng: i64,
    capture_failures: i64,
    io_failures: i64,
    persistence_failures: i64,
    slow_cycles: i64,
}

struct DiagState {
    tools: BTreeMap<u32, ToolWindow>,
    cycle_time: ValueStatsAccumulator,
    counters: Counters,
    consecutive_capture_failures: u32,
}

#[derive(Serialize)]
pub struct ToolDiagnostics {
    pub tool_id: u32,
    pub samples: usize,
    pub errors: i64,
    pub rate_stats: ValueStats,
}

#[derive(Serialize)]
pub struct CounterSnapshot {
    pub triggers_accepted: i64,
    pub triggers_dropped: i64,
    pub cycles_ok: i64,
    pub cycles_ng: i64,
    pub capture_failures: i64,
    pub io_failures: i64,
    pub persistence_failures: i64,
    pub slow_cycles: i64,
}

#[derive(Serialize)]
pub struct DiagnosticsReport {
    pub counters: CounterSnapshot,
    pub cycle_time_ms: ValueStats,
    pub tools: Vec<ToolDiagnostics>,
}

pub struct Diagnostics {
    state: Mutex<DiagState>,
    events: broadcast::Sender<ServerEvent>,
    clock: Arc<dyn ClockTrait>,
}

impl Diagnostics {
    pub fn new(events: broadcast::Sender<ServerEvent>,
               clock: Arc<dyn ClockTrait>) -> Self {
        Diagnostics {
            state: Mutex::new(DiagState {
                tools: BTreeMap::new(),
                cycle_time: ValueStatsAccumulator::new(WINDOW_CAPACITY),
                counters: Counters::default(),
                consecutive_capture_failures: 0,
            }),
            events,
            clock,
        }
    }

    fn emit(&self, kind: WarningKind, message: String,
            detail: Option<String>) {
        warn!("{:?}: {}", kind, message);
        let _ = self.events.send(ServerEvent::Warning {
            kind, message, detail });
    }

    // Folds one completed cycle into the rolling windows and counters, then
    // runs degradation detection for each tool that produced a rate.
    pub fn per_cycle(&self, result: &CycleResult) {
        let now = self.clock.now();
        let mut degradations = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.cycle_time.add_value(result.processing_time_ms);
            match result.overall {
                Verdict::Ok => state.counters.cycles_ok += 1,
                Verdict::Ng => state.counters.cycles_ng += 1,
            }
            for tool_result in &result.tool_results {
                let window = state.tools.entry(tool_result.tool_id)
                    .or_insert_with(|| ToolWindow {
                        rates: ValueStatsAccumulator::new(WINDOW_CAPACITY),
                        errors: 0,
                        last_degradation: None,
                    });
                if tool_result.status == ToolStatus::Error {
                    window.errors += 1;
                    continue;
                }
                window.rates.add_value(tool_result.rate);
                if let Some(message) =
                    Self::check_degradation(window, now) {
                    degradations.push(message);
                }
            }
        }
        for message in degradations {
            self.emit(WarningKind::Degradation, message, None);
        }
    }

    // Degradation: the tail mean has slipped more than DEGRADATION_POINTS
    // below the window mean. Requires a full tail plus history beyond it,
    // deduplicated per tool by the cooldown.
    fn check_degradation(window: &mut ToolWindow, now: Instant)
                         -> Option<String> {
        if window.rates.count() < 2 * TAIL_LENGTH {
            return None;
        }
        let tail = window.rates.tail_mean(TAIL_LENGTH)?;
        let whole = window.rates.window_mean()?;
        if tail >= whole - DEGRADATION_POINTS {
            return None;
        }
        if let Some(last) = window.last_degradation {
            if now.duration_since(last) < DEGRADATION_COOLDOWN {
                return None;
            }
        }
        window.last_degradation = Some(now);
        Some(format!(
            "matching rate degrading: recent mean {:.1} vs window mean {:.1}",
            tail, whole))
    }

    // First-cycle comparison of the captured frame against the master; any
    // finding surfaces as a QUALITY_WARNING event, and inspection proceeds.
    pub fn first_cycle_quality(&self, master: &RgbImage,
                               captured: &RgbImage) {
        let report = consistency_check(master, captured);
        for issue in &report.issues {
            self.emit(WarningKind::QualityWarning, issue.clone(),
                      Some("issue".to_string()));
        }
        for warning in &report.warnings {
            self.emit(WarningKind::QualityWarning, warning.clone(), None);
        }
    }

    pub fn trigger_accepted(&self) {
        self.state.lock().unwrap().counters.triggers_accepted += 1;
    }

    pub fn trigger_dropped(&self) {
        self.state.lock().unwrap().counters.triggers_dropped += 1;
    }

    pub fn triggers_dropped(&self) -> i64 {
        self.state.lock().unwrap().counters.triggers_dropped
    }

    // Returns the consecutive-failure count so the caller can escalate at
    // CAMERA_UNHEALTHY_THRESHOLD.
    pub fn capture_failure(&self, message: &str) -> u32 {
        let consecutive = {
            let mut state = self.state.lock().unwrap();
            state.counters.capture_failures += 1;
            state.consecutive_capture_failures += 1;
            state.consecutive_capture_failures
        };
        if consecutive == CAMERA_UNHEALTHY_THRESHOLD {
            self.emit(WarningKind::CameraUnhealthy,
                      format!("{} consecutive capture failures", consecutive),
                      Some(message.to_string()));
        }
        consecutive
    }

    pub fn capture_ok(&self) {
        self.state.lock().unwrap().consecutive_capture_failures = 0;
    }

    pub fn io_failure(&self, message: &str) {
        self.state.lock().unwrap().counters.io_failures += 1;
        self.emit(WarningKind::IoUnhealthy,
                  format!("digital output write failed: {}", message), None);
    }

    pub fn persistence_failure(&self) {
        self.state.lock().unwrap().counters.persistence_failures += 1;
    }

    pub fn slow_cycle(&self, elapsed_ms: f64, deadline_ms: f64,
                      slowest_stage: &str) {
        self.state.lock().unwrap().counters.slow_cycles += 1;
        self.emit(WarningKind::SlowCycle,
                  format!("cycle took {:.1} ms against a {:.0} ms deadline",
                          elapsed_ms, deadline_ms),
                  Some(format!("slowest stage: {}", slowest_stage)));
    }

    pub fn snapshot(&self) -> DiagnosticsReport {
        let state = self.state.lock().unwrap();
        DiagnosticsReport {
            counters: CounterSnapshot {
                triggers_accepted: state.counters.triggers_accepted,
                triggers_dropped: state.counters.triggers_dropped,
                cycles_ok: state.counters.cycles_ok,
                cycles_ng: state.counters.cycles_ng,
                capture_failures: state.counters.capture_failures,
                io_failures: state.counters.io_failures,
                persistence_failures: state.counters.persistence_failures,
                slow_cycles: state.counters.slow_cycles,
            },
            cycle_time_ms: state.cycle_time.value_stats.clone(),
            tools: state.tools.iter().map(|(tool_id, window)| {
                ToolDiagnostics {
                    tool_id: *tool_id,
                    samples: window.rates.count(),
                    errors: window.errors,
                    rate_stats: window.rates.value_stats.clone(),
                }
            }).collect(),
        }
    }

    pub fn health(&self, run_state: RunState) -> HealthReport {
        let state = self.state.lock().unwrap();
        let camera = match state.consecutive_capture_failures {
            0 => HealthStatus::Ok,
            n if n < CAMERA_UNHEALTHY_THRESHOLD => HealthStatus::Degraded,
            _ => HealthStatus::Fault,
        };
        let io = if state.counters.io_failures == 0 {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };
        let store = match state.counters.persistence_failures {
            0 => HealthStatus::Ok,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Fault,
        };
        let mut overall = [camera, io, store].into_iter().max_by_key(
            |status| match status {
                HealthStatus::Ok => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Fault => 2,
            }).unwrap();
        if run_state == RunState::Fault {
            overall = HealthStatus::Fault;
        }
        HealthReport { camera, io, store, overall }
    }

    pub fn reset_session(&self) {
        let mut state = self.state.lock().unwrap();
        state.cycle_time.reset_session();
        for window in state.tools.values_mut() {
            window.rates.reset_session();
        }
    }
}

#[cfg(test)]
mod tests {
    use argus_elements::clock_trait::SystemClock;
    use argus_elements::types::{ToolAux, ToolKind, ToolResult,
                                TriggerSource};
    use chrono::Utc;
    use super::*;

    fn diagnostics() -> (Diagnostics, broadcast::Receiver<ServerEvent>) {
        let (events, receiver) = broadcast::channel(64);
        (Diagnostics::new(events, Arc::new(SystemClock)), receiver)
    }

    fn result_with_rate(rate: f64) -> CycleResult {
        CycleResult {
            program_id: 1,
            cycle_seq: 1,
            timestamp: Utc::now(),
            trigger_source: TriggerSource::Internal,
            overall: Verdict::Ok,
            tool_results: vec![ToolResult {
                tool_id: 7,
                kind: ToolKind::Area,
                status: ToolStatus::Ok,
                rate,
                threshold: 50.0,
                upper_limit: None,
                aux: ToolAux::default(),
            }],
            processing_time_ms: 12.0,
            per_stage_ms: BTreeMap::new(),
            error: None,
        }
    }

    fn drain_warnings(receiver: &mut broadcast::Receiver<ServerEvent>)
                      -> Vec<WarningKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let ServerEvent::Warning { kind, .. } = event {
                kinds.push(kind);
            }
        }
        kinds
    }

    #[test]
    fn test_degradation_fires_once_per_cooldown() {
        let (diagnostics, mut receiver) = diagnostics();
        // 40 healthy cycles, then a cliff: the 20-cycle tail mean drops far
        // below the window mean.
        for _ in 0..40 {
            diagnostics.per_cycle(&result_with_rate(100.0));
        }
        assert!(drain_warnings(&mut receiver).is_empty());
        for _ in 0..20 {
            diagnostics.per_cycle(&result_with_rate(60.0));
        }
        let warnings = drain_warnings(&mut receiver);
        assert_eq!(warnings.iter().filter(
            |k| **k == WarningKind::Degradation).count(), 1);
    }

    #[test]
    fn test_stable_rates_never_warn() {
        let (diagnostics, mut receiver) = diagnostics();
        for _ in 0..200 {
            diagnostics.per_cycle(&result_with_rate(95.0));
        }
        assert!(drain_warnings(&mut receiver).is_empty());
    }

    #[test]
    fn test_error_results_count_but_do_not_pollute_rates() {
        let (diagnostics, _receiver) = diagnostics();
        let mut result = result_with_rate(100.0);
        result.tool_results[0].status = ToolStatus::Error;
        result.tool_results[0].rate = 0.0;
        diagnostics.per_cycle(&result);
        diagnostics.per_cycle(&result_with_rate(100.0));

        let report = diagnostics.snapshot();
        assert_eq!(report.tools.len(), 1);
        assert_eq!(report.tools[0].errors, 1);
        assert_eq!(report.tools[0].samples, 1);
    }

    #[test]
    fn test_capture_failure_escalation() {
        let (diagnostics, mut receiver) = diagnostics();
        assert_eq!(diagnostics.capture_failure("driver timeout"), 1);
        assert_eq!(diagnostics.capture_failure("driver timeout"), 2);
        assert!(drain_warnings(&mut receiver).is_empty());
        assert_eq!(diagnostics.capture_failure("driver timeout"), 3);
        assert_eq!(drain_warnings(&mut receiver),
                   vec![WarningKind::CameraUnhealthy]);

        // Recovery resets the streak and the health surface.
        diagnostics.capture_ok();
        let health = diagnostics.health(RunState::Running);
        assert_eq!(health.camera, HealthStatus::Ok);
    }

    #[test]
    fn test_health_aggregates_worst() {
        let (diagnostics, _receiver) = diagnostics();
        assert_eq!(diagnostics.health(RunState::Idle).overall,
                   HealthStatus::Ok);
        diagnostics.io_failure("sim write refused");
        let health = diagnostics.health(RunState::Idle);
        assert_eq!(health.io, HealthStatus::Degraded);
        assert_eq!(health.overall, HealthStatus::Degraded);
        assert_eq!(diagnostics.health(RunState::Fault).overall,
                   HealthStatus::Fault);
    }

    #[test]
    fn test_trigger_counters() {
        let (diagnostics, _receiver) = diagnostics();
        diagnostics.trigger_accepted();
        diagnostics.trigger_accepted();
        diagnostics.trigger_dropped();
        let report = diagnostics.snapshot();
        assert_eq!(report.counters.triggers_accepted, 2);
        assert_eq!(report.counters.triggers_dropped, 1);
    }
}  // mod tests.
