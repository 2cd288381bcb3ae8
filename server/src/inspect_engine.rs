// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// The per-cycle inspection pipeline. arm() loads a program, loads its master
// image, and extracts master features for every tool; run_cycle() then
// executes capture -> position correction -> per-tool evaluation ->
// aggregation -> output actuation and returns the cycle record. The caller
// (trigger controller) owns serialization: at most one run_cycle per program
// is in flight at any instant.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error};
use chrono::Utc;
use image::RgbImage;
use log::{debug, info, warn};

use argus_elements::camera_trait::CameraTrait;
use argus_elements::io_trait::{DigitalIoTrait, OutputLine};
use argus_elements::types::{CycleResult, OutputBinding, Program, ToolAux,
                            ToolConfig, ToolKind, ToolResult, ToolStatus,
                            TriggerMode, TriggerSource, Verdict};

use crate::diagnostics::Diagnostics;
use crate::position_tool::{self, PositionEvaluation, PositionFeatures};
use crate::program_store::ProgramStore;
use crate::tool::{self, ToolFeatures};

pub type SharedCamera = Arc<tokio::sync::Mutex<Box<dyn CameraTrait + Send>>>;
pub type SharedIo = Arc<Mutex<Box<dyn DigitalIoTrait + Send>>>;

// Scoped BUSY bracket: OUT1 goes high on construction and is guaranteed low
// on every exit path, including panics unwinding through run_cycle.
struct BusyGuard {
    io: SharedIo,
    diagnostics: Arc<Diagnostics>,
    released: bool,
}

impl BusyGuard {
    fn assert(io: &SharedIo, diagnostics: &Arc<Diagnostics>) -> BusyGuard {
        let guard = BusyGuard {
            io: io.clone(),
            diagnostics: diagnostics.clone(),
            released: false,
        };
        guard.drive(true);
        guard
    }

    fn drive(&self, value: bool) {
        let result = self.io.lock().unwrap().write(OutputLine::BUSY, value);
        if let Err(e) = result {
            self.diagnostics.io_failure(&e.message);
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.drive(false);
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

fn position_error(message: &str) -> PositionEvaluation {
    PositionEvaluation {
        rate: 0.0,
        status: ToolStatus::Error,
        offset: (0, 0),
        aux: ToolAux {
            offset: Some((0, 0)),
            message: Some(message.to_string()),
            ..Default::default()
        },
    }
}

// An engine that has loaded its program and extracted master features; the
// only state from which cycles may run.
pub struct ArmedEngine {
    program: Program,
    master: Option<RgbImage>,

    position: Option<(ToolConfig, Option<PositionFeatures>)>,
    detections: Vec<(ToolConfig, Option<ToolFeatures>)>,

    camera: SharedCamera,
    io: SharedIo,
    diagnostics: Arc<Diagnostics>,

    cycle_seq: u64,
    first_cycle_done: bool,
    consecutive_capture_failures: u32,

    // Cycle numbers at which unexpected evaluation panics were converted to
    // tool ERRORs; drives the 3-in-10 fault hysteresis.
    internal_error_cycles: Vec<u64>,

    soft_deadline: Duration,
}

impl ArmedEngine {
    // Failure modes:
    //   FailedPrecondition: master image missing/unreadable, resolution
    //     mismatch, or every detection tool unarmed (PROGRAM_NOT_READY).
    // A tool whose feature extraction fails is carried unarmed; it reports
    // ERROR per cycle, which aggregates to NG but never to an all-NG run
    // with silent zero rates.
    pub async fn arm(program_id: i64, store: &ProgramStore,
                     camera: SharedCamera, io: SharedIo,
                     diagnostics: Arc<Diagnostics>)
                     -> Result<ArmedEngine, CanonicalError> {
        let program = store.get(program_id)?;
        let mut master = None;
        if !program.tools.is_empty() {
            let image = store.load_master(program_id).map_err(
                |e| failed_precondition_error(&format!(
                    "program {} is not ready: {}", program_id, e.message)))?;
            if image.dimensions() != program.capture_settings.resolution {
                return Err(failed_precondition_error(&format!(
                    "master image is {}x{} but program resolution is {}x{}",
                    image.width(), image.height(),
                    program.capture_settings.resolution.0,
                    program.capture_settings.resolution.1)));
            }
            master = Some(image);
        }

        let mut position = None;
        let mut detections = Vec::new();
        let mut armed_detections = 0;
        for config in &program.tools {
            // `master` is present here: programs with tools cannot reach
            // this loop without one.
            let master_image = master.as_ref().unwrap();
            if config.kind == ToolKind::PositionAdjust {
                let features = match position_tool::extract(config, master_image) {
                    Ok(features) => Some(features),
                    Err(e) => {
                        warn!("Program {} tool {} unarmed: {}",
                              program_id, config.id, e.message);
                        None
                    }
                };
                position = Some((*config, features));
            } else {
                let features = match tool::extract_master_features(
                    config, master_image) {
                    Ok(features) => Some(features),
                    Err(e) => {
                        warn!("Program {} tool {} unarmed: {}",
                              program_id, config.id, e.message);
                        None
                    }
                };
                if features.is_some() {
                    armed_detections += 1;
                }
                detections.push((*config, features));
            }
        }
        if !detections.is_empty() && armed_detections == 0 {
            return Err(failed_precondition_error(&format!(
                "program {} is not ready: no detection tool could be armed",
                program_id)));
        }

        let soft_deadline = match program.trigger {
            TriggerMode::Internal { period_ms } =>
                Duration::from_millis(2 * period_ms).max(Duration::from_secs(1)),
            _ => Duration::from_secs(1),
        };

        info!("Armed program {} ({} of {} detection tools, position tool: {})",
              program_id, armed_detections, detections.len(),
              position.is_some());
        Ok(ArmedEngine {
            program,
            master,
            position,
            detections,
            camera,
            io,
            diagnostics,
            cycle_seq: 0,
            first_cycle_done: false,
            consecutive_capture_failures: 0,
            internal_error_cycles: Vec::new(),
            soft_deadline,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn cycle_seq(&self) -> u64 {
        self.cycle_seq
    }

    pub fn consecutive_capture_failures(&self) -> u32 {
        self.consecutive_capture_failures
    }

    // True when 3 or more internal evaluation errors occurred within the
    // last 10 cycles.
    pub fn internal_errors_excessive(&self) -> bool {
        let floor = self.cycle_seq.saturating_sub(10);
        self.internal_error_cycles.iter().filter(|c| **c > floor).count() >= 3
    }

    // Releases master-feature memory. The engine cannot run further cycles.
    pub fn disarm(self) {
        debug!("Disarmed program {}", self.program.id);
    }

    pub async fn run_cycle(&mut self, trigger_source: TriggerSource)
                           -> CycleResult {
        let cycle_start = Instant::now();
        self.cycle_seq += 1;
        let mut per_stage_ms: BTreeMap<String, f64> = BTreeMap::new();

        let mut busy = BusyGuard::assert(&self.io, &self.diagnostics);

        let stage_start = Instant::now();
        let capture = {
            let mut camera = self.camera.lock().await;
            camera.capture(&self.program.capture_settings).await
        };
        per_stage_ms.insert("capture".to_string(), elapsed_ms(stage_start));

        let frame = match capture {
            Err(e) => {
                self.consecutive_capture_failures =
                    self.diagnostics.capture_failure(&e.message);
                busy.release();
                return self.finish_cycle(
                    cycle_start, per_stage_ms, trigger_source, Verdict::Ng,
                    vec![], Some(format!("capture failed: {}", e.message)));
            }
            Ok(frame) => {
                self.consecutive_capture_failures = 0;
                self.diagnostics.capture_ok();
                frame
            }
        };

        if !self.first_cycle_done {
            self.first_cycle_done = true;
            if let Some(master) = &self.master {
                let stage_start = Instant::now();
                self.diagnostics.first_cycle_quality(master, &frame.image);
                per_stage_ms.insert("consistency_check".to_string(),
                                    elapsed_ms(stage_start));
            }
        }

        let mut internal_errors = 0_u32;
        let mut tool_results = Vec::new();

        // Position adjustment runs first; its offset shifts every detection
        // ROI for the remainder of the cycle. An ERROR here is surfaced but
        // not fatal: detection tools run with zero offset.
        let mut offset = (0, 0);
        let mut position_threshold = 0.0;
        if let Some((config, features)) = &self.position {
            position_threshold = config.threshold;
            let stage_start = Instant::now();
            let evaluation = match features {
                None => position_error("unarmed"),
                Some(features) => {
                    match catch_unwind(AssertUnwindSafe(
                        || position_tool::evaluate(config, features,
                                                   &frame.image))) {
                        Ok(evaluation) => evaluation,
                        Err(_) => {
                            internal_errors += 1;
                            position_error("internal evaluation error")
                        }
                    }
                }
            };
            offset = evaluation.offset;
            tool_results.push(ToolResult {
                tool_id: config.id,
                kind: config.kind,
                status: evaluation.status,
                rate: evaluation.rate,
                threshold: config.threshold,
                upper_limit: config.upper_limit,
                aux: evaluation.aux,
            });
            per_stage_ms.insert("position".to_string(),
                                elapsed_ms(stage_start));
        }

        let stage_start = Instant::now();
        for (config, features) in &self.detections {
            let evaluation = match features {
                None => tool::error_evaluation("unarmed"),
                Some(features) => {
                    let roi_adjusted = config.roi.offset(offset.0, offset.1);
                    match catch_unwind(AssertUnwindSafe(
                        || tool::evaluate(config, features, &frame.image,
                                          &roi_adjusted))) {
                        Ok(evaluation) => evaluation,
                        Err(_) => {
                            internal_errors += 1;
                            tool::error_evaluation("internal evaluation error")
                        }
                    }
                }
            };
            tool_results.push(tool::tool_result(config, evaluation));
        }
        per_stage_ms.insert("evaluate".to_string(), elapsed_ms(stage_start));

        for _ in 0..internal_errors {
            self.internal_error_cycles.push(self.cycle_seq);
        }

        // Overall OK iff every detection tool is OK. The position tool
        // contributes only when its threshold is above zero; a zero
        // threshold explicitly opts it out of scoring.
        let mut overall = Verdict::Ok;
        for result in &tool_results {
            let counted = result.kind != ToolKind::PositionAdjust
                || position_threshold > 0.0;
            if counted && result.status != ToolStatus::Ok {
                overall = Verdict::Ng;
            }
        }

        let stage_start = Instant::now();
        self.drive_outputs(overall);
        busy.release();
        per_stage_ms.insert("outputs".to_string(), elapsed_ms(stage_start));

        self.finish_cycle(cycle_start, per_stage_ms, trigger_source, overall,
                          tool_results, None)
    }

    // Pulses the verdict line and drives the operator-bound levels. Output
    // failures are surfaced as IO_UNHEALTHY but never abort the cycle.
    fn drive_outputs(&self, overall: Verdict) {
        let pulse_width = Duration::from_millis(self.program.output_pulse_ms);
        let mut failures = Vec::new();
        {
            let mut io = self.io.lock().unwrap();
            let verdict_line = match overall {
                Verdict::Ok => OutputLine::OK_PULSE,
                Verdict::Ng => OutputLine::NG_PULSE,
            };
            if let Err(e) = io.pulse(verdict_line, pulse_width) {
                failures.push(e.message);
            }
            for (index, binding) in self.program.outputs.bindings() {
                let line = OutputLine::from_index(index).unwrap();
                let level = match binding {
                    OutputBinding::OkLevel => Some(overall == Verdict::Ok),
                    OutputBinding::NgLevel => Some(overall == Verdict::Ng),
                    OutputBinding::AlwaysOn => Some(true),
                    OutputBinding::AlwaysOff => Some(false),
                    // UNUSED lines are never mutated during a cycle.
                    OutputBinding::Unused => None,
                };
                if let Some(level) = level {
                    if let Err(e) = io.write(line, level) {
                        failures.push(e.message);
                    }
                }
            }
        }
        for message in failures {
            self.diagnostics.io_failure(&message);
        }
    }

    fn finish_cycle(&mut self, cycle_start: Instant,
                    mut per_stage_ms: BTreeMap<String, f64>,
                    trigger_source: TriggerSource, overall: Verdict,
                    tool_results: Vec<ToolResult>, error: Option<String>)
                    -> CycleResult {
        let processing_time_ms = elapsed_ms(cycle_start);
        let accounted: f64 = per_stage_ms.values().sum();
        per_stage_ms.insert("finalize".to_string(),
                            (processing_time_ms - accounted).max(0.0));

        let deadline_ms = self.soft_deadline.as_secs_f64() * 1000.0;
        if processing_time_ms > deadline_ms {
            let slowest = per_stage_ms.iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(stage, _)| stage.clone())
                .unwrap_or_default();
            self.diagnostics.slow_cycle(processing_time_ms, deadline_ms,
                                        &slowest);
            if slowest == "capture" {
                self.consecutive_capture_failures =
                    self.diagnostics.capture_failure("slow capture");
            }
        }

        CycleResult {
            program_id: self.program.id,
            cycle_seq: self.cycle_seq,
            timestamp: Utc::now(),
            trigger_source,
            overall,
            tool_results,
            processing_time_ms,
            per_stage_ms,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use argus_elements::clock_trait::SystemClock;
    use argus_elements::image_utils::encode_lossless;
    use argus_elements::types::{BrightnessMode, CaptureSettings,
                                OutputsConfig, ServerEvent, ToolParams,
                                WarningKind, DEFAULT_PULSE_MS};
    use image::Rgb;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    use crate::image_camera::ImageCamera;
    use crate::sim_io::SimIoHandle;
    use super::*;

    fn square_image(x0: u32, y0: u32) -> RgbImage {
        let mut image = RgbImage::from_pixel(64, 64, Rgb([128, 128, 128]));
        for y in y0..y0 + 16 {
            for x in x0..x0 + 16 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        image
    }

    fn area_tool(id: u32, roi: argus_elements::types::Roi) -> ToolConfig {
        ToolConfig {
            id,
            kind: ToolKind::Area,
            roi,
            threshold: 90.0,
            upper_limit: Some(110.0),
            params: ToolParams {
                threshold_override: Some(200),
                ..Default::default()
            },
        }
    }

    fn base_program(tools: Vec<ToolConfig>) -> Program {
        Program {
            id: 0,
            name: "bench".to_string(),
            trigger: TriggerMode::Manual,
            capture_settings: CaptureSettings {
                brightness_mode: BrightnessMode::Normal,
                focus: 50,
                resolution: (64, 64),
            },
            tools,
            outputs: OutputsConfig::default(),
            output_pulse_ms: DEFAULT_PULSE_MS,
            master_image_ref: None,
        }
    }

    struct Bench {
        _dir: TempDir,
        store: Arc<ProgramStore>,
        camera: SharedCamera,
        io: SimIoHandle,
        shared_io: SharedIo,
        diagnostics: Arc<Diagnostics>,
        events: broadcast::Receiver<ServerEvent>,
        program_id: i64,
    }

    // Creates a program with the given tools, registers `master`, and wires
    // the supplied (possibly pre-configured) camera.
    fn bench(tools: Vec<ToolConfig>, master: Option<&RgbImage>,
             camera: ImageCamera) -> Bench {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ProgramStore::new(dir.path()).unwrap());
        let program = store.create(base_program(tools)).unwrap();
        if let Some(master) = master {
            let upload = encode_lossless(master).unwrap();
            store.write_master(program.id, &upload).unwrap();
        }
        let camera: SharedCamera =
            Arc::new(tokio::sync::Mutex::new(Box::new(camera)));
        let io = SimIoHandle::new();
        let shared_io: SharedIo = Arc::new(Mutex::new(io.backend()));
        let (sender, events) = broadcast::channel(64);
        let diagnostics =
            Arc::new(Diagnostics::new(sender, Arc::new(SystemClock)));
        Bench {
            _dir: dir,
            store,
            camera,
            io,
            shared_io,
            diagnostics,
            events,
            program_id: program.id,
        }
    }

    async fn arm(bench: &Bench) -> Result<ArmedEngine, CanonicalError> {
        ArmedEngine::arm(bench.program_id, &bench.store,
                         bench.camera.clone(), bench.shared_io.clone(),
                         bench.diagnostics.clone()).await
    }

    #[tokio::test]
    async fn test_self_match_cycle_is_ok() {
        let master = square_image(24, 24);
        let roi = argus_elements::types::Roi::new(24, 24, 16, 16);
        let bench_ = bench(vec![area_tool(1, roi)], Some(&master),
                           ImageCamera::new(master.clone()));
        let mut engine = arm(&bench_).await.unwrap();

        let result = engine.run_cycle(TriggerSource::Manual).await;
        assert_eq!(result.cycle_seq, 1);
        assert_eq!(result.overall, Verdict::Ok);
        assert_eq!(result.tool_results.len(), 1);
        assert_eq!(result.tool_results[0].status, ToolStatus::Ok);
        approx::assert_abs_diff_eq!(result.tool_results[0].rate, 100.0,
                                    epsilon = 1e-9);

        // BUSY bracketed the cycle: asserted once, deasserted once, low now.
        bench_.io.with(|sim| {
            assert!(!sim.output(OutputLine::BUSY));
            assert_eq!(sim.write_count(OutputLine::BUSY), 2);
            // OK pulsed once at the configured width; NG untouched.
            let ok_pulses = sim.pulses(OutputLine::OK_PULSE);
            assert_eq!(ok_pulses.len(), 1);
            assert_eq!(ok_pulses[0].width,
                       Duration::from_millis(DEFAULT_PULSE_MS));
            assert!(sim.pulses(OutputLine::NG_PULSE).is_empty());
        });

        // Stage times account for the whole cycle.
        let stage_sum: f64 = result.per_stage_ms.values().sum();
        assert!((stage_sum - result.processing_time_ms).abs() <= 2.0);

        let second = engine.run_cycle(TriggerSource::Manual).await;
        assert_eq!(second.cycle_seq, 2);
    }

    #[tokio::test]
    async fn test_missing_feature_cycle_is_ng() {
        let master = square_image(24, 24);
        let roi = argus_elements::types::Roi::new(24, 24, 16, 16);
        let blank = RgbImage::from_pixel(64, 64, Rgb([128, 128, 128]));
        let bench_ = bench(vec![area_tool(1, roi)], Some(&master),
                           ImageCamera::new(blank));
        let mut engine = arm(&bench_).await.unwrap();

        let result = engine.run_cycle(TriggerSource::Manual).await;
        assert_eq!(result.overall, Verdict::Ng);
        assert_eq!(result.tool_results[0].status, ToolStatus::Ng);
        bench_.io.with(|sim| {
            assert_eq!(sim.pulses(OutputLine::NG_PULSE).len(), 1);
            assert!(sim.pulses(OutputLine::OK_PULSE).is_empty());
        });
    }

    #[tokio::test]
    async fn test_arm_without_master_is_program_not_ready() {
        let roi = argus_elements::types::Roi::new(24, 24, 16, 16);
        let blank = RgbImage::from_pixel(64, 64, Rgb([128, 128, 128]));
        let bench_ = bench(vec![area_tool(1, roi)], None,
                           ImageCamera::new(blank));

        let error = arm(&bench_).await.err().unwrap();
        assert!(matches!(
            error.code,
            canonical_error::CanonicalErrorCode::FailedPrecondition));
        // No cycle ran, no statistics changed.
        assert_eq!(bench_.store.statistics(bench_.program_id).unwrap().total,
                   0);
    }

    #[tokio::test]
    async fn test_unarmed_tool_reports_error_not_ng() {
        // Tool 2's ROI sees only the gray field: zero pixels at threshold
        // 200, so extraction fails and the tool is carried unarmed.
        let master = square_image(24, 24);
        let bench_ = bench(
            vec![area_tool(1, argus_elements::types::Roi::new(24, 24, 16, 16)),
                 area_tool(2, argus_elements::types::Roi::new(0, 0, 16, 16))],
            Some(&master), ImageCamera::new(master.clone()));
        let mut engine = arm(&bench_).await.unwrap();

        let result = engine.run_cycle(TriggerSource::Manual).await;
        assert_eq!(result.overall, Verdict::Ng);
        assert_eq!(result.tool_results[0].status, ToolStatus::Ok);
        assert_eq!(result.tool_results[1].status, ToolStatus::Error);
        assert_eq!(result.tool_results[1].aux.message.as_deref(),
                   Some("unarmed"));
    }

    #[tokio::test]
    async fn test_all_tools_unarmed_fails_arming() {
        let master = square_image(24, 24);
        let bench_ = bench(
            vec![area_tool(1, argus_elements::types::Roi::new(0, 0, 16, 16))],
            Some(&master), ImageCamera::new(master.clone()));
        let error = arm(&bench_).await.err().unwrap();
        assert!(matches!(
            error.code,
            canonical_error::CanonicalErrorCode::FailedPrecondition));
    }

    #[tokio::test]
    async fn test_position_offset_recovers_shifted_part() {
        let master = square_image(24, 24);
        let position = ToolConfig {
            id: 9,
            kind: ToolKind::PositionAdjust,
            roi: argus_elements::types::Roi::new(0, 0, 64, 64),
            threshold: 70.0,
            upper_limit: None,
            params: ToolParams {
                search_margin: Some(8),
                ..Default::default()
            },
        };
        let area = area_tool(1, argus_elements::types::Roi::new(24, 24, 16, 16));
        let shifted = square_image(28, 28);
        let bench_ = bench(vec![position, area], Some(&master),
                           ImageCamera::new(shifted));
        let mut engine = arm(&bench_).await.unwrap();

        let result = engine.run_cycle(TriggerSource::Manual).await;
        assert_eq!(result.overall, Verdict::Ok);
        let position_result = &result.tool_results[0];
        assert_eq!(position_result.kind, ToolKind::PositionAdjust);
        assert_eq!(position_result.aux.offset, Some((4, 4)));
        let area_result = &result.tool_results[1];
        approx::assert_abs_diff_eq!(area_result.rate, 100.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_offset_pushing_roi_off_image_is_tool_error() {
        let master = square_image(24, 24);
        let position = ToolConfig {
            id: 9,
            kind: ToolKind::PositionAdjust,
            roi: argus_elements::types::Roi::new(0, 0, 64, 64),
            threshold: 70.0,
            upper_limit: None,
            params: ToolParams {
                search_margin: Some(8),
                ..Default::default()
            },
        };
        // Tool 1 follows the part; tool 2 hugs the bottom-right corner and
        // has no room to shift.
        let tools = vec![
            position,
            area_tool(1, argus_elements::types::Roi::new(24, 24, 16, 16)),
            ToolConfig {
                params: ToolParams {
                    threshold_override: Some(100),
                    ..Default::default()
                },
                threshold: 0.0,
                upper_limit: None,
                ..area_tool(2, argus_elements::types::Roi::new(48, 48, 16, 16))
            },
        ];
        let shifted = square_image(28, 28);
        let bench_ = bench(tools, Some(&master), ImageCamera::new(shifted));
        let mut engine = arm(&bench_).await.unwrap();

        let result = engine.run_cycle(TriggerSource::Manual).await;
        // The corner tool cannot follow the +4/+4 offset; it errors and the
        // cycle aggregates NG while the in-bounds tool still evaluated.
        assert_eq!(result.overall, Verdict::Ng);
        assert_eq!(result.tool_results[1].status, ToolStatus::Ok);
        assert_eq!(result.tool_results[2].status, ToolStatus::Error);
    }

    #[tokio::test]
    async fn test_capture_failures_accumulate() {
        let master = square_image(24, 24);
        let roi = argus_elements::types::Roi::new(24, 24, 16, 16);
        let mut camera = ImageCamera::new(master.clone());
        camera.fail_next_captures(3);
        let bench_ = bench(vec![area_tool(1, roi)], Some(&master), camera);
        let mut engine = arm(&bench_).await.unwrap();

        for expected in 1..=3_u32 {
            let result = engine.run_cycle(TriggerSource::Manual).await;
            assert_eq!(result.overall, Verdict::Ng);
            assert!(result.tool_results.is_empty());
            assert!(result.error.is_some());
            assert_eq!(engine.consecutive_capture_failures(), expected);
        }
        // Recovery resets the streak.
        let result = engine.run_cycle(TriggerSource::Manual).await;
        assert_eq!(result.overall, Verdict::Ok);
        assert_eq!(engine.consecutive_capture_failures(), 0);
    }

    #[tokio::test]
    async fn test_first_cycle_quality_warning_fires_once() {
        let master = RgbImage::from_pixel(64, 64, Rgb([200, 200, 200]));
        let dark = RgbImage::from_pixel(64, 64, Rgb([100, 100, 100]));
        let mut tool = area_tool(
            1, argus_elements::types::Roi::new(24, 24, 16, 16));
        tool.params.threshold_override = Some(150);
        let bench_ = bench(vec![tool], Some(&master), ImageCamera::new(dark));
        let mut engine = arm(&bench_).await.unwrap();

        let mut events = bench_.events;
        engine.run_cycle(TriggerSource::Manual).await;
        let mut quality_warnings = 0;
        while let Ok(event) = events.try_recv() {
            if let ServerEvent::Warning { kind, .. } = event {
                if kind == WarningKind::QualityWarning {
                    quality_warnings += 1;
                }
            }
        }
        assert!(quality_warnings > 0);

        engine.run_cycle(TriggerSource::Manual).await;
        while let Ok(event) = events.try_recv() {
            if let ServerEvent::Warning { kind, .. } = event {
                assert_ne!(kind, WarningKind::QualityWarning);
            }
        }
    }

    #[tokio::test]
    async fn test_bound_outputs_follow_verdict() {
        let master = square_image(24, 24);
        let roi = argus_elements::types::Roi::new(24, 24, 16, 16);
        let bench_ = bench(vec![area_tool(1, roi)], Some(&master),
                           ImageCamera::new(master.clone()));
        // Rebind OUT4/OUT5 before arming.
        {
            let mut program = bench_.store.get(bench_.program_id).unwrap();
            program.outputs.out4 = OutputBinding::OkLevel;
            program.outputs.out5 = OutputBinding::NgLevel;
            program.outputs.out6 = OutputBinding::AlwaysOn;
            bench_.store.update(bench_.program_id, program).unwrap();
        }
        let mut engine = arm(&bench_).await.unwrap();
        engine.run_cycle(TriggerSource::Manual).await;

        bench_.io.with(|sim| {
            assert!(sim.output(OutputLine::Out4));
            assert!(!sim.output(OutputLine::Out5));
            assert!(sim.output(OutputLine::Out6));
            // Unused lines were never written.
            assert_eq!(sim.write_count(OutputLine::Out7), 0);
            assert_eq!(sim.write_count(OutputLine::Out8), 0);
        });
    }
}  // mod tests.
