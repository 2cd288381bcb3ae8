// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Smallest ROI edge accepted by program validation.
pub const MIN_ROI_DIM: u32 = 8;

// Upper bound on tools per program.
pub const MAX_TOOLS: usize = 16;

// Default width of the OK/NG verdict pulses on OUT2/OUT3.
pub const DEFAULT_PULSE_MS: u64 = 300;

// Axis-aligned rectangle in full-resolution image coordinates. `x`/`y` are
// signed so that a position offset can push a ROI off the image; such a ROI
// fails `fits_within()` and the owning tool reports ERROR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Roi {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Roi { x, y, w, h }
    }

    // The same rectangle translated by (dx, dy).
    pub fn offset(&self, dx: i32, dy: i32) -> Roi {
        Roi { x: self.x + dx, y: self.y + dy, w: self.w, h: self.h }
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x >= 0 && self.y >= 0 &&
            self.x as i64 + self.w as i64 <= width as i64 &&
            self.y as i64 + self.h as i64 <= height as i64
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x as f64 + self.w as f64 / 2.0,
         self.y as f64 + self.h as f64 / 2.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TriggerMode {
    // Periodic timer; period_ms must be within [1, 10000].
    Internal { period_ms: u64 },

    // Rising edge on the external trigger input, debounced. Edges closer
    // together than debounce_ms (within [0, 1000]) are ignored.
    External { debounce_ms: u64 },

    // Only explicit manual pulses from the operator surface.
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrightnessMode {
    Normal,
    Hdr,
    HighGain,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub brightness_mode: BrightnessMode,

    // Focus position, 0..=100. Interpretation is camera specific.
    pub focus: u32,

    // (width, height) of captured frames. The master image must match.
    pub resolution: (u32, u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Outline,
    Area,
    ColorArea,
    EdgeDetection,
    PositionAdjust,
}

// Kind-specific knobs. A flat optional bag rather than a per-kind enum so the
// wizard can round-trip partially-edited tools; fields that do not apply to a
// tool's kind are ignored by that tool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolParams {
    // Canny hysteresis thresholds (outline and edge_detection tools).
    pub canny_low: Option<f32>,
    pub canny_high: Option<f32>,

    // Area tool: when set, used instead of the Otsu threshold derived from
    // the master ROI.
    pub threshold_override: Option<u8>,

    // Color-area tolerances around the master medians. Hue is in degrees on
    // the half-circle scale (0..=90); saturation/value are 8-bit deltas.
    pub hue_tolerance: Option<f64>,
    pub saturation_tolerance: Option<f64>,
    pub value_tolerance: Option<f64>,

    // Position-adjust: how far beyond the template ROI to search, in pixels.
    pub search_margin: Option<u32>,
}

pub const DEFAULT_CANNY_LOW: f32 = 50.0;
pub const DEFAULT_CANNY_HIGH: f32 = 150.0;
pub const DEFAULT_HUE_TOLERANCE: f64 = 15.0;
pub const DEFAULT_SATURATION_TOLERANCE: f64 = 40.0;
pub const DEFAULT_VALUE_TOLERANCE: f64 = 40.0;
pub const DEFAULT_SEARCH_MARGIN: u32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    // Stable within the owning program.
    pub id: u32,

    pub kind: ToolKind,
    pub roi: Roi,

    // Lower bound on matching rate for OK, 0..=100. A threshold of zero on a
    // position_adjust tool opts that tool out of the overall verdict.
    pub threshold: f64,

    // When present, the OK window is [threshold, upper_limit].
    pub upper_limit: Option<f64>,

    #[serde(default)]
    pub params: ToolParams,
}

// Function assignable to the operator-bound output lines OUT4..OUT8. OUT1..3
// carry fixed wiring (BUSY, OK pulse, NG pulse) and are not bindable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputBinding {
    OkLevel,
    NgLevel,
    AlwaysOn,
    AlwaysOff,
    #[default]
    Unused,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputsConfig {
    pub out4: OutputBinding,
    pub out5: OutputBinding,
    pub out6: OutputBinding,
    pub out7: OutputBinding,
    pub out8: OutputBinding,
}

impl OutputsConfig {
    pub fn bindings(&self) -> [(u8, OutputBinding); 5] {
        [(4, self.out4), (5, self.out5), (6, self.out6),
         (7, self.out7), (8, self.out8)]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: i64,
    pub ok: i64,
    pub ng: i64,
    pub last_run_at: Option<DateTime<Utc>>,
}

fn default_pulse_ms() -> u64 {
    DEFAULT_PULSE_MS
}

// The full recipe for one inspection. The persisted record; the engine
// consumes this plus the master image file named by `master_image_ref`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Program {
    // Zero until the store assigns an id at create time.
    #[serde(default)]
    pub id: i64,

    pub name: String,
    pub trigger: TriggerMode,
    pub capture_settings: CaptureSettings,

    // Evaluation order. At most one position_adjust tool.
    pub tools: Vec<ToolConfig>,

    #[serde(default)]
    pub outputs: OutputsConfig,

    // Width of the OK/NG pulses on OUT2/OUT3.
    #[serde(default = "default_pulse_ms")]
    pub output_pulse_ms: u64,

    // Path of the persisted master image, relative to the data directory.
    // Required (and must resolve) before a program with tools can start.
    #[serde(default)]
    pub master_image_ref: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgramSummary {
    pub id: i64,
    pub name: String,
    pub trigger: TriggerMode,
    pub tool_count: usize,
    pub has_master: bool,
    pub statistics: Statistics,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl Program {
    pub fn position_tool(&self) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| t.kind == ToolKind::PositionAdjust)
    }

    pub fn detection_tools(&self) -> impl Iterator<Item = &ToolConfig> {
        self.tools.iter().filter(|t| t.kind != ToolKind::PositionAdjust)
    }

    // Full validation as performed by the API layer before a program record
    // is accepted. Returns one entry per offending field; empty means valid.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        let mut err = |field: &str, message: String| {
            errors.push(FieldError { field: field.to_string(), message });
        };

        if self.name.trim().is_empty() {
            err("name", "name must be non-empty".to_string());
        }
        match self.trigger {
            TriggerMode::Internal { period_ms } => {
                if !(1..=10000).contains(&period_ms) {
                    err("trigger.period_ms",
                        format!("period_ms {} outside [1, 10000]", period_ms));
                }
            }
            TriggerMode::External { debounce_ms } => {
                if debounce_ms > 1000 {
                    err("trigger.debounce_ms",
                        format!("debounce_ms {} outside [0, 1000]", debounce_ms));
                }
            }
            TriggerMode::Manual => (),
        }
        if self.capture_settings.focus > 100 {
            err("capture_settings.focus",
                format!("focus {} outside [0, 100]", self.capture_settings.focus));
        }
        let (res_w, res_h) = self.capture_settings.resolution;
        if res_w < MIN_ROI_DIM || res_h < MIN_ROI_DIM {
            err("capture_settings.resolution",
                format!("resolution {}x{} too small", res_w, res_h));
        }
        if !(1..=10000).contains(&self.output_pulse_ms) {
            err("output_pulse_ms",
                format!("output_pulse_ms {} outside [1, 10000]",
                        self.output_pulse_ms));
        }
        if self.tools.len() > MAX_TOOLS {
            err("tools", format!("{} tools exceeds limit of {}",
                                 self.tools.len(), MAX_TOOLS));
        }
        let position_count = self.tools.iter()
            .filter(|t| t.kind == ToolKind::PositionAdjust).count();
        if position_count > 1 {
            err("tools", format!("{} position_adjust tools; at most one allowed",
                                 position_count));
        }
        let mut seen_ids = std::collections::HashSet::new();
        for (index, tool) in self.tools.iter().enumerate() {
            let field = |suffix: &str| format!("tools[{}].{}", index, suffix);
            if !seen_ids.insert(tool.id) {
                errors.push(FieldError {
                    field: field("id"),
                    message: format!("duplicate tool id {}", tool.id),
                });
            }
            if tool.roi.w < MIN_ROI_DIM || tool.roi.h < MIN_ROI_DIM {
                errors.push(FieldError {
                    field: field("roi"),
                    message: format!("roi {}x{} smaller than minimum edge {}",
                                     tool.roi.w, tool.roi.h, MIN_ROI_DIM),
                });
            }
            if !tool.roi.fits_within(res_w, res_h) {
                errors.push(FieldError {
                    field: field("roi"),
                    message: format!(
                        "roi ({},{} {}x{}) exceeds resolution {}x{}",
                        tool.roi.x, tool.roi.y, tool.roi.w, tool.roi.h,
                        res_w, res_h),
                });
            }
            if !(0.0..=100.0).contains(&tool.threshold) {
                errors.push(FieldError {
                    field: field("threshold"),
                    message: format!("threshold {} outside [0, 100]", tool.threshold),
                });
            }
            if let Some(upper) = tool.upper_limit {
                if upper < tool.threshold || upper > 200.0 {
                    errors.push(FieldError {
                        field: field("upper_limit"),
                        message: format!("upper_limit {} outside [{}, 200]",
                                         upper, tool.threshold),
                    });
                }
            }
            let params = &tool.params;
            if let (Some(low), Some(high)) = (params.canny_low, params.canny_high) {
                if low >= high {
                    errors.push(FieldError {
                        field: field("params"),
                        message: format!("canny_low {} must be below canny_high {}",
                                         low, high),
                    });
                }
            }
            if let Some(hue) = params.hue_tolerance {
                if !(0.0..=90.0).contains(&hue) {
                    errors.push(FieldError {
                        field: field("params.hue_tolerance"),
                        message: format!("hue_tolerance {} outside [0, 90]", hue),
                    });
                }
            }
        }
        errors
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Internal,
    External,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ToolStatus {
    Ok,
    Ng,
    // Could not evaluate: unarmed tool, ROI pushed off the image, degenerate
    // master features. Distinct from NG on the wire, NG for the verdict.
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Ok,
    Ng,
}

// Diagnostic side-channel attached to each tool result. Fields are populated
// per tool kind; absent fields are omitted from the wire encoding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolAux {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<(i32, i32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_used: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_id: u32,
    pub kind: ToolKind,
    pub status: ToolStatus,
    pub rate: f64,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper_limit: Option<f64>,
    pub aux: ToolAux,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub program_id: i64,

    // Strictly increasing per run session; resets at each start.
    pub cycle_seq: u64,

    pub timestamp: DateTime<Utc>,
    pub trigger_source: TriggerSource,
    pub overall: Verdict,
    pub tool_results: Vec<ToolResult>,
    pub processing_time_ms: f64,
    pub per_stage_ms: BTreeMap<String, f64>,

    // Cycle-level failure (e.g. capture) when no tool could run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Arming,
    Running,
    Paused,
    Stopping,
    Fault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    QualityWarning,
    Degradation,
    SlowCycle,
    CameraUnhealthy,
    IoUnhealthy,
}

// Everything the runtime tells the outside world. Broadcast from the engine
// side; the WebSocket layer is the built-in subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    CycleResult { result: CycleResult },
    Warning {
        kind: WarningKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    State { program_id: i64, state: RunState },
    Error { code: String, message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Fault,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub camera: HealthStatus,
    pub io: HealthStatus,
    pub store: HealthStatus,
    pub overall: HealthStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_program() -> Program {
        Program {
            id: 0,
            name: "widget-top".to_string(),
            trigger: TriggerMode::Internal { period_ms: 100 },
            capture_settings: CaptureSettings {
                brightness_mode: BrightnessMode::Normal,
                focus: 50,
                resolution: (64, 64),
            },
            tools: vec![],
            outputs: OutputsConfig::default(),
            output_pulse_ms: DEFAULT_PULSE_MS,
            master_image_ref: None,
        }
    }

    fn area_tool(roi: Roi) -> ToolConfig {
        ToolConfig {
            id: 1,
            kind: ToolKind::Area,
            roi,
            threshold: 90.0,
            upper_limit: Some(110.0),
            params: ToolParams::default(),
        }
    }

    #[test]
    fn test_valid_program_passes() {
        let mut program = minimal_program();
        program.tools.push(area_tool(Roi::new(24, 24, 16, 16)));
        assert!(program.validate().is_empty());
    }

    #[test]
    fn test_corner_roi_boundary() {
        // (W-8, H-8, 8, 8) is the largest corner ROI; one pixel wider must
        // be rejected.
        let mut program = minimal_program();
        program.tools.push(area_tool(Roi::new(56, 56, 8, 8)));
        assert!(program.validate().is_empty());

        program.tools[0].roi = Roi::new(56, 56, 9, 8);
        let errors = program.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].field.contains("roi"));
    }

    #[test]
    fn test_two_position_tools_rejected() {
        let mut program = minimal_program();
        for id in 1..=2 {
            program.tools.push(ToolConfig {
                id,
                kind: ToolKind::PositionAdjust,
                roi: Roi::new(0, 0, 16, 16),
                threshold: 70.0,
                upper_limit: None,
                params: ToolParams::default(),
            });
        }
        assert!(program.validate().iter().any(
            |e| e.message.contains("position_adjust")));
    }

    #[test]
    fn test_trigger_ranges() {
        let mut program = minimal_program();
        program.trigger = TriggerMode::Internal { period_ms: 0 };
        assert!(!program.validate().is_empty());
        program.trigger = TriggerMode::External { debounce_ms: 1001 };
        assert!(!program.validate().is_empty());
        program.trigger = TriggerMode::External { debounce_ms: 0 };
        assert!(program.validate().is_empty());
    }

    #[test]
    fn test_upper_limit_window() {
        let mut program = minimal_program();
        let mut tool = area_tool(Roi::new(0, 0, 16, 16));
        tool.upper_limit = Some(80.0);  // Below threshold of 90.
        program.tools.push(tool);
        assert!(program.validate().iter().any(
            |e| e.field.contains("upper_limit")));
    }

    #[test]
    fn test_roi_offset_off_image() {
        let roi = Roi::new(24, 24, 16, 16);
        assert!(roi.fits_within(64, 64));
        assert!(roi.offset(4, 4).fits_within(64, 64));
        assert!(!roi.offset(30, 0).fits_within(64, 64));
        assert!(!roi.offset(-30, 0).fits_within(64, 64));
    }

    #[test]
    fn test_event_wire_format() {
        let event = ServerEvent::State { program_id: 3, state: RunState::Running };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json,
                   r#"{"type":"state","program_id":3,"state":"running"}"#);

        let event = ServerEvent::Warning {
            kind: WarningKind::SlowCycle,
            message: "cycle exceeded deadline".to_string(),
            detail: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"SLOW_CYCLE""#));
    }

    #[test]
    fn test_program_round_trips_through_json() {
        let mut program = minimal_program();
        program.tools.push(area_tool(Roi::new(24, 24, 16, 16)));
        program.master_image_ref = Some("masters/program_1.png".to_string());
        let json = serde_json::to_string(&program).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(back, program);
    }
}  // mod tests.
