// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use canonical_error::CanonicalError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

// The eight discrete output lines. OUT1..3 carry fixed wiring; OUT4..8 are
// operator bindable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputLine {
    Out1,
    Out2,
    Out3,
    Out4,
    Out5,
    Out6,
    Out7,
    Out8,
}

impl OutputLine {
    // Fixed wiring.
    pub const BUSY: OutputLine = OutputLine::Out1;
    pub const OK_PULSE: OutputLine = OutputLine::Out2;
    pub const NG_PULSE: OutputLine = OutputLine::Out3;

    pub fn operator_bound(&self) -> bool {
        !matches!(self, OutputLine::Out1 | OutputLine::Out2 | OutputLine::Out3)
    }

    pub fn from_index(index: u8) -> Option<OutputLine> {
        match index {
            1 => Some(OutputLine::Out1),
            2 => Some(OutputLine::Out2),
            3 => Some(OutputLine::Out3),
            4 => Some(OutputLine::Out4),
            5 => Some(OutputLine::Out5),
            6 => Some(OutputLine::Out6),
            7 => Some(OutputLine::Out7),
            8 => Some(OutputLine::Out8),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            OutputLine::Out1 => 1,
            OutputLine::Out2 => 2,
            OutputLine::Out3 => 3,
            OutputLine::Out4 => 4,
            OutputLine::Out5 => 5,
            OutputLine::Out6 => 6,
            OutputLine::Out7 => 7,
            OutputLine::Out8 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InputLine {
    In1,
    In2,
    In3,
    In4,
}

impl InputLine {
    // The designated external trigger input.
    pub const TRIGGER: InputLine = InputLine::In1;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
    Both,
}

#[derive(Clone, Copy, Debug)]
pub struct EdgeEvent {
    pub line: InputLine,

    // True for a low-to-high transition.
    pub rising: bool,

    pub at: Instant,
}

// Discrete digital I/O. Calls are fast (microseconds on real GPIO) and
// synchronous; pulse() schedules the trailing edge internally and returns
// without waiting for it. On platforms lacking physical GPIO a simulated
// backend accepts the same calls, reports success, and records the intended
// state for observability; that is not an error condition.
pub trait DigitalIoTrait: Send {
    fn read(&self, line: InputLine) -> Result<bool, CanonicalError>;

    fn write(&mut self, line: OutputLine, value: bool)
             -> Result<(), CanonicalError>;

    // Drives `line` high for `width`, then low. At most one pulse per line
    // may be outstanding; a second pulse restarts the width.
    fn pulse(&mut self, line: OutputLine, width: Duration)
             -> Result<(), CanonicalError>;

    // Edge events on `line` are delivered on the returned channel until the
    // receiver is dropped.
    fn subscribe(&mut self, line: InputLine, edge: EdgeKind)
                 -> Result<UnboundedReceiver<EdgeEvent>, CanonicalError>;
}
