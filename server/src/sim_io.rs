// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Digital I/O backend for platforms without physical GPIO. All commanded
// state is recorded so the operator surface (and tests) can observe what the
// appliance would have driven; input edges are injected rather than sensed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, unavailable_error};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use argus_elements::io_trait::{DigitalIoTrait, EdgeEvent, EdgeKind, InputLine,
                               OutputLine};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordedPulse {
    pub line: OutputLine,
    pub width: Duration,
    pub at: Instant,
}

pub struct SimDigitalIo {
    outputs: HashMap<OutputLine, bool>,
    inputs: HashMap<InputLine, bool>,
    pulses: Vec<RecordedPulse>,
    write_log: Vec<(OutputLine, bool)>,
    subscribers: Vec<(InputLine, EdgeKind, UnboundedSender<EdgeEvent>)>,

    // Test hook: when set, write() and pulse() report Unavailable.
    fail_writes: bool,
}

impl SimDigitalIo {
    pub fn new() -> Self {
        SimDigitalIo {
            outputs: HashMap::new(),
            inputs: HashMap::new(),
            pulses: Vec::new(),
            write_log: Vec::new(),
            subscribers: Vec::new(),
            fail_writes: false,
        }
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    // Current commanded level of an output line.
    pub fn output(&self, line: OutputLine) -> bool {
        *self.outputs.get(&line).unwrap_or(&false)
    }

    pub fn pulses(&self, line: OutputLine) -> Vec<RecordedPulse> {
        self.pulses.iter().filter(|p| p.line == line).copied().collect()
    }

    pub fn write_count(&self, line: OutputLine) -> usize {
        self.write_log.iter().filter(|(l, _)| *l == line).count()
    }

    // Drives an input level, synthesizing edge events for subscribers.
    pub fn inject_input(&mut self, line: InputLine, value: bool) {
        let previous = *self.inputs.get(&line).unwrap_or(&false);
        self.inputs.insert(line, value);
        if previous == value {
            return;
        }
        let event = EdgeEvent { line, rising: value, at: Instant::now() };
        self.subscribers.retain(|(subscribed_line, edge, sender)| {
            if *subscribed_line != line {
                return true;
            }
            let wanted = match edge {
                EdgeKind::Rising => value,
                EdgeKind::Falling => !value,
                EdgeKind::Both => true,
            };
            if !wanted {
                return true;
            }
            // Drop subscriptions whose receiver has gone away.
            sender.send(event).is_ok()
        });
    }
}

impl Default for SimDigitalIo {
    fn default() -> Self {
        Self::new()
    }
}

// Shareable view of one SimDigitalIo: the engine drives it through the
// DigitalIoTrait backend while the operator surface (and tests) observe the
// recorded state through the handle.
#[derive(Clone)]
pub struct SimIoHandle(Arc<StdMutex<SimDigitalIo>>);

impl SimIoHandle {
    pub fn new() -> Self {
        SimIoHandle(Arc::new(StdMutex::new(SimDigitalIo::new())))
    }

    pub fn backend(&self) -> Box<dyn DigitalIoTrait + Send> {
        Box::new(SimIoBackend(self.0.clone()))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimDigitalIo) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }
}

impl Default for SimIoHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct SimIoBackend(Arc<StdMutex<SimDigitalIo>>);

impl DigitalIoTrait for SimIoBackend {
    fn read(&self, line: InputLine) -> Result<bool, CanonicalError> {
        self.0.lock().unwrap().read(line)
    }

    fn write(&mut self, line: OutputLine, value: bool)
             -> Result<(), CanonicalError> {
        self.0.lock().unwrap().write(line, value)
    }

    fn pulse(&mut self, line: OutputLine, width: Duration)
             -> Result<(), CanonicalError> {
        self.0.lock().unwrap().pulse(line, width)
    }

    fn subscribe(&mut self, line: InputLine, edge: EdgeKind)
                 -> Result<UnboundedReceiver<EdgeEvent>, CanonicalError> {
        self.0.lock().unwrap().subscribe(line, edge)
    }
}

impl DigitalIoTrait for SimDigitalIo {
    fn read(&self, line: InputLine) -> Result<bool, CanonicalError> {
        Ok(*self.inputs.get(&line).unwrap_or(&false))
    }

    fn write(&mut self, line: OutputLine, value: bool)
             -> Result<(), CanonicalError> {
        if self.fail_writes {
            return Err(unavailable_error("simulated write failure"));
        }
        self.outputs.insert(line, value);
        self.write_log.push((line, value));
        Ok(())
    }

    fn pulse(&mut self, line: OutputLine, width: Duration)
             -> Result<(), CanonicalError> {
        if self.fail_writes {
            return Err(unavailable_error("simulated write failure"));
        }
        self.pulses.push(RecordedPulse { line, width, at: Instant::now() });
        Ok(())
    }

    fn subscribe(&mut self, line: InputLine, edge: EdgeKind)
                 -> Result<UnboundedReceiver<EdgeEvent>, CanonicalError> {
        let (sender, receiver) = unbounded_channel();
        self.subscribers.push((line, edge, sender));
        Ok(receiver)
    }
}

// mod tests.
