// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Terminal stop for completed cycles: durable append (with statistics folded
// in transactionally by the store), then a fire-and-forget broadcast to
// whoever is listening. A slow or absent subscriber never back-pressures the
// engine; broadcast receivers that fall behind simply lag.

use std::sync::Arc;

use canonical_error::CanonicalError;
use log::warn;
use tokio::sync::broadcast;

use argus_elements::types::{CycleResult, ServerEvent};

use crate::program_store::ProgramStore;

pub struct ResultSink {
    store: Arc<ProgramStore>,
    events: broadcast::Sender<ServerEvent>,
}

impl ResultSink {
    pub fn new(store: Arc<ProgramStore>,
               events: broadcast::Sender<ServerEvent>) -> Self {
        ResultSink { store, events }
    }

    // Persists the result, retrying once, then broadcasts it. A second
    // persistence failure propagates so the run can transition to FAULT
    // rather than silently losing inspection history. Outputs have already
    // been driven by the time this is called, so any subscriber that
    // observes the event can rely on the lines being settled.
    pub fn append(&self, result: CycleResult) -> Result<(), CanonicalError> {
        if let Err(first) = self.store.append_result(&result) {
            warn!("Cycle result append failed, retrying once: {}", first);
            self.store.append_result(&result)?;
        }
        let _ = self.events.send(ServerEvent::CycleResult { result });
        Ok(())
    }

    pub fn recent(&self, program_id: i64, limit: usize)
                  -> Result<Vec<CycleResult>, CanonicalError> {
        self.store.recent(program_id, limit)
    }
}

// mod tests.
