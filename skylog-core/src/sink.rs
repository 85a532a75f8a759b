//! Outbound collaborators: flight persistence, live positions and alerts.
//!
//! Implementations must not block the caller for long: the server crate
//! hands work to background tasks and only reports whether the handoff
//! succeeded. Writes are keyed by operator and flight/alert id, so repeating
//! one is harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::types::*;

/// Completed and cancelled flight records.
pub trait FlightStore: Send {
    fn save_flight(&mut self, record: &FlightRecord) -> Result<()>;
}

/// Live position records for observers, one per operator.
pub trait LiveStore: Send {
    fn put_live(&mut self, position: &LivePosition) -> Result<()>;
    fn delete_live(&mut self, operator_id: &str) -> Result<()>;
}

/// Flight alerts. Called with the same alert id each time it changes.
pub trait AlertSink: Send {
    fn publish(&mut self, alert: &FlightAlert) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryState {
    pub flights: HashMap<String, FlightRecord>,
    pub live: HashMap<String, LivePosition>,
    pub alerts: HashMap<String, FlightAlert>,
    /// Every live position accepted, in order.
    pub uploads: Vec<LivePosition>,
    /// Every alert publication, in order.
    pub publications: Vec<FlightAlert>,
    /// Remaining live uploads to reject, for exercising retry paths.
    pub fail_uploads: u32,
}

/// Shared in-memory implementation of every sink. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject the next `n` live uploads.
    pub fn fail_next_uploads(&self, n: u32) {
        self.state().fail_uploads = n;
    }
}

impl FlightStore for MemoryStore {
    fn save_flight(&mut self, record: &FlightRecord) -> Result<()> {
        self.state().flights.insert(record.id.clone(), record.clone());
        Ok(())
    }
}

impl LiveStore for MemoryStore {
    fn put_live(&mut self, position: &LivePosition) -> Result<()> {
        let mut state = self.state();
        if state.fail_uploads > 0 {
            state.fail_uploads -= 1;
            return Err(SkylogError::Store("simulated upload failure".into()));
        }
        state.live.insert(position.operator_id.clone(), position.clone());
        state.uploads.push(position.clone());
        Ok(())
    }

    fn delete_live(&mut self, operator_id: &str) -> Result<()> {
        self.state().live.remove(operator_id);
        Ok(())
    }
}

impl AlertSink for MemoryStore {
    fn publish(&mut self, alert: &FlightAlert) -> Result<()> {
        let mut state = self.state();
        state.alerts.insert(alert.id.clone(), alert.clone());
        state.publications.push(alert.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Publishes each alert to several sinks. One failing sink does not stop the
/// others; the first error is returned.
#[derive(Default)]
pub struct AlertFanout {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl AlertFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl AlertSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AlertSink for AlertFanout {
    fn publish(&mut self, alert: &FlightAlert) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.publish(alert) {
                warn!(alert = %alert.id, "alert sink failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl FlightStore for NullSink {
    fn save_flight(&mut self, _record: &FlightRecord) -> Result<()> {
        Ok(())
    }
}

impl LiveStore for NullSink {
    fn put_live(&mut self, _position: &LivePosition) -> Result<()> {
        Ok(())
    }

    fn delete_live(&mut self, _operator_id: &str) -> Result<()> {
        Ok(())
    }
}

impl AlertSink for NullSink {
    fn publish(&mut self, _alert: &FlightAlert) -> Result<()> {
        Ok(())
    }
}
