//! Throttled live position publishing.
//!
//! A position goes out when enough time has passed since the last successful
//! upload or the pilot has moved far enough from it, whichever comes first.
//! A failed upload leaves the marker where it was, so the next eligible fix
//! tries again.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geo::distance_m;
use crate::sink::LiveStore;
use crate::types::*;

pub const MIN_UPLOAD_INTERVAL_SEC: f64 = 12.0;
pub const MIN_UPLOAD_DISTANCE_M: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub min_interval_sec: f64,
    pub min_distance_m: f64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            min_interval_sec: MIN_UPLOAD_INTERVAL_SEC,
            min_distance_m: MIN_UPLOAD_DISTANCE_M,
        }
    }
}

/// What happened to one offered fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Uploaded,
    Throttled,
    Failed,
    /// No flight registered.
    Inactive,
}

#[derive(Debug, Clone)]
pub struct PositionBroadcaster {
    pub config: BroadcastConfig,
    operator_id: String,
    flight_id: Option<String>,
    last_uploaded: Option<TrackPoint>,

    // Counters
    pub uploads: u64,
    pub throttled: u64,
    pub failures: u64,
}

impl PositionBroadcaster {
    pub fn new(operator_id: &str, config: BroadcastConfig) -> Self {
        PositionBroadcaster {
            config,
            operator_id: operator_id.to_string(),
            flight_id: None,
            last_uploaded: None,
            uploads: 0,
            throttled: 0,
            failures: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.flight_id.is_some()
    }

    /// Register the live record for a new flight and publish its first fix.
    pub fn start(
        &mut self,
        flight_id: &str,
        point: &TrackPoint,
        store: &mut dyn LiveStore,
    ) -> BroadcastOutcome {
        self.flight_id = Some(flight_id.to_string());
        self.last_uploaded = None;
        self.offer(point, store)
    }

    /// Remove the live record. Observers only see operators in the air.
    pub fn stop(&mut self, store: &mut dyn LiveStore) {
        if self.flight_id.take().is_none() {
            return;
        }
        self.last_uploaded = None;
        if let Err(e) = store.delete_live(&self.operator_id) {
            warn!(operator = %self.operator_id, "failed to delete live record: {e}");
        }
    }

    /// Would this fix be uploaded right now?
    pub fn should_upload(&self, point: &TrackPoint) -> bool {
        match &self.last_uploaded {
            None => true,
            Some(last) => {
                point.timestamp - last.timestamp >= self.config.min_interval_sec
                    || distance_m(last.position(), point.position()) >= self.config.min_distance_m
            }
        }
    }

    pub fn offer(&mut self, point: &TrackPoint, store: &mut dyn LiveStore) -> BroadcastOutcome {
        let flight_id = match &self.flight_id {
            Some(id) => id.clone(),
            None => return BroadcastOutcome::Inactive,
        };
        if !self.should_upload(point) {
            self.throttled += 1;
            return BroadcastOutcome::Throttled;
        }

        let live = LivePosition {
            operator_id: self.operator_id.clone(),
            flight_id,
            lat: point.lat,
            lon: point.lon,
            altitude: point.altitude,
            speed: point.speed,
            heading: point.heading,
            timestamp: point.timestamp,
        };
        match store.put_live(&live) {
            Ok(()) => {
                self.uploads += 1;
                self.last_uploaded = Some(point.clone());
                debug!(operator = %self.operator_id, "live position uploaded");
                BroadcastOutcome::Uploaded
            }
            Err(e) => {
                self.failures += 1;
                warn!(operator = %self.operator_id, "live upload failed, will retry: {e}");
                BroadcastOutcome::Failed
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
