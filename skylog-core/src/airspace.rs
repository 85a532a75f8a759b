//! Airspace violation tracking: zone entry/exit and the per-flight alert.
//!
//! Each zone the pilot is inside has exactly one in-progress entry, keyed by
//! zone id. Leaving a zone closes that zone's entry and nothing else, so
//! overlapping zones are tracked independently. All entries of a flight are
//! gathered into a single `FlightAlert` that is created on the first
//! violation and updated in place until the flight ends.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};
use uuid::Uuid;

use crate::geo::point_in_polygon;
use crate::types::*;

/// Zone entry/exit notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum AirspaceEvent {
    Entered {
        zone_id: String,
        zone_name: String,
        altitude: f64,
        timestamp: f64,
    },
    Exited {
        zone_id: String,
        zone_name: String,
        timestamp: f64,
        duration_sec: f64,
    },
}

/// Result of feeding one fix to the tracker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AirspaceUpdate {
    pub events: Vec<AirspaceEvent>,
    /// The flight alert was created or modified by this fix.
    pub alert_changed: bool,
}

/// Does `zone` contain this fix, horizontally and vertically?
pub fn zone_contains(zone: &AirspaceZone, point: &TrackPoint) -> bool {
    let pos = point.position();
    zone.bbox.contains(pos)
        && point.altitude >= zone.lower_m
        && point.altitude <= zone.upper_m
        && point_in_polygon(pos, &zone.polygon)
}

/// Per-flight zone occupancy and violation history.
#[derive(Debug, Clone)]
pub struct AirspaceTracker {
    zones: Vec<AirspaceZone>,
    operator_id: String,
    flight_id: Option<String>,
    /// zone id -> index of its in-progress entry in `history`
    active: HashMap<String, usize>,
    history: Vec<ViolationEntry>,
    alert: Option<FlightAlert>,
    last_point: Option<TrackPoint>,
}

impl AirspaceTracker {
    pub fn new(zones: Vec<AirspaceZone>, operator_id: &str) -> Self {
        AirspaceTracker {
            zones,
            operator_id: operator_id.to_string(),
            flight_id: None,
            active: HashMap::new(),
            history: Vec::new(),
            alert: None,
            last_point: None,
        }
    }

    pub fn zones(&self) -> &[AirspaceZone] {
        &self.zones
    }

    /// Attach subsequent violations to this flight.
    pub fn begin_flight(&mut self, flight_id: &str) {
        self.flight_id = Some(flight_id.to_string());
    }

    /// Zones whose polygon and altitude band both contain the fix.
    pub fn zones_containing(&self, point: &TrackPoint) -> Vec<&AirspaceZone> {
        self.zones.iter().filter(|z| zone_contains(z, point)).collect()
    }

    pub fn update(&mut self, point: &TrackPoint) -> AirspaceUpdate {
        let mut update = AirspaceUpdate::default();
        if !point.is_valid() {
            return update;
        }
        self.last_point = Some(point.clone());

        let inside: Vec<(String, String)> = self
            .zones_containing(point)
            .into_iter()
            .map(|z| (z.id.clone(), z.name.clone()))
            .collect();
        let occupied: HashSet<&str> = inside.iter().map(|(id, _)| id.as_str()).collect();

        // Entries
        for (zone_id, zone_name) in &inside {
            if self.active.contains_key(zone_id) {
                continue;
            }
            info!(zone = %zone_id, "entered {zone_name} at {:.0} m", point.altitude);
            self.history.push(ViolationEntry {
                zone_id: zone_id.clone(),
                zone_name: zone_name.clone(),
                entry_time: point.timestamp,
                entry_position: point.position(),
                entry_altitude: point.altitude,
                exit_time: None,
                exit_position: None,
                exit_altitude: None,
                duration_sec: None,
                status: ViolationStatus::InProgress,
            });
            self.active.insert(zone_id.clone(), self.history.len() - 1);
            update.events.push(AirspaceEvent::Entered {
                zone_id: zone_id.clone(),
                zone_name: zone_name.clone(),
                altitude: point.altitude,
                timestamp: point.timestamp,
            });
        }

        // Exits, only for zones no longer occupied
        let mut left: Vec<(String, usize)> = self
            .active
            .iter()
            .filter(|(id, _)| !occupied.contains(id.as_str()))
            .map(|(id, idx)| (id.clone(), *idx))
            .collect();
        left.sort_by_key(|(_, idx)| *idx);
        for (zone_id, idx) in left {
            self.active.remove(&zone_id);
            let entry = &mut self.history[idx];
            close_entry(entry, point);
            info!(zone = %zone_id, "left {}", entry.zone_name);
            update.events.push(AirspaceEvent::Exited {
                zone_id,
                zone_name: entry.zone_name.clone(),
                timestamp: point.timestamp,
                duration_sec: entry.duration_sec.unwrap_or(0.0),
            });
        }

        if !update.events.is_empty() {
            self.refresh_alert(point.timestamp);
            update.alert_changed = true;
        }
        update
    }

    /// Close anything still open at the last known fix, hand back the final
    /// alert, and clear all per-flight state.
    pub fn end_flight(&mut self) -> Option<FlightAlert> {
        if let Some(point) = self.last_point.take() {
            let mut open: Vec<usize> = self.active.values().copied().collect();
            open.sort_unstable();
            for idx in open {
                close_entry(&mut self.history[idx], &point);
                debug!(zone = %self.history[idx].zone_id, "closed at flight end");
            }
            self.active.clear();
            if self.alert.is_some() {
                self.refresh_alert(point.timestamp);
            }
        }

        let alert = self.alert.take();
        self.history.clear();
        self.flight_id = None;
        alert
    }

    pub fn alert(&self) -> Option<&FlightAlert> {
        self.alert.as_ref()
    }

    pub fn history(&self) -> &[ViolationEntry] {
        &self.history
    }

    /// Zone ids currently occupied, in entry order.
    pub fn active_zone_ids(&self) -> Vec<&str> {
        let mut ids: Vec<(&str, usize)> =
            self.active.iter().map(|(id, idx)| (id.as_str(), *idx)).collect();
        ids.sort_by_key(|(_, idx)| *idx);
        ids.into_iter().map(|(id, _)| id).collect()
    }

    pub fn any_active(&self) -> bool {
        !self.active.is_empty()
    }

    fn refresh_alert(&mut self, timestamp: f64) {
        let any_active = !self.active.is_empty();
        match &mut self.alert {
            Some(alert) => {
                alert.violations = self.history.clone();
                alert.any_active = any_active;
                alert.updated_at = timestamp;
            }
            None => {
                self.alert = Some(FlightAlert {
                    id: Uuid::new_v4().to_string(),
                    operator_id: self.operator_id.clone(),
                    flight_id: self.flight_id.clone(),
                    violations: self.history.clone(),
                    any_active,
                    created_at: timestamp,
                    updated_at: timestamp,
                });
            }
        }
    }
}

fn close_entry(entry: &mut ViolationEntry, point: &TrackPoint) {
    entry.exit_time = Some(point.timestamp);
    entry.exit_position = Some(point.position());
    entry.exit_altitude = Some(point.altitude);
    entry.duration_sec = Some(point.timestamp - entry.entry_time);
    entry.status = ViolationStatus::Completed;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
