//! Flight phase state machine: takeoff and landing from a stream of fixes.
//!
//! Pure logic, no I/O. Feed fixes in arrival order with `update()` and get
//! back at most one `PhaseEvent` per fix.
//!
//! ```text
//! Grounded --speed > takeoff--> Airborne --slow & gentle--> LandingConfirming
//!                                  ^                              |
//!                                  +------- condition broken -----+
//!                                  LandingConfirming --held for window--> Completed
//! ```
//!
//! Takeoff fires on a single fast sample. Landing needs the slow, gentle
//! condition held for the whole confirmation window. The window runs on
//! sample timestamps, so a replayed tracklog classifies exactly like the
//! live stream did.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::distance_m;
use crate::types::TrackPoint;

pub const TAKEOFF_SPEED_MS: f64 = 2.0;
pub const LANDING_SPEED_MS: f64 = 1.0;
pub const LANDING_DESCENT_MS: f64 = 2.0;
pub const CONFIRMATION_WINDOW_SEC: f64 = 5.0;

/// Detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Horizontal speed above which a grounded pilot is airborne (m/s).
    pub takeoff_speed_ms: f64,
    /// Horizontal speed below which landing confirmation may begin (m/s).
    pub landing_speed_ms: f64,
    /// Descent rate below which landing confirmation may begin (m/s).
    pub landing_descent_ms: f64,
    /// How long the landing condition must hold (s).
    pub confirmation_window_sec: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            takeoff_speed_ms: TAKEOFF_SPEED_MS,
            landing_speed_ms: LANDING_SPEED_MS,
            landing_descent_ms: LANDING_DESCENT_MS,
            confirmation_window_sec: CONFIRMATION_WINDOW_SEC,
        }
    }
}

// ---------------------------------------------------------------------------
// Phases and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightPhase {
    Grounded,
    Airborne,
    LandingConfirming,
    Completed,
    Cancelled,
}

impl FlightPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlightPhase::Grounded => "grounded",
            FlightPhase::Airborne => "airborne",
            FlightPhase::LandingConfirming => "landing_confirming",
            FlightPhase::Completed => "completed",
            FlightPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_flying(&self) -> bool {
        matches!(self, FlightPhase::Airborne | FlightPhase::LandingConfirming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEventKind {
    Takeoff,
    Landing,
}

/// One phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub kind: PhaseEventKind,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    pub timestamp: f64,
}

impl PhaseEvent {
    fn at(kind: PhaseEventKind, p: &TrackPoint) -> Self {
        PhaseEvent {
            kind,
            lat: p.lat,
            lon: p.lon,
            altitude: p.altitude,
            timestamp: p.timestamp,
        }
    }
}

/// Horizontal speed and vertical speed used for one decision.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Kinematics {
    pub speed: f64,
    pub vertical_speed: f64,
}

impl Kinematics {
    /// Sink rate, zero while climbing.
    pub fn descent_rate(&self) -> f64 {
        (-self.vertical_speed).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateful takeoff/landing classifier for one operator's fix stream.
#[derive(Debug, Clone)]
pub struct FlightPhaseDetector {
    pub config: DetectorConfig,
    phase: FlightPhase,
    confirm_since: Option<f64>,
    prev: Option<TrackPoint>,
    last: Kinematics,

    // Counters
    pub points_processed: u64,
    pub points_skipped: u64,
}

impl FlightPhaseDetector {
    pub fn new(config: DetectorConfig) -> Self {
        FlightPhaseDetector {
            config,
            phase: FlightPhase::Grounded,
            confirm_since: None,
            prev: None,
            last: Kinematics::default(),
            points_processed: 0,
            points_skipped: 0,
        }
    }

    pub fn phase(&self) -> FlightPhase {
        self.phase
    }

    /// Kinematics used for the most recent accepted fix.
    pub fn last_kinematics(&self) -> Kinematics {
        self.last
    }

    /// Process one fix. Returns the transition it caused, if any.
    pub fn update(&mut self, point: &TrackPoint) -> Option<PhaseEvent> {
        if !point.is_valid() {
            self.points_skipped += 1;
            debug!(timestamp = point.timestamp, "detector skipping malformed fix");
            return None;
        }
        self.points_processed += 1;

        let kin = self.kinematics(point);
        self.prev = Some(point.clone());

        match self.phase {
            FlightPhase::Cancelled => {
                // Re-arm only once the pilot has been seen slow again
                if kin.speed <= self.config.takeoff_speed_ms {
                    self.phase = FlightPhase::Grounded;
                }
                None
            }
            FlightPhase::Grounded | FlightPhase::Completed => {
                self.phase = FlightPhase::Grounded;
                if kin.speed > self.config.takeoff_speed_ms {
                    self.phase = FlightPhase::Airborne;
                    self.confirm_since = None;
                    debug!(speed = kin.speed, "takeoff at {:.0}", point.timestamp);
                    return Some(PhaseEvent::at(PhaseEventKind::Takeoff, point));
                }
                None
            }
            FlightPhase::Airborne | FlightPhase::LandingConfirming => {
                if !self.landing_condition(&kin) {
                    if self.phase == FlightPhase::LandingConfirming {
                        debug!(speed = kin.speed, "landing confirmation reset");
                    }
                    self.phase = FlightPhase::Airborne;
                    self.confirm_since = None;
                    return None;
                }

                let since = *self.confirm_since.get_or_insert(point.timestamp);
                self.phase = FlightPhase::LandingConfirming;

                if point.timestamp - since >= self.config.confirmation_window_sec {
                    self.phase = FlightPhase::Completed;
                    self.confirm_since = None;
                    debug!("landing confirmed at {:.0}", point.timestamp);
                    return Some(PhaseEvent::at(PhaseEventKind::Landing, point));
                }
                None
            }
        }
    }

    /// Abandon the current flight. Points are ignored until the pilot is seen
    /// below takeoff speed.
    pub fn cancel(&mut self) {
        self.phase = FlightPhase::Cancelled;
        self.confirm_since = None;
    }

    /// Start over as a fresh session, forgetting the previous fix.
    pub fn reset(&mut self) {
        self.phase = FlightPhase::Grounded;
        self.confirm_since = None;
        self.prev = None;
        self.last = Kinematics::default();
    }

    /// Put the detector into flight without a detected takeoff.
    pub fn force_airborne(&mut self, point: &TrackPoint) {
        self.phase = FlightPhase::Airborne;
        self.confirm_since = None;
        if point.is_valid() {
            self.prev = Some(point.clone());
        }
    }

    fn landing_condition(&self, kin: &Kinematics) -> bool {
        kin.speed < self.config.landing_speed_ms
            && kin.descent_rate() < self.config.landing_descent_ms
    }

    /// Reported values where present and sane, otherwise derived from the
    /// previous fix. A zero or negative time step reuses the last estimate.
    fn kinematics(&mut self, point: &TrackPoint) -> Kinematics {
        let step = self
            .prev
            .as_ref()
            .map(|q| (q, point.timestamp - q.timestamp))
            .filter(|(_, dt)| *dt > 0.0);

        let speed = match point.speed.filter(|s| s.is_finite() && *s >= 0.0) {
            Some(s) => s,
            None => match step {
                Some((q, dt)) => distance_m(q.position(), point.position()) / dt,
                None => self.last.speed,
            },
        };

        let vertical_speed = match point.vertical_speed.filter(|v| v.is_finite()) {
            Some(v) => v,
            None => match step {
                Some((q, dt)) => (point.altitude - q.altitude) / dt,
                None => self.last.vertical_speed,
            },
        };

        self.last = Kinematics {
            speed,
            vertical_speed,
        };
        self.last
    }
}

impl Default for FlightPhaseDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

/// Classify a complete pre-recorded sequence. Uses a fresh detector, so the
/// result matches what live processing of the same fixes produced.
pub fn analyze_tracklog(points: &[TrackPoint], config: &DetectorConfig) -> Vec<PhaseEvent> {
    let mut detector = FlightPhaseDetector::new(config.clone());
    points.iter().filter_map(|p| detector.update(p)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
