//! Shared types, error enum, and flight/airspace records for skylog-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by skylog-core.
#[derive(Debug, Error)]
pub enum SkylogError {
    #[error("a flight is already in progress: {flight_id}")]
    AlreadyInFlight { flight_id: String },
    #[error("no active flight")]
    NoActiveFlight,
    #[error("invalid track point at {timestamp}")]
    InvalidPoint { timestamp: f64 },
    #[error("session is no longer running")]
    SessionClosed,
    #[error("store error: {0}")]
    Store(String),
    #[error("reference data error: {0}")]
    Reference(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SkylogError>;

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// A bare latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub const fn new(lat: f64, lon: f64) -> Self {
        LatLon { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// One timestamped GPS fix.
///
/// `speed` is horizontal ground speed in m/s, `vertical_speed` is m/s with
/// climb positive. Both are optional and derived from neighbouring fixes
/// when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub timestamp: f64,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

impl TrackPoint {
    pub fn new(timestamp: f64, lat: f64, lon: f64, altitude: f64) -> Self {
        TrackPoint {
            timestamp,
            lat,
            lon,
            altitude,
            speed: None,
            vertical_speed: None,
            heading: None,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_vertical_speed(mut self, vertical_speed: f64) -> Self {
        self.vertical_speed = Some(vertical_speed);
        self
    }

    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }

    /// Required fields are finite and coordinates are in range.
    pub fn is_valid(&self) -> bool {
        self.timestamp.is_finite() && self.altitude.is_finite() && self.position().is_valid()
    }
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    Takeoff,
    Landing,
}

impl std::fmt::Display for SiteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteKind::Takeoff => write!(f, "Takeoff"),
            SiteKind::Landing => write!(f, "Landing"),
        }
    }
}

/// A named takeoff or landing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSite {
    pub id: String,
    pub name: String,
    pub kind: SiteKind,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
}

impl NamedSite {
    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

/// Airspace category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    Ctr,
    Tma,
    Restricted,
    Danger,
    Prohibited,
    Glider,
    Other(String),
}

impl ZoneKind {
    /// Map a free-form kind label onto a known category.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "ctr" => ZoneKind::Ctr,
            "tma" => ZoneKind::Tma,
            "r" | "restricted" => ZoneKind::Restricted,
            "d" | "danger" => ZoneKind::Danger,
            "p" | "prohibited" => ZoneKind::Prohibited,
            "gsec" | "glider" | "gliding" => ZoneKind::Glider,
            other => ZoneKind::Other(other.to_string()),
        }
    }
}

/// A vertical limit as published, before conversion to meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AltitudeLimit {
    Meters(f64),
    Feet(f64),
    FlightLevel(f64),
    Ground,
    Unlimited,
}

pub const METERS_PER_FOOT: f64 = 0.3048;

impl AltitudeLimit {
    /// Altitude in meters. Ground and unlimited map to the infinities so the
    /// band test stays a plain range check.
    pub fn to_meters(self) -> f64 {
        match self {
            AltitudeLimit::Meters(m) => m,
            AltitudeLimit::Feet(ft) => ft * METERS_PER_FOOT,
            AltitudeLimit::FlightLevel(fl) => fl * 100.0 * METERS_PER_FOOT,
            AltitudeLimit::Ground => f64::NEG_INFINITY,
            AltitudeLimit::Unlimited => f64::INFINITY,
        }
    }
}

/// Axis-aligned lat/lon box used to reject points before the polygon test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn from_ring(ring: &[LatLon]) -> Option<Self> {
        let first = ring.first()?;
        let mut bbox = BoundingBox {
            min_lat: first.lat,
            max_lat: first.lat,
            min_lon: first.lon,
            max_lon: first.lon,
        };
        for p in &ring[1..] {
            bbox.min_lat = bbox.min_lat.min(p.lat);
            bbox.max_lat = bbox.max_lat.max(p.lat);
            bbox.min_lon = bbox.min_lon.min(p.lon);
            bbox.max_lon = bbox.max_lon.max(p.lon);
        }
        Some(bbox)
    }

    pub fn contains(&self, p: LatLon) -> bool {
        p.lat >= self.min_lat && p.lat <= self.max_lat && p.lon >= self.min_lon && p.lon <= self.max_lon
    }
}

/// Validated airspace volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirspaceZone {
    pub id: String,
    pub name: String,
    pub kind: ZoneKind,
    pub class: Option<String>,
    pub polygon: Vec<LatLon>,
    pub lower_m: f64,
    pub upper_m: f64,
    pub bbox: BoundingBox,
}

// ---------------------------------------------------------------------------
// Flight records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightStatus {
    InFlight,
    Completed,
    Cancelled,
}

impl FlightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlightStatus::InFlight => "in_flight",
            FlightStatus::Completed => "completed",
            FlightStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FlightStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a flight record was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Landed,
    WatchdogTimeout,
    StreamEnded,
    Cancelled,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Landed => "landed",
            CloseReason::WatchdogTimeout => "watchdog_timeout",
            CloseReason::StreamEnded => "stream_ended",
            CloseReason::Cancelled => "cancelled",
        }
    }
}

/// How an endpoint label was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteSource {
    NearestOfType,
    Proximity,
    Coordinates,
}

/// A takeoff or landing label attached to a flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSite {
    pub name: String,
    pub site_id: Option<String>,
    pub distance_m: Option<f64>,
    pub source: SiteSource,
}

/// The authoritative record of one flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightRecord {
    pub id: String,
    pub operator_id: String,
    pub takeoff_time: f64,
    pub landing_time: Option<f64>,
    pub takeoff_site: ResolvedSite,
    pub landing_site: Option<ResolvedSite>,
    pub status: FlightStatus,
    pub close_reason: Option<CloseReason>,
    pub track_points: Vec<TrackPoint>,
}

impl FlightRecord {
    pub fn is_open(&self) -> bool {
        self.status == FlightStatus::InFlight
    }

    /// Seconds between takeoff and landing, if landed.
    pub fn duration_sec(&self) -> Option<f64> {
        self.landing_time.map(|t| t - self.takeoff_time)
    }

    pub fn max_altitude(&self) -> Option<f64> {
        self.track_points
            .iter()
            .map(|p| p.altitude)
            .fold(None, |acc: Option<f64>, a| Some(acc.map_or(a, |m| m.max(a))))
    }

    /// Summed great-circle length of the track in meters.
    pub fn track_length_m(&self) -> f64 {
        self.track_points
            .windows(2)
            .map(|w| crate::geo::distance_m(w[0].position(), w[1].position()))
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Airspace violations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStatus {
    InProgress,
    Completed,
}

/// One entry into (and eventually exit from) a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEntry {
    pub zone_id: String,
    pub zone_name: String,
    pub entry_time: f64,
    pub entry_position: LatLon,
    pub entry_altitude: f64,
    pub exit_time: Option<f64>,
    pub exit_position: Option<LatLon>,
    pub exit_altitude: Option<f64>,
    pub duration_sec: Option<f64>,
    pub status: ViolationStatus,
}

/// The single aggregated notification covering every violation of a flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightAlert {
    pub id: String,
    pub operator_id: String,
    pub flight_id: Option<String>,
    pub violations: Vec<ViolationEntry>,
    pub any_active: bool,
    pub created_at: f64,
    pub updated_at: f64,
}

impl FlightAlert {
    pub fn active_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.status == ViolationStatus::InProgress)
            .count()
    }
}

/// What the broadcaster publishes for live observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePosition {
    pub operator_id: String,
    pub flight_id: String,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
