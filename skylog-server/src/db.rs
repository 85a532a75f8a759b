//! SQLite persistence: WAL mode, 5 tables, idempotent upserts.
//!
//! Schema: flights, track_points, alerts, violations, live_positions.
//! Writes are keyed by flight id, alert id and operator id, so saving the
//! same record twice leaves one copy.

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use skylog_core::sink::{AlertSink, FlightStore, LiveStore};
use skylog_core::types::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flights (
    id TEXT PRIMARY KEY,
    operator_id TEXT NOT NULL,
    status TEXT NOT NULL,
    close_reason TEXT,
    takeoff_time REAL NOT NULL,
    landing_time REAL,
    takeoff_site TEXT NOT NULL,
    landing_site TEXT,
    max_altitude REAL,
    track_length_m REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS track_points (
    flight_id TEXT NOT NULL REFERENCES flights(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    timestamp REAL NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    altitude REAL NOT NULL,
    speed REAL,
    vertical_speed REAL,
    heading REAL,
    PRIMARY KEY (flight_id, seq)
);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    operator_id TEXT NOT NULL,
    flight_id TEXT,
    any_active INTEGER NOT NULL DEFAULT 0,
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS violations (
    alert_id TEXT NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    zone_id TEXT NOT NULL,
    zone_name TEXT NOT NULL,
    entry_time REAL NOT NULL,
    entry_lat REAL NOT NULL,
    entry_lon REAL NOT NULL,
    entry_altitude REAL NOT NULL,
    exit_time REAL,
    exit_lat REAL,
    exit_lon REAL,
    exit_altitude REAL,
    duration_sec REAL,
    status TEXT NOT NULL,
    PRIMARY KEY (alert_id, seq)
);

CREATE TABLE IF NOT EXISTS live_positions (
    operator_id TEXT PRIMARY KEY,
    flight_id TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    altitude REAL NOT NULL,
    speed REAL,
    heading REAL,
    timestamp REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_flights_operator ON flights(operator_id);
CREATE INDEX IF NOT EXISTS idx_flights_takeoff ON flights(takeoff_time);
CREATE INDEX IF NOT EXISTS idx_alerts_flight ON alerts(flight_id);
CREATE INDEX IF NOT EXISTS idx_alerts_updated ON alerts(updated_at);
"#;

/// Parse a snake_case label written by `as_str()` back into its enum.
fn from_label<T: DeserializeOwned>(label: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(label.to_string())).ok()
}

fn to_sql_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

fn store_err(e: rusqlite::Error) -> SkylogError {
    SkylogError::Store(e.to_string())
}

/// SQLite database for flights, alerts and live positions.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> SqlResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            // Ensure parent directory exists
            if let Some(parent) = Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Database { conn })
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        Self::open(":memory:")
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert or replace a flight and its full track.
    pub fn upsert_flight(&mut self, record: &FlightRecord) -> SqlResult<()> {
        let takeoff_site = serde_json::to_string(&record.takeoff_site).map_err(to_sql_err)?;
        let landing_site = record
            .landing_site
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(to_sql_err)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO flights (id, operator_id, status, close_reason, takeoff_time,
                 landing_time, takeoff_site, landing_site, max_altitude, track_length_m)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 close_reason = excluded.close_reason,
                 landing_time = excluded.landing_time,
                 landing_site = excluded.landing_site,
                 max_altitude = excluded.max_altitude,
                 track_length_m = excluded.track_length_m",
            params![
                record.id,
                record.operator_id,
                record.status.as_str(),
                record.close_reason.map(|r| r.as_str()),
                record.takeoff_time,
                record.landing_time,
                takeoff_site,
                landing_site,
                record.max_altitude(),
                record.track_length_m(),
            ],
        )?;
        tx.execute("DELETE FROM track_points WHERE flight_id = ?1", params![record.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO track_points
                     (flight_id, seq, timestamp, lat, lon, altitude, speed, vertical_speed, heading)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (seq, p) in record.track_points.iter().enumerate() {
                stmt.execute(params![
                    record.id,
                    seq as i64,
                    p.timestamp,
                    p.lat,
                    p.lon,
                    p.altitude,
                    p.speed,
                    p.vertical_speed,
                    p.heading,
                ])?;
            }
        }
        tx.commit()
    }

    /// Insert or replace an alert and all of its violation entries.
    pub fn upsert_alert(&mut self, alert: &FlightAlert) -> SqlResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO alerts (id, operator_id, flight_id, any_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 flight_id = excluded.flight_id,
                 any_active = excluded.any_active,
                 updated_at = excluded.updated_at",
            params![
                alert.id,
                alert.operator_id,
                alert.flight_id,
                alert.any_active as i32,
                alert.created_at,
                alert.updated_at,
            ],
        )?;
        tx.execute("DELETE FROM violations WHERE alert_id = ?1", params![alert.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO violations
                     (alert_id, seq, zone_id, zone_name, entry_time, entry_lat, entry_lon,
                      entry_altitude, exit_time, exit_lat, exit_lon, exit_altitude,
                      duration_sec, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for (seq, v) in alert.violations.iter().enumerate() {
                let status = match v.status {
                    ViolationStatus::InProgress => "in_progress",
                    ViolationStatus::Completed => "completed",
                };
                stmt.execute(params![
                    alert.id,
                    seq as i64,
                    v.zone_id,
                    v.zone_name,
                    v.entry_time,
                    v.entry_position.lat,
                    v.entry_position.lon,
                    v.entry_altitude,
                    v.exit_time,
                    v.exit_position.map(|p| p.lat),
                    v.exit_position.map(|p| p.lon),
                    v.exit_altitude,
                    v.duration_sec,
                    status,
                ])?;
            }
        }
        tx.commit()
    }

    pub fn upsert_live(&mut self, pos: &LivePosition) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO live_positions
                 (operator_id, flight_id, lat, lon, altitude, speed, heading, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                pos.operator_id,
                pos.flight_id,
                pos.lat,
                pos.lon,
                pos.altitude,
                pos.speed,
                pos.heading,
                pos.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn remove_live(&mut self, operator_id: &str) -> SqlResult<usize> {
        self.conn.execute(
            "DELETE FROM live_positions WHERE operator_id = ?1",
            params![operator_id],
        )
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Most recent flights first.
    pub fn list_flights(&self, limit: i64) -> SqlResult<Vec<FlightRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.id, f.operator_id, f.status, f.close_reason, f.takeoff_time,
                    f.landing_time, f.takeoff_site, f.landing_site, f.max_altitude,
                    f.track_length_m,
                    (SELECT COUNT(*) FROM track_points t WHERE t.flight_id = f.id)
             FROM flights f ORDER BY f.takeoff_time DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], flight_row)?;
        rows.collect()
    }

    /// Full flight record including its track, if stored.
    pub fn get_flight(&self, id: &str) -> SqlResult<Option<FlightRecord>> {
        let head = self
            .conn
            .query_row(
                "SELECT id, operator_id, status, close_reason, takeoff_time, landing_time,
                        takeoff_site, landing_site
                 FROM flights WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, f64>(4)?,
                        r.get::<_, Option<f64>>(5)?,
                        r.get::<_, String>(6)?,
                        r.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, operator_id, status, reason, takeoff_time, landing_time, to, ld)) = head
        else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT timestamp, lat, lon, altitude, speed, vertical_speed, heading
             FROM track_points WHERE flight_id = ?1 ORDER BY seq",
        )?;
        let track_points = stmt
            .query_map(params![id], |r| {
                Ok(TrackPoint {
                    timestamp: r.get(0)?,
                    lat: r.get(1)?,
                    lon: r.get(2)?,
                    altitude: r.get(3)?,
                    speed: r.get(4)?,
                    vertical_speed: r.get(5)?,
                    heading: r.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(Some(FlightRecord {
            id,
            operator_id,
            takeoff_time,
            landing_time,
            takeoff_site: serde_json::from_str(&to).map_err(to_sql_err)?,
            landing_site: ld
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(to_sql_err)?,
            status: from_label(&status).unwrap_or(FlightStatus::Completed),
            close_reason: reason.as_deref().and_then(from_label),
            track_points,
        }))
    }

    /// Operators currently in the air.
    pub fn get_live(&self) -> SqlResult<Vec<LivePosition>> {
        let mut stmt = self.conn.prepare(
            "SELECT operator_id, flight_id, lat, lon, altitude, speed, heading, timestamp
             FROM live_positions ORDER BY timestamp DESC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(LivePosition {
                operator_id: r.get(0)?,
                flight_id: r.get(1)?,
                lat: r.get(2)?,
                lon: r.get(3)?,
                altitude: r.get(4)?,
                speed: r.get(5)?,
                heading: r.get(6)?,
                timestamp: r.get(7)?,
            })
        })?;
        rows.collect()
    }

    /// Most recently updated alerts first, each with its violations.
    pub fn get_alerts(&self, limit: i64) -> SqlResult<Vec<FlightAlert>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, operator_id, flight_id, any_active, created_at, updated_at
             FROM alerts ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let mut alerts = stmt
            .query_map(params![limit], |r| {
                Ok(FlightAlert {
                    id: r.get(0)?,
                    operator_id: r.get(1)?,
                    flight_id: r.get(2)?,
                    any_active: r.get::<_, i32>(3)? != 0,
                    created_at: r.get(4)?,
                    updated_at: r.get(5)?,
                    violations: Vec::new(),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT zone_id, zone_name, entry_time, entry_lat, entry_lon, entry_altitude,
                    exit_time, exit_lat, exit_lon, exit_altitude, duration_sec, status
             FROM violations WHERE alert_id = ?1 ORDER BY seq",
        )?;
        for alert in &mut alerts {
            alert.violations = stmt
                .query_map(params![alert.id], violation_row)?
                .collect::<SqlResult<Vec<_>>>()?;
        }
        Ok(alerts)
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    fn count(&self, sql: &str) -> SqlResult<i64> {
        self.conn.query_row(sql, [], |r| r.get(0))
    }

    pub fn stats(&self) -> SqlResult<DbStats> {
        Ok(DbStats {
            flights: self.count("SELECT COUNT(*) FROM flights")?,
            completed: self.count("SELECT COUNT(*) FROM flights WHERE status = 'completed'")?,
            cancelled: self.count("SELECT COUNT(*) FROM flights WHERE status = 'cancelled'")?,
            track_points: self.count("SELECT COUNT(*) FROM track_points")?,
            alerts: self.count("SELECT COUNT(*) FROM alerts")?,
            violations: self.count("SELECT COUNT(*) FROM violations")?,
            live: self.count("SELECT COUNT(*) FROM live_positions")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct FlightRow {
    pub id: String,
    pub operator_id: String,
    pub status: String,
    pub close_reason: Option<String>,
    pub takeoff_time: f64,
    pub landing_time: Option<f64>,
    pub takeoff_site: String,
    pub landing_site: Option<String>,
    pub max_altitude: Option<f64>,
    pub track_length_m: f64,
    pub point_count: i64,
}

#[derive(Debug, Serialize)]
pub struct DbStats {
    pub flights: i64,
    pub completed: i64,
    pub cancelled: i64,
    pub track_points: i64,
    pub alerts: i64,
    pub violations: i64,
    pub live: i64,
}

/// Site labels are stored as JSON; rows only carry the name.
fn site_name(json: &str) -> String {
    serde_json::from_str::<ResolvedSite>(json)
        .map(|s| s.name)
        .unwrap_or_else(|_| json.to_string())
}

fn flight_row(r: &Row<'_>) -> SqlResult<FlightRow> {
    let takeoff: String = r.get(6)?;
    let landing: Option<String> = r.get(7)?;
    Ok(FlightRow {
        id: r.get(0)?,
        operator_id: r.get(1)?,
        status: r.get(2)?,
        close_reason: r.get(3)?,
        takeoff_time: r.get(4)?,
        landing_time: r.get(5)?,
        takeoff_site: site_name(&takeoff),
        landing_site: landing.as_deref().map(site_name),
        max_altitude: r.get(8)?,
        track_length_m: r.get(9)?,
        point_count: r.get(10)?,
    })
}

fn violation_row(r: &Row<'_>) -> SqlResult<ViolationEntry> {
    let exit_lat: Option<f64> = r.get(7)?;
    let exit_lon: Option<f64> = r.get(8)?;
    let status: String = r.get(11)?;
    Ok(ViolationEntry {
        zone_id: r.get(0)?,
        zone_name: r.get(1)?,
        entry_time: r.get(2)?,
        entry_position: LatLon::new(r.get(3)?, r.get(4)?),
        entry_altitude: r.get(5)?,
        exit_time: r.get(6)?,
        exit_position: exit_lat.zip(exit_lon).map(|(lat, lon)| LatLon::new(lat, lon)),
        exit_altitude: r.get(9)?,
        duration_sec: r.get(10)?,
        status: from_label(&status).unwrap_or(ViolationStatus::Completed),
    })
}

// ---------------------------------------------------------------------------
// Sink implementations
// ---------------------------------------------------------------------------

impl FlightStore for Database {
    fn save_flight(&mut self, record: &FlightRecord) -> Result<()> {
        self.upsert_flight(record).map_err(store_err)
    }
}

impl LiveStore for Database {
    fn put_live(&mut self, position: &LivePosition) -> Result<()> {
        self.upsert_live(position).map_err(store_err)
    }

    fn delete_live(&mut self, operator_id: &str) -> Result<()> {
        self.remove_live(operator_id).map(|_| ()).map_err(store_err)
    }
}

impl AlertSink for Database {
    fn publish(&mut self, alert: &FlightAlert) -> Result<()> {
        self.upsert_alert(alert).map_err(store_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
