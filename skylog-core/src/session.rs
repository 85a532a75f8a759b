//! Flight lifecycle orchestration for one operator.
//!
//! `FlightSession` ties the detector, airspace tracker, broadcaster and site
//! resolver together and owns the single open `FlightRecord`. It is a plain
//! synchronous state machine: the caller feeds fixes in arrival order and
//! polls `check_watchdog()` on a timer.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::airspace::{AirspaceEvent, AirspaceTracker};
use crate::broadcast::PositionBroadcaster;
use crate::clock::Clock;
use crate::config::{Config, SessionConfig};
use crate::detector::{FlightPhase, FlightPhaseDetector, PhaseEventKind};
use crate::sink::{AlertSink, FlightStore, LiveStore, MemoryStore, NullSink};
use crate::sites::SiteResolver;
use crate::types::*;

/// Something the caller may want to report or persist.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    FlightOpened {
        flight_id: String,
        takeoff_site: ResolvedSite,
        timestamp: f64,
    },
    FlightClosed {
        record: FlightRecord,
        reason: CloseReason,
    },
    Airspace(AirspaceEvent),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub points_seen: u64,
    pub points_skipped: u64,
    pub flights_opened: u64,
    pub flights_closed: u64,
    pub uploads: u64,
    pub upload_failures: u64,
}

/// The three outbound collaborators a session writes to.
pub struct SessionSinks {
    pub flights: Box<dyn FlightStore>,
    pub live: Box<dyn LiveStore>,
    pub alerts: Box<dyn AlertSink>,
}

impl SessionSinks {
    pub fn new(
        flights: impl FlightStore + 'static,
        live: impl LiveStore + 'static,
        alerts: impl AlertSink + 'static,
    ) -> Self {
        SessionSinks {
            flights: Box::new(flights),
            live: Box::new(live),
            alerts: Box::new(alerts),
        }
    }

    /// Every sink backed by the same in-memory store.
    pub fn memory(store: &MemoryStore) -> Self {
        Self::new(store.clone(), store.clone(), store.clone())
    }

    pub fn null() -> Self {
        Self::new(NullSink, NullSink, NullSink)
    }
}

pub struct FlightSession {
    operator_id: String,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    detector: FlightPhaseDetector,
    airspace: AirspaceTracker,
    broadcaster: PositionBroadcaster,
    resolver: SiteResolver,
    sinks: SessionSinks,

    current: Option<FlightRecord>,
    /// Clock time of the last fix accepted while a flight was open.
    last_activity: Option<f64>,

    // Counters
    points_seen: u64,
    points_skipped: u64,
    flights_opened: u64,
    flights_closed: u64,
}

impl FlightSession {
    pub fn new(
        config: &Config,
        resolver: SiteResolver,
        zones: Vec<AirspaceZone>,
        sinks: SessionSinks,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let operator_id = config.session.operator_id.clone();
        FlightSession {
            detector: FlightPhaseDetector::new(config.detector.clone()),
            airspace: AirspaceTracker::new(zones, &operator_id),
            broadcaster: PositionBroadcaster::new(&operator_id, config.broadcast.clone()),
            config: config.session.clone(),
            operator_id,
            clock,
            resolver,
            sinks,
            current: None,
            last_activity: None,
            points_seen: 0,
            points_skipped: 0,
            flights_opened: 0,
            flights_closed: 0,
        }
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn phase(&self) -> FlightPhase {
        self.detector.phase()
    }

    /// The open flight, if any.
    pub fn current_flight(&self) -> Option<&FlightRecord> {
        self.current.as_ref()
    }

    pub fn airspace(&self) -> &AirspaceTracker {
        &self.airspace
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            points_seen: self.points_seen,
            points_skipped: self.points_skipped,
            flights_opened: self.flights_opened,
            flights_closed: self.flights_closed,
            uploads: self.broadcaster.uploads,
            upload_failures: self.broadcaster.failures,
        }
    }

    /// Feed one fix. Returns everything it caused, in order.
    pub fn process_point(&mut self, point: &TrackPoint) -> Vec<SessionEvent> {
        self.points_seen += 1;
        if !point.is_valid() {
            self.points_skipped += 1;
            warn!(operator = %self.operator_id, timestamp = point.timestamp, "skipping invalid fix");
            return Vec::new();
        }

        let phase_event = self.detector.update(point);
        let mut events = Vec::new();

        match (phase_event.map(|e| e.kind), self.current.is_some()) {
            (Some(PhaseEventKind::Takeoff), false) => {
                events.extend(self.open_flight(point));
            }
            (Some(PhaseEventKind::Landing), true) => {
                events.extend(self.track(point));
                events.extend(self.close(CloseReason::Landed));
            }
            (_, true) => {
                events.extend(self.track(point));
            }
            (Some(PhaseEventKind::Landing), false) => {
                debug!(operator = %self.operator_id, "landing without an open flight, ignored");
            }
            (None, false) => {}
        }
        events
    }

    /// Close the open flight when the stream has been silent too long.
    pub fn check_watchdog(&mut self) -> Option<SessionEvent> {
        self.current.as_ref()?;
        let last = self.last_activity?;
        let silent = self.clock.now() - last;
        if silent < self.config.watchdog_timeout_sec {
            return None;
        }
        warn!(
            operator = %self.operator_id,
            "no fixes for {silent:.0}s, closing flight"
        );
        self.close(CloseReason::WatchdogTimeout)
    }

    /// Close the open flight at the last fix of a finished stream.
    pub fn finish_stream(&mut self) -> Option<SessionEvent> {
        self.current.as_ref()?;
        self.close(CloseReason::StreamEnded)
    }

    /// Open a flight by hand at `point`, without waiting for takeoff speed.
    pub fn start_flight(&mut self, point: &TrackPoint) -> Result<String> {
        if let Some(current) = &self.current {
            return Err(SkylogError::AlreadyInFlight {
                flight_id: current.id.clone(),
            });
        }
        if !point.is_valid() {
            return Err(SkylogError::InvalidPoint {
                timestamp: point.timestamp,
            });
        }
        self.detector.force_airborne(point);
        self.open_flight(point);
        self.current
            .as_ref()
            .map(|r| r.id.clone())
            .ok_or(SkylogError::NoActiveFlight)
    }

    /// Abandon the open flight. Fixes are ignored until the next takeoff.
    pub fn cancel(&mut self) -> Result<FlightRecord> {
        match self.close(CloseReason::Cancelled) {
            Some(SessionEvent::FlightClosed { record, .. }) => Ok(record),
            _ => Err(SkylogError::NoActiveFlight),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn open_flight(&mut self, point: &TrackPoint) -> Vec<SessionEvent> {
        let takeoff_site = self
            .resolver
            .resolve(point.position(), point.altitude, SiteKind::Takeoff);
        let record = FlightRecord {
            id: Uuid::new_v4().to_string(),
            operator_id: self.operator_id.clone(),
            takeoff_time: point.timestamp,
            landing_time: None,
            takeoff_site: takeoff_site.clone(),
            landing_site: None,
            status: FlightStatus::InFlight,
            close_reason: None,
            track_points: Vec::new(),
        };
        info!(
            operator = %self.operator_id,
            flight = %record.id,
            "takeoff from {}",
            takeoff_site.name
        );

        let flight_id = record.id.clone();
        self.airspace.begin_flight(&flight_id);
        self.current = Some(record);
        self.flights_opened += 1;

        let mut events = vec![SessionEvent::FlightOpened {
            flight_id: flight_id.clone(),
            takeoff_site,
            timestamp: point.timestamp,
        }];
        events.extend(self.track_without_upload(point));
        self.broadcaster
            .start(&flight_id, point, self.sinks.live.as_mut());
        events
    }

    /// Record a fix against the open flight and offer it for upload.
    fn track(&mut self, point: &TrackPoint) -> Vec<SessionEvent> {
        let events = self.track_without_upload(point);
        self.broadcaster.offer(point, self.sinks.live.as_mut());
        events
    }

    fn track_without_upload(&mut self, point: &TrackPoint) -> Vec<SessionEvent> {
        let Some(record) = self.current.as_mut() else {
            return Vec::new();
        };
        record.track_points.push(point.clone());
        self.last_activity = Some(self.clock.now());

        let update = self.airspace.update(point);
        if update.alert_changed {
            self.publish_alert();
        }
        update.events.into_iter().map(SessionEvent::Airspace).collect()
    }

    fn publish_alert(&mut self) {
        if let Some(alert) = self.airspace.alert() {
            if let Err(e) = self.sinks.alerts.publish(alert) {
                warn!(alert = %alert.id, "failed to publish alert: {e}");
            }
        }
    }

    fn close(&mut self, reason: CloseReason) -> Option<SessionEvent> {
        let mut record = self.current.take()?;
        record.close_reason = Some(reason);

        if reason == CloseReason::Cancelled {
            record.status = FlightStatus::Cancelled;
        } else {
            record.status = FlightStatus::Completed;
            if let Some(last) = record.track_points.last() {
                record.landing_time = Some(last.timestamp);
                record.landing_site = Some(self.resolver.resolve(
                    last.position(),
                    last.altitude,
                    SiteKind::Landing,
                ));
            }
        }

        self.broadcaster.stop(self.sinks.live.as_mut());
        if let Some(alert) = self.airspace.end_flight() {
            if let Err(e) = self.sinks.alerts.publish(&alert) {
                warn!(alert = %alert.id, "failed to publish final alert: {e}");
            }
        }
        if let Err(e) = self.sinks.flights.save_flight(&record) {
            warn!(flight = %record.id, "failed to save flight: {e}");
        }

        match reason {
            CloseReason::Cancelled => self.detector.cancel(),
            CloseReason::WatchdogTimeout | CloseReason::StreamEnded => self.detector.reset(),
            CloseReason::Landed => {}
        }
        self.last_activity = None;
        self.flights_closed += 1;

        info!(
            operator = %self.operator_id,
            flight = %record.id,
            reason = reason.as_str(),
            "flight closed after {} fixes",
            record.track_points.len()
        );
        Some(SessionEvent::FlightClosed { record, reason })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geo::destination;

    const ORIGIN: LatLon = LatLon::new(46.68, 7.86);

    struct Harness {
        session: FlightSession,
        store: MemoryStore,
        clock: ManualClock,
    }

    fn harness(sites: Vec<NamedSite>, zones: Vec<AirspaceZone>) -> Harness {
        let store = MemoryStore::new();
        let clock = ManualClock::new(1_000.0);
        let mut config = Config::default();
        config.session.operator_id = "pilot-1".into();
        let session = FlightSession::new(
            &config,
            SiteResolver::new(sites, Default::default()),
            zones,
            SessionSinks::memory(&store),
            Arc::new(clock.clone()),
        );
        Harness {
            session,
            store,
            clock,
        }
    }

    /// Fix `meters_north` of the origin with reported kinematics.
    fn fix(t: f64, meters_north: f64, speed: f64) -> TrackPoint {
        let p = destination(ORIGIN, 0.0, meters_north);
        TrackPoint::new(t, p.lat, p.lon, 1200.0)
            .with_speed(speed)
            .with_vertical_speed(0.0)
    }

    fn at(t: f64, lat: f64, lon: f64, speed: f64) -> TrackPoint {
        TrackPoint::new(t, lat, lon, 1500.0)
            .with_speed(speed)
            .with_vertical_speed(0.0)
    }

    fn site(id: &str, kind: SiteKind, pos: LatLon) -> NamedSite {
        NamedSite {
            id: id.into(),
            name: format!("Site {id}"),
            kind,
            lat: pos.lat,
            lon: pos.lon,
            altitude: 1200.0,
        }
    }

    fn square_zone(id: &str, lat0: f64, lon0: f64, size: f64) -> AirspaceZone {
        let polygon = vec![
            LatLon::new(lat0, lon0),
            LatLon::new(lat0, lon0 + size),
            LatLon::new(lat0 + size, lon0 + size),
            LatLon::new(lat0 + size, lon0),
        ];
        AirspaceZone {
            id: id.into(),
            name: format!("Zone {id}"),
            kind: ZoneKind::Ctr,
            class: Some("D".into()),
            bbox: BoundingBox::from_ring(&polygon).unwrap(),
            polygon,
            lower_m: f64::NEG_INFINITY,
            upper_m: f64::INFINITY,
        }
    }

    fn opened(events: &[SessionEvent]) -> Option<&str> {
        events.iter().find_map(|e| match e {
            SessionEvent::FlightOpened { flight_id, .. } => Some(flight_id.as_str()),
            _ => None,
        })
    }

    fn closed(events: &[SessionEvent]) -> Option<(&FlightRecord, CloseReason)> {
        events.iter().find_map(|e| match e {
            SessionEvent::FlightClosed { record, reason } => Some((record, *reason)),
            _ => None,
        })
    }

    #[test]
    fn test_takeoff_and_landing_lifecycle() {
        let landing_spot = destination(ORIGIN, 0.0, 2_000.0);
        let mut h = harness(
            vec![
                site("to", SiteKind::Takeoff, ORIGIN),
                site("lz", SiteKind::Landing, landing_spot),
            ],
            Vec::new(),
        );

        assert!(h.session.process_point(&fix(0.0, 0.0, 0.0)).is_empty());
        let events = h.session.process_point(&fix(1.0, 5.0, 5.0));
        let flight_id = opened(&events).unwrap().to_string();
        assert_eq!(h.session.current_flight().unwrap().takeoff_site.name, "Site to");

        for i in 2..100 {
            let events = h.session.process_point(&fix(i as f64, i as f64 * 20.0, 8.0));
            assert!(closed(&events).is_none());
        }

        let mut close = None;
        for t in 100..=106 {
            let events = h.session.process_point(&fix(t as f64, 2_000.0, 0.3));
            if let Some((record, reason)) = closed(&events) {
                close = Some((record.clone(), reason));
                break;
            }
        }
        let (record, reason) = close.expect("landing closes the flight");
        assert_eq!(reason, CloseReason::Landed);
        assert_eq!(record.id, flight_id);
        assert_eq!(record.status, FlightStatus::Completed);
        assert_eq!(record.landing_time, Some(105.0));
        assert_eq!(record.landing_site.as_ref().unwrap().name, "Site lz");
        assert!(h.session.current_flight().is_none());

        let state = h.store.state();
        assert_eq!(state.flights[&flight_id].status, FlightStatus::Completed);
        assert!(state.live.is_empty());
    }

    #[test]
    fn test_takeoff_site_450m_away() {
        let far = destination(ORIGIN, 90.0, 450.0);
        let mut h = harness(vec![site("t1", SiteKind::Takeoff, far)], Vec::new());

        h.session.process_point(&fix(0.0, 0.0, 0.0));
        let events = h.session.process_point(&fix(1.0, 0.0, 4.0));
        let site = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::FlightOpened { takeoff_site, .. } => Some(takeoff_site.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(site.name, "Site t1");
        assert_eq!(site.source, SiteSource::NearestOfType);
        assert!((site.distance_m.unwrap() - 450.0).abs() < 1.0);
    }

    #[test]
    fn test_watchdog_closes_as_completed() {
        let mut h = harness(Vec::new(), Vec::new());
        h.session.process_point(&fix(0.0, 0.0, 0.0));
        h.session.process_point(&fix(1.0, 10.0, 6.0));
        h.clock.advance(1.0);
        h.session.process_point(&fix(2.0, 20.0, 6.0));

        h.clock.advance(299.0);
        assert!(h.session.check_watchdog().is_none());
        h.clock.advance(1.0);

        let event = h.session.check_watchdog().expect("watchdog fires");
        let SessionEvent::FlightClosed { record, reason } = event else {
            panic!("expected a closed flight");
        };
        assert_eq!(reason, CloseReason::WatchdogTimeout);
        assert_eq!(record.status, FlightStatus::Completed);
        assert_eq!(record.landing_time, Some(2.0));
        let landing = record.landing_site.unwrap();
        assert_eq!(landing.source, SiteSource::Coordinates);
        assert!(landing.name.starts_with("Unknown Landing"));

        // Once per stale period
        h.clock.advance(600.0);
        assert!(h.session.check_watchdog().is_none());
        assert_eq!(h.session.phase(), FlightPhase::Grounded);
        assert_eq!(h.store.state().flights.len(), 1);
    }

    #[test]
    fn test_watchdog_idle_without_flight() {
        let mut h = harness(Vec::new(), Vec::new());
        h.session.process_point(&fix(0.0, 0.0, 0.0));
        h.clock.advance(10_000.0);
        assert!(h.session.check_watchdog().is_none());
    }

    #[test]
    fn test_finish_stream_closes_at_last_fix() {
        let mut h = harness(Vec::new(), Vec::new());
        h.session.process_point(&fix(0.0, 0.0, 3.0));
        h.session.process_point(&fix(4.0, 40.0, 9.0));
        let Some(SessionEvent::FlightClosed { record, reason }) = h.session.finish_stream() else {
            panic!("expected a closed flight");
        };
        assert_eq!(reason, CloseReason::StreamEnded);
        assert_eq!(record.landing_time, Some(4.0));
        assert_eq!(record.track_points.len(), 2);
        assert!(h.session.finish_stream().is_none());
    }

    #[test]
    fn test_cancel_without_flight() {
        let mut h = harness(Vec::new(), Vec::new());
        h.session.process_point(&fix(0.0, 0.0, 0.0));
        assert!(matches!(h.session.cancel(), Err(SkylogError::NoActiveFlight)));
        assert_eq!(h.session.phase(), FlightPhase::Grounded);
        assert!(h.store.state().flights.is_empty());
    }

    #[test]
    fn test_cancel_halts_until_next_takeoff() {
        let mut h = harness(Vec::new(), Vec::new());
        h.session.process_point(&fix(0.0, 0.0, 5.0));
        let record = h.session.cancel().unwrap();
        assert_eq!(record.status, FlightStatus::Cancelled);
        assert_eq!(record.close_reason, Some(CloseReason::Cancelled));
        assert!(record.landing_site.is_none());
        assert_eq!(h.store.state().flights[&record.id].status, FlightStatus::Cancelled);
        assert!(h.store.state().live.is_empty());

        // Still fast: ignored
        assert!(h.session.process_point(&fix(1.0, 10.0, 5.0)).is_empty());
        assert!(h.session.current_flight().is_none());
        // Slow re-arms, fast opens a new flight
        assert!(h.session.process_point(&fix(2.0, 10.0, 0.5)).is_empty());
        let events = h.session.process_point(&fix(3.0, 20.0, 5.0));
        assert!(opened(&events).is_some());
        assert_ne!(h.session.current_flight().unwrap().id, record.id);
    }

    #[test]
    fn test_manual_start() {
        let mut h = harness(Vec::new(), Vec::new());
        let id = h.session.start_flight(&fix(0.0, 0.0, 0.0)).unwrap();
        assert_eq!(h.session.phase(), FlightPhase::Airborne);
        assert!(h.store.state().live.contains_key("pilot-1"));

        match h.session.start_flight(&fix(1.0, 0.0, 0.0)) {
            Err(SkylogError::AlreadyInFlight { flight_id }) => assert_eq!(flight_id, id),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.session.stats().flights_opened, 1);
    }

    #[test]
    fn test_manual_start_rejects_invalid_fix() {
        let mut h = harness(Vec::new(), Vec::new());
        let bad = TrackPoint::new(0.0, f64::NAN, 7.0, 0.0);
        assert!(matches!(
            h.session.start_flight(&bad),
            Err(SkylogError::InvalidPoint { .. })
        ));
        assert!(h.session.current_flight().is_none());
    }

    #[test]
    fn test_invalid_fix_skipped() {
        let mut h = harness(Vec::new(), Vec::new());
        h.session.process_point(&fix(0.0, 0.0, 5.0));
        let bad = TrackPoint::new(1.0, 120.0, 7.0, 0.0);
        assert!(h.session.process_point(&bad).is_empty());
        let stats = h.session.stats();
        assert_eq!(stats.points_seen, 2);
        assert_eq!(stats.points_skipped, 1);
        assert_eq!(h.session.current_flight().unwrap().track_points.len(), 1);
    }

    #[test]
    fn test_upload_throttle_through_session() {
        let mut h = harness(Vec::new(), Vec::new());
        h.session.process_point(&fix(0.0, 0.0, 5.0));
        h.session.process_point(&fix(3.0, 10.0, 5.0));
        assert_eq!(h.store.state().uploads.len(), 1);
        h.session.process_point(&fix(6.0, 70.0, 5.0));
        assert_eq!(h.store.state().uploads.len(), 2);
        assert_eq!(h.session.stats().uploads, 2);
    }

    #[test]
    fn test_overlapping_zones_single_alert() {
        let zones = vec![
            square_zone("A", 47.0, 11.0, 0.2),
            square_zone("B", 47.1, 11.1, 0.2),
        ];
        let mut h = harness(Vec::new(), zones);

        h.session.process_point(&at(0.0, 46.9, 10.9, 10.0));
        let flight_id = h.session.current_flight().unwrap().id.clone();

        let mut entered = Vec::new();
        for (t, lat, lon) in [
            (10.0, 47.05, 11.05),
            (20.0, 47.15, 11.15),
            (30.0, 47.25, 11.25),
            (40.0, 47.35, 11.35),
        ] {
            for event in h.session.process_point(&at(t, lat, lon, 10.0)) {
                if let SessionEvent::Airspace(AirspaceEvent::Entered { zone_id, .. }) = event {
                    entered.push(zone_id);
                }
            }
        }
        assert_eq!(entered, vec!["A", "B"]);

        {
            let state = h.store.state();
            assert_eq!(state.alerts.len(), 1);
            let alert = state.alerts.values().next().unwrap();
            assert_eq!(alert.flight_id.as_deref(), Some(flight_id.as_str()));
            assert_eq!(alert.violations.len(), 2);
            assert!(!alert.any_active);
            assert!(state.publications.iter().all(|a| a.id == alert.id));
        }

        h.session.finish_stream();
        let state = h.store.state();
        assert_eq!(state.alerts.len(), 1);
        assert!(state
            .alerts
            .values()
            .next()
            .unwrap()
            .violations
            .iter()
            .all(|v| v.status == ViolationStatus::Completed));
    }

    #[test]
    fn test_open_violation_closed_with_flight() {
        let mut h = harness(Vec::new(), vec![square_zone("A", 47.0, 11.0, 0.2)]);
        h.session.process_point(&at(0.0, 46.9, 10.9, 10.0));
        h.session.process_point(&at(10.0, 47.1, 11.1, 10.0));
        assert!(h.session.airspace().any_active());

        h.clock.advance(300.0);
        h.session.check_watchdog().unwrap();

        let state = h.store.state();
        let alert = state.alerts.values().next().unwrap();
        assert!(!alert.any_active);
        assert_eq!(alert.violations[0].exit_time, Some(10.0));
        assert!(!h.session.airspace().any_active());
    }
}
