//! REST API route handlers.
//!
//! Each handler opens its own DB connection on a blocking thread. Session
//! endpoints forward to the attached runner and answer 503 without one.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use skylog_core::types::{FlightAlert, FlightRecord, LivePosition, SkylogError, TrackPoint};

use crate::db::{Database, DbStats, FlightRow};
use crate::runner::SessionHandle;
use crate::web::AppState;

// ---------------------------------------------------------------------------
// Query param types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct FlightParams {
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct AlertParams {
    limit: Option<i64>,
    active: Option<bool>,
}

// ---------------------------------------------------------------------------
// Errors and helpers
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<SkylogError> for ApiError {
    fn from(e: SkylogError) -> Self {
        let status = match e {
            SkylogError::AlreadyInFlight { .. } | SkylogError::NoActiveFlight => StatusCode::CONFLICT,
            SkylogError::InvalidPoint { .. } => StatusCode::BAD_REQUEST,
            SkylogError::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn clamp_i64(val: i64, min: i64, max: i64) -> i64 {
    val.max(min).min(max)
}

/// Run a query against a fresh connection off the async threads.
async fn with_db<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> rusqlite::Result<T> + Send + 'static,
{
    let path = state.db_path.clone();
    tokio::task::spawn_blocking(move || {
        let db = Database::open(&path)?;
        f(&db)
    })
    .await
    .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(ApiError::from)
}

fn session(state: &AppState) -> Result<&SessionHandle, ApiError> {
    state.session.as_ref().ok_or_else(|| {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "no live session attached")
    })
}

// ---------------------------------------------------------------------------
// Read endpoints
// ---------------------------------------------------------------------------

/// GET /api/live: operators currently in the air.
pub async fn api_live(State(state): State<Arc<AppState>>) -> ApiResult<Vec<LivePosition>> {
    with_db(&state, |db| db.get_live()).await.map(Json)
}

/// GET /api/flights: stored flights, newest first.
pub async fn api_flights(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FlightParams>,
) -> ApiResult<Vec<FlightRow>> {
    let limit = clamp_i64(params.limit.unwrap_or(50), 1, 1000);
    with_db(&state, move |db| db.list_flights(limit)).await.map(Json)
}

/// GET /api/flights/:id: one flight with its track and summary figures.
pub async fn api_flight_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = with_db(&state, move |db| db.get_flight(&id)).await?;
    let Some(record) = record else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Flight not found"));
    };

    Ok(Json(json!({
        "duration_sec": record.duration_sec(),
        "max_altitude": record.max_altitude(),
        "track_length_m": record.track_length_m(),
        "flight": record,
    })))
}

/// GET /api/alerts: alerts by last update, optionally only active ones.
pub async fn api_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertParams>,
) -> ApiResult<Vec<FlightAlert>> {
    let limit = clamp_i64(params.limit.unwrap_or(50), 1, 1000);
    let mut alerts = with_db(&state, move |db| db.get_alerts(limit)).await?;
    if params.active == Some(true) {
        alerts.retain(|a| a.any_active);
    }
    Ok(Json(alerts))
}

/// GET /api/stats: table counts.
pub async fn api_stats(State(state): State<Arc<AppState>>) -> ApiResult<DbStats> {
    with_db(&state, |db| db.stats()).await.map(Json)
}

// ---------------------------------------------------------------------------
// Session endpoints
// ---------------------------------------------------------------------------

/// POST /api/session/point: queue one fix for the live session.
pub async fn api_session_point(
    State(state): State<Arc<AppState>>,
    Json(point): Json<TrackPoint>,
) -> Result<impl IntoResponse, ApiError> {
    session(&state)?.send_point(point).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"queued": true}))))
}

/// POST /api/session/start: open a flight at the given fix.
pub async fn api_session_start(
    State(state): State<Arc<AppState>>,
    Json(point): Json<TrackPoint>,
) -> Result<Json<Value>, ApiError> {
    let flight_id = session(&state)?.start_flight(point).await?;
    Ok(Json(json!({"flight_id": flight_id})))
}

/// POST /api/session/cancel: abandon the open flight.
pub async fn api_session_cancel(
    State(state): State<Arc<AppState>>,
) -> ApiResult<FlightRecord> {
    session(&state)?.cancel().await.map(Json).map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use skylog_core::config::Config;
    use skylog_core::session::{FlightSession, SessionSinks};
    use skylog_core::sink::{AlertSink, FlightStore, LiveStore, MemoryStore};
    use skylog_core::sites::SiteResolver;
    use skylog_core::types::{CloseReason, FlightStatus, ResolvedSite, SiteSource};

    use crate::runner::{SessionRunner, TokioClock};

    fn site(name: &str) -> ResolvedSite {
        ResolvedSite {
            name: name.into(),
            site_id: None,
            distance_m: None,
            source: SiteSource::Coordinates,
        }
    }

    fn test_state(session: Option<SessionHandle>) -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db").to_str().unwrap().to_string();

        // Create DB with test data
        let mut db = Database::open(&db_path).unwrap();
        db.save_flight(&FlightRecord {
            id: "f1".into(),
            operator_id: "pilot-1".into(),
            takeoff_time: 100.0,
            landing_time: Some(700.0),
            takeoff_site: site("Niesen"),
            landing_site: Some(site("Wimmis")),
            status: FlightStatus::Completed,
            close_reason: Some(CloseReason::Landed),
            track_points: vec![
                TrackPoint::new(100.0, 46.64, 7.65, 2300.0),
                TrackPoint::new(700.0, 46.67, 7.64, 640.0),
            ],
        })
        .unwrap();
        for (id, active) in [("a1", true), ("a2", false)] {
            db.publish(&FlightAlert {
                id: id.into(),
                operator_id: "pilot-1".into(),
                flight_id: Some("f1".into()),
                violations: Vec::new(),
                any_active: active,
                created_at: 200.0,
                updated_at: 200.0,
            })
            .unwrap();
        }
        db.put_live(&LivePosition {
            operator_id: "pilot-2".into(),
            flight_id: "f2".into(),
            lat: 46.7,
            lon: 7.9,
            altitude: 2100.0,
            speed: Some(9.5),
            heading: Some(180.0),
            timestamp: 900.0,
        })
        .unwrap();
        drop(db);

        let state = Arc::new(AppState { db_path, session });
        (state, dir)
    }

    async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        let app = crate::web::build_router(state);
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post(state: Arc<AppState>, uri: &str, body: Value) -> (StatusCode, Value) {
        let app = crate::web::build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_api_stats() {
        let (state, _dir) = test_state(None);
        let (status, json) = get(state, "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["flights"], 1);
        assert_eq!(json["track_points"], 2);
        assert_eq!(json["alerts"], 2);
        assert_eq!(json["live"], 1);
    }

    #[tokio::test]
    async fn test_api_live() {
        let (state, _dir) = test_state(None);
        let (status, json) = get(state, "/api/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["operator_id"], "pilot-2");
    }

    #[tokio::test]
    async fn test_api_flights() {
        let (state, _dir) = test_state(None);
        let (status, json) = get(state, "/api/flights?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["id"], "f1");
        assert_eq!(json[0]["takeoff_site"], "Niesen");
        assert_eq!(json[0]["point_count"], 2);
    }

    #[tokio::test]
    async fn test_api_flight_detail() {
        let (state, _dir) = test_state(None);
        let (status, json) = get(state.clone(), "/api/flights/f1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["flight"]["id"], "f1");
        assert_eq!(json["duration_sec"], 600.0);
        assert_eq!(json["max_altitude"], 2300.0);
        assert_eq!(json["flight"]["track_points"].as_array().unwrap().len(), 2);

        let (status, json) = get(state, "/api/flights/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_api_alerts_active_filter() {
        let (state, _dir) = test_state(None);
        let (_, all) = get(state.clone(), "/api/alerts").await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let (status, active) = get(state, "/api/alerts?active=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(active.as_array().unwrap().len(), 1);
        assert_eq!(active[0]["id"], "a1");
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (SkylogError::NoActiveFlight, StatusCode::CONFLICT),
            (SkylogError::AlreadyInFlight { flight_id: "f1".into() }, StatusCode::CONFLICT),
            (SkylogError::InvalidPoint { timestamp: 1.0 }, StatusCode::BAD_REQUEST),
            (SkylogError::SessionClosed, StatusCode::SERVICE_UNAVAILABLE),
            (SkylogError::Store("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_session_endpoints_without_session() {
        let (state, _dir) = test_state(None);
        let point = json!({"timestamp": 1, "lat": 46.6, "lon": 7.6, "altitude": 1500});
        let (status, _) = post(state, "/api/session/point", point).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_session_start_and_cancel() {
        let store = MemoryStore::new();
        let mut config = Config::default();
        config.session.operator_id = "pilot-9".into();
        let session = FlightSession::new(
            &config,
            SiteResolver::default(),
            Vec::new(),
            SessionSinks::memory(&store),
            TokioClock::shared(),
        );
        let (handle, task) = SessionRunner::new(session, Duration::from_secs(5)).spawn(8);
        let (state, _dir) = test_state(Some(handle.clone()));

        let point = json!({"timestamp": 1, "lat": 46.6, "lon": 7.6, "altitude": 1500});
        let (status, json) = post(state.clone(), "/api/session/start", point.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let flight_id = json["flight_id"].as_str().unwrap().to_string();

        let (status, _) = post(state.clone(), "/api/session/start", point.clone()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = post(state.clone(), "/api/session/point", point).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, json) = post(state.clone(), "/api/session/cancel", json!(null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], flight_id.as_str());
        assert_eq!(json["status"], "cancelled");

        drop(state);
        handle.finish().await.unwrap();
        task.await.unwrap();
        assert!(store.state().flights.contains_key(&flight_id));
    }
}
