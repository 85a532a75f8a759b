//! Webhook notification dispatch for flight alerts.
//!
//! One task owns the HTTP client and POSTs alerts in the order they were
//! published, so the receiver always ends on the latest version of each
//! alert id. A failed POST is logged and the next alert is sent anyway.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use skylog_core::sink::AlertSink;
use skylog_core::types::*;

/// Dispatches flight alerts to a webhook URL via HTTP POST.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    url: String,
    tx: mpsc::UnboundedSender<FlightAlert>,
}

impl WebhookDispatcher {
    /// Start the delivery task. It stops once every dispatcher clone is
    /// dropped and the queue is drained, returning the number delivered.
    pub fn spawn(url: &str) -> (Self, JoinHandle<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(deliver(url.to_string(), rx));
        let dispatcher = WebhookDispatcher {
            url: url.to_string(),
            tx,
        };
        (dispatcher, task)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

async fn deliver(url: String, mut rx: mpsc::UnboundedReceiver<FlightAlert>) -> u64 {
    let client = reqwest::Client::new();
    let mut delivered = 0;
    while let Some(alert) = rx.recv().await {
        match client.post(&url).json(&alert_payload(&alert)).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(alert = %alert.id, status = %resp.status(), "webhook rejected alert");
            }
            Ok(_) => delivered += 1,
            Err(e) => warn!(alert = %alert.id, "webhook POST failed: {e}"),
        }
    }
    debug!(delivered, "webhook dispatcher stopped");
    delivered
}

/// JSON body posted for an alert.
pub fn alert_payload(alert: &FlightAlert) -> serde_json::Value {
    serde_json::json!({
        "alert_id": alert.id,
        "operator_id": alert.operator_id,
        "flight_id": alert.flight_id,
        "any_active": alert.any_active,
        "active_count": alert.active_count(),
        "violations": alert.violations,
        "created_at": alert.created_at,
        "updated_at": alert.updated_at,
    })
}

impl AlertSink for WebhookDispatcher {
    fn publish(&mut self, alert: &FlightAlert) -> Result<()> {
        self.tx
            .send(alert.clone())
            .map_err(|_| SkylogError::Store("webhook dispatcher stopped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> FlightAlert {
        FlightAlert {
            id: "a1".into(),
            operator_id: "pilot-1".into(),
            flight_id: Some("f1".into()),
            violations: vec![ViolationEntry {
                zone_id: "tma-zrh".into(),
                zone_name: "TMA Zurich".into(),
                entry_time: 100.0,
                entry_position: LatLon::new(47.4, 8.5),
                entry_altitude: 1900.0,
                exit_time: None,
                exit_position: None,
                exit_altitude: None,
                duration_sec: None,
                status: ViolationStatus::InProgress,
            }],
            any_active: true,
            created_at: 100.0,
            updated_at: 100.0,
        }
    }

    #[tokio::test]
    async fn test_webhook_dispatcher_creation() {
        let (wh, _task) = WebhookDispatcher::spawn("https://example.com/hook");
        assert_eq!(wh.url(), "https://example.com/hook");
    }

    #[test]
    fn test_alert_payload() {
        let payload = alert_payload(&alert());
        assert_eq!(payload["alert_id"], "a1");
        assert_eq!(payload["flight_id"], "f1");
        assert_eq!(payload["active_count"], 1);
        assert_eq!(payload["violations"][0]["zone_name"], "TMA Zurich");
        assert_eq!(payload["violations"][0]["status"], "in_progress");
    }

    #[tokio::test]
    async fn test_unreachable_hook_is_logged_only() {
        // Nothing listens on the discard port
        let (mut wh, task) = WebhookDispatcher::spawn("http://127.0.0.1:9/hook");
        assert!(wh.publish(&alert()).is_ok());
        drop(wh);
        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_after_stop_is_an_error() {
        let (mut wh, task) = WebhookDispatcher::spawn("http://127.0.0.1:9/hook");
        task.abort();
        let _ = task.await;
        assert!(matches!(wh.publish(&alert()), Err(SkylogError::Store(_))));
    }

    #[tokio::test]
    async fn test_alert_versions_arrive_in_order() {
        use std::sync::{Arc, Mutex};

        use axum::extract::State;
        use axum::routing::post;
        use axum::{Json, Router};

        type Seen = Arc<Mutex<Vec<(f64, bool)>>>;

        async fn hook(State(seen): State<Seen>, Json(body): Json<serde_json::Value>) {
            let updated = body["updated_at"].as_f64().unwrap();
            let active = body["any_active"].as_bool().unwrap();
            seen.lock().unwrap().push((updated, active));
        }

        let seen: Seen = Arc::default();
        let app = Router::new().route("/hook", post(hook)).with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut wh, task) = WebhookDispatcher::spawn(&format!("http://{addr}/hook"));
        let mut versions = Vec::new();
        for i in 0..10 {
            let mut a = alert();
            a.updated_at = 100.0 + i as f64;
            a.any_active = i < 9;
            versions.push((a.updated_at, a.any_active));
            wh.publish(&a).unwrap();
        }
        drop(wh);

        assert_eq!(task.await.unwrap(), 10);
        assert_eq!(*seen.lock().unwrap(), versions);
    }
}
