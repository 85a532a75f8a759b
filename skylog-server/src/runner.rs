//! Async run loop that owns one operator's `FlightSession`.
//!
//! Every producer (stdin reader, HTTP, tests) talks to the session through a
//! cloned `SessionHandle`, so fixes reach the state machine one at a time in
//! the order the channel delivered them. The loop selects between that
//! channel and the watchdog interval:
//!
//! 1. Inputs: fixes, manual start, cancel, finish
//! 2. Watchdog tick: close the flight if the stream has gone quiet
//!
//! When the channel closes or `Finish` arrives, any open flight is closed at
//! its last fix and the session is handed back to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use skylog_core::clock::{Clock, SystemClock};
use skylog_core::session::{FlightSession, SessionEvent};
use skylog_core::types::*;

pub const DEFAULT_CAPACITY: usize = 256;

/// Wall clock that follows tokio's timer, so paused-time tests can drive
/// the watchdog.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: Instant,
    epoch: f64,
}

impl TokioClock {
    pub fn new() -> Self {
        TokioClock {
            origin: Instant::now(),
            epoch: SystemClock.now(),
        }
    }

    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> f64 {
        self.epoch + self.origin.elapsed().as_secs_f64()
    }
}

// ---------------------------------------------------------------------------
// Inputs and handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SessionInput {
    Point(TrackPoint),
    StartFlight {
        point: TrackPoint,
        reply: oneshot::Sender<Result<String>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<FlightRecord>>,
    },
    Finish,
}

/// Cloneable sender side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionInput>,
}

impl SessionHandle {
    async fn send(&self, input: SessionInput) -> Result<()> {
        self.tx
            .send(input)
            .await
            .map_err(|_| SkylogError::SessionClosed)
    }

    pub async fn send_point(&self, point: TrackPoint) -> Result<()> {
        self.send(SessionInput::Point(point)).await
    }

    pub async fn start_flight(&self, point: TrackPoint) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionInput::StartFlight { point, reply }).await?;
        rx.await.map_err(|_| SkylogError::SessionClosed)?
    }

    pub async fn cancel(&self) -> Result<FlightRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionInput::Cancel { reply }).await?;
        rx.await.map_err(|_| SkylogError::SessionClosed)?
    }

    /// Close any open flight and stop the runner.
    pub async fn finish(&self) -> Result<()> {
        self.send(SessionInput::Finish).await
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct SessionRunner {
    session: FlightSession,
    poll: Duration,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionRunner {
    pub fn new(session: FlightSession, poll: Duration) -> Self {
        SessionRunner {
            session,
            poll,
            events: None,
        }
    }

    /// Forward every session event to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Start the loop on the runtime. The task returns the session when done.
    pub fn spawn(self, capacity: usize) -> (SessionHandle, JoinHandle<FlightSession>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        (SessionHandle { tx }, task)
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<SessionInput>) -> FlightSession {
        info!(operator = %self.session.operator_id(), "session runner started");
        let mut watchdog = tokio::time::interval(self.poll);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                input = rx.recv() => {
                    let Some(input) = input else { break };
                    if !self.handle(input) {
                        break;
                    }
                }

                _ = watchdog.tick() => {
                    if let Some(event) = self.session.check_watchdog() {
                        self.emit(event);
                    }
                }
            }
        }

        if let Some(event) = self.session.finish_stream() {
            self.emit(event);
        }
        let stats = self.session.stats();
        info!(
            operator = %self.session.operator_id(),
            points = stats.points_seen,
            flights = stats.flights_closed,
            "session runner stopped"
        );
        self.session
    }

    /// Apply one input. Returns false when the runner should stop.
    fn handle(&mut self, input: SessionInput) -> bool {
        match input {
            SessionInput::Point(point) => {
                for event in self.session.process_point(&point) {
                    self.emit(event);
                }
            }
            SessionInput::StartFlight { point, reply } => {
                let result = self.session.start_flight(&point);
                if reply.send(result).is_err() {
                    debug!("start_flight caller went away");
                }
            }
            SessionInput::Cancel { reply } => {
                let result = self.session.cancel();
                if let Ok(record) = &result {
                    self.emit(SessionEvent::FlightClosed {
                        record: record.clone(),
                        reason: CloseReason::Cancelled,
                    });
                }
                if reply.send(result).is_err() {
                    debug!("cancel caller went away");
                }
            }
            SessionInput::Finish => return false,
        }
        true
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
