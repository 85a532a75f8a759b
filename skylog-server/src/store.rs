//! Non-blocking front for the SQLite database.
//!
//! One blocking task owns the `Database` and applies commands in order.
//! `StoreHandle` implements the core sink traits without waiting on disk.
//! Live position updates are capped: once `capacity` of them are queued
//! and unapplied, further updates are rejected as a store error and the
//! broadcaster retries on a later fix. Flight saves, live deletes and
//! alerts are never rejected while the writer is running, so a closed
//! flight always reaches the database even behind a slow disk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use skylog_core::sink::{AlertSink, FlightStore, LiveStore};
use skylog_core::types::*;

use crate::db::Database;

pub const DEFAULT_QUEUE: usize = 1024;

#[derive(Debug)]
pub enum StoreCommand {
    SaveFlight(Box<FlightRecord>),
    PutLive(LivePosition),
    DeleteLive(String),
    PublishAlert(FlightAlert),
}

/// What the writer did before its queue closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub applied: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
    live_pending: Arc<AtomicUsize>,
    live_capacity: usize,
}

impl StoreHandle {
    fn send(&self, cmd: StoreCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| SkylogError::Store("store writer stopped".into()))
    }
}

impl FlightStore for StoreHandle {
    fn save_flight(&mut self, record: &FlightRecord) -> Result<()> {
        self.send(StoreCommand::SaveFlight(Box::new(record.clone())))
    }
}

impl LiveStore for StoreHandle {
    fn put_live(&mut self, position: &LivePosition) -> Result<()> {
        let queued = self.live_pending.fetch_add(1, Ordering::AcqRel);
        if queued >= self.live_capacity {
            self.live_pending.fetch_sub(1, Ordering::AcqRel);
            return Err(SkylogError::Store("store queue full".into()));
        }
        self.send(StoreCommand::PutLive(position.clone()))
            .inspect_err(|_| {
                self.live_pending.fetch_sub(1, Ordering::AcqRel);
            })
    }

    fn delete_live(&mut self, operator_id: &str) -> Result<()> {
        self.send(StoreCommand::DeleteLive(operator_id.to_string()))
    }
}

impl AlertSink for StoreHandle {
    fn publish(&mut self, alert: &FlightAlert) -> Result<()> {
        self.send(StoreCommand::PublishAlert(alert.clone()))
    }
}

/// Handle plus the receiving end, for a writer that runs elsewhere.
fn channel(capacity: usize) -> (StoreHandle, mpsc::UnboundedReceiver<StoreCommand>, Arc<AtomicUsize>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let live_pending = Arc::new(AtomicUsize::new(0));
    let handle = StoreHandle {
        tx,
        live_pending: live_pending.clone(),
        live_capacity: capacity.max(1),
    };
    (handle, rx, live_pending)
}

fn apply(db: &mut Database, cmd: StoreCommand) -> Result<()> {
    match cmd {
        StoreCommand::SaveFlight(record) => db.save_flight(&record),
        StoreCommand::PutLive(pos) => db.put_live(&pos),
        StoreCommand::DeleteLive(operator_id) => db.delete_live(&operator_id),
        StoreCommand::PublishAlert(alert) => db.publish(&alert),
    }
}

/// Move `db` onto a blocking task and return a handle that feeds it.
/// The task ends once every handle is dropped and the queue is drained.
pub fn spawn_writer(mut db: Database, capacity: usize) -> (StoreHandle, JoinHandle<WriterStats>) {
    let (handle, mut rx, live_pending) = channel(capacity);
    let task = tokio::task::spawn_blocking(move || {
        let mut stats = WriterStats::default();
        while let Some(cmd) = rx.blocking_recv() {
            if matches!(cmd, StoreCommand::PutLive(_)) {
                live_pending.fetch_sub(1, Ordering::AcqRel);
            }
            match apply(&mut db, cmd) {
                Ok(()) => stats.applied += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!("store write failed: {e}");
                }
            }
        }
        debug!(applied = stats.applied, failed = stats.failed, "store writer stopped");
        stats
    });
    (handle, task)
}
