//! skylog-core: flight phase detection and airspace tracking for paragliders.
//!
//! No async, no database. Just the algorithms and the session state machine
//! that drives them. `skylog-server` wraps this crate with SQLite
//! persistence, an async runner and the CLI.

pub mod airspace;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod detector;
pub mod geo;
pub mod reference;
pub mod session;
pub mod sink;
pub mod sites;
pub mod types;

// Re-export commonly used types at crate root
pub use airspace::{AirspaceEvent, AirspaceTracker};
pub use broadcast::{BroadcastOutcome, PositionBroadcaster};
pub use clock::{Clock, ManualClock, SystemClock};
pub use detector::{analyze_tracklog, FlightPhase, FlightPhaseDetector, PhaseEvent, PhaseEventKind};
pub use session::{FlightSession, SessionEvent, SessionSinks, SessionStats};
pub use sink::{AlertSink, FlightStore, LiveStore, MemoryStore};
pub use sites::SiteResolver;
pub use types::*;
