//! skylog: flight session runner, tracklog import and live view.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use skylog_core::clock::SystemClock;
use skylog_core::config::{self, Config};
use skylog_core::detector::{analyze_tracklog, PhaseEventKind};
use skylog_core::reference;
use skylog_core::session::{FlightSession, SessionEvent, SessionSinks};
use skylog_core::sink::{AlertFanout, NullSink};
use skylog_core::sites::SiteResolver;
use skylog_core::types::*;
use skylog_core::AirspaceEvent;

mod db;
mod input;
mod logging;
mod notification;
mod runner;
mod store;
mod web;

use logging::Verbosity;

#[derive(Parser)]
#[command(name = "skylog", version, about = "Paragliding flight logger and airspace monitor")]
struct Cli {
    /// Config file (default: ~/.skylog/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Reference data and storage shared by the session commands.
#[derive(clap::Args)]
struct SessionArgs {
    /// Sites JSON file (overrides [reference] sites_path)
    #[arg(long)]
    sites: Option<PathBuf>,

    /// Airspace zones JSON file (overrides [reference] zones_path)
    #[arg(long)]
    zones: Option<PathBuf>,

    /// SQLite database path (overrides [database] path)
    #[arg(long)]
    db_path: Option<String>,

    /// Operator id (overrides [session] operator_id)
    #[arg(long)]
    operator: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect takeoff and landing in a recorded tracklog
    Replay {
        /// JSON array or JSON-lines file of track points (`-` for stdin)
        file: PathBuf,
    },

    /// Run a recorded tracklog through a full session and store the flights
    Import {
        file: PathBuf,

        #[command(flatten)]
        args: SessionArgs,
    },

    /// Live session fed with JSON-lines track points on stdin
    Run {
        #[command(flatten)]
        args: SessionArgs,

        /// POST alerts to this URL (overrides `webhook`)
        #[arg(long)]
        webhook: Option<String>,

        /// Also serve the live view, accepting points over HTTP
        #[arg(long)]
        serve: bool,
    },

    /// List stored flights
    Flights {
        #[arg(long)]
        db_path: Option<String>,

        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Show database statistics
    Stats {
        #[arg(long)]
        db_path: Option<String>,
    },

    /// Serve the read-only live view
    Serve {
        #[arg(long)]
        db_path: Option<String>,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the resolved configuration
    Config {
        /// Write the default config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(Verbosity::from_flags(cli.verbose, cli.quiet));

    let config_path = cli.config.clone().unwrap_or_else(config::config_file);
    let loaded = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    let config = loaded.unwrap_or_else(|e| {
        eprintln!("Error loading config {}: {e}", config_path.display());
        std::process::exit(1);
    });

    match cli.command {
        Commands::Replay { file } => cmd_replay(&file, &config),
        Commands::Import { file, args } => cmd_import(&file, &args, config),
        Commands::Run {
            args,
            webhook,
            serve,
        } => cmd_run(&args, webhook, serve, config).await,
        Commands::Flights { db_path, limit } => {
            cmd_flights(&db_path.unwrap_or(config.database.path), limit)
        }
        Commands::Stats { db_path } => cmd_stats(&db_path.unwrap_or(config.database.path)),
        Commands::Serve {
            db_path,
            host,
            port,
        } => {
            let db_path = db_path.unwrap_or(config.database.path);
            let host = host.unwrap_or(config.dashboard.host);
            let port = port.unwrap_or(config.dashboard.port);
            if let Err(e) = web::serve(db_path, None, &host, port).await {
                eprintln!("Error serving on {host}:{port}: {e}");
                std::process::exit(1);
            }
        }
        Commands::Config { init } => cmd_config(init, &config, cli.config.as_deref()),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fmt_time(ts: f64) -> String {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9) as u32;
    chrono::DateTime::from_timestamp(secs as i64, nanos)
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{ts:.0}"))
}

fn fmt_opt(v: Option<f64>, precision: usize) -> String {
    v.map(|x| format!("{x:.precision$}")).unwrap_or("-".into())
}

fn open_db(path: &str) -> db::Database {
    db::Database::open(path).unwrap_or_else(|e| {
        eprintln!("Error opening database {path}: {e}");
        std::process::exit(1);
    })
}

fn load_points(file: &Path) -> Vec<TrackPoint> {
    input::load_points(file).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {e}", file.display());
        std::process::exit(1);
    })
}

/// Apply CLI overrides and load reference data.
fn prepare(args: &SessionArgs, mut config: Config) -> (Config, SiteResolver, Vec<AirspaceZone>) {
    if let Some(op) = &args.operator {
        config.session.operator_id = op.clone();
    }
    if let Some(path) = &args.db_path {
        config.database.path = path.clone();
    }

    let sites = match args.sites.as_ref().or(config.reference.sites_path.as_ref()) {
        Some(path) => {
            let report = reference::load_sites(path).unwrap_or_else(|e| {
                eprintln!("Error loading sites {}: {e}", path.display());
                std::process::exit(1);
            });
            info!(loaded = report.items.len(), skipped = report.skipped.len(), "sites loaded");
            report.items
        }
        None => Vec::new(),
    };
    let zones = match args.zones.as_ref().or(config.reference.zones_path.as_ref()) {
        Some(path) => {
            let report = reference::load_zones(path).unwrap_or_else(|e| {
                eprintln!("Error loading zones {}: {e}", path.display());
                std::process::exit(1);
            });
            info!(loaded = report.items.len(), skipped = report.skipped.len(), "zones loaded");
            report.items
        }
        None => Vec::new(),
    };

    let resolver = SiteResolver::new(sites, config.sites.clone());
    (config, resolver, zones)
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::FlightOpened {
            flight_id,
            takeoff_site,
            timestamp,
        } => println!("{}  TAKEOFF  {}  ({flight_id})", fmt_time(*timestamp), takeoff_site.name),
        SessionEvent::FlightClosed { record, reason } => println!(
            "{}  CLOSED   {}  ({})",
            fmt_time(record.landing_time.unwrap_or(record.takeoff_time)),
            record
                .landing_site
                .as_ref()
                .map(|s| s.name.as_str())
                .unwrap_or("-"),
            reason.as_str()
        ),
        SessionEvent::Airspace(AirspaceEvent::Entered {
            zone_name,
            altitude,
            timestamp,
            ..
        }) => println!("{}  ENTERED  {zone_name} at {altitude:.0} m", fmt_time(*timestamp)),
        SessionEvent::Airspace(AirspaceEvent::Exited {
            zone_name,
            timestamp,
            duration_sec,
            ..
        }) => println!(
            "{}  LEFT     {zone_name} after {duration_sec:.0} s",
            fmt_time(*timestamp)
        ),
    }
}

fn print_flights(records: &[FlightRecord]) {
    if records.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.set_header(vec![
        "Flight", "Takeoff", "From", "To", "Duration", "Max alt (m)", "Track (km)", "Points",
        "Status",
    ]);
    for r in records {
        table.add_row(vec![
            Cell::new(&r.id[..8.min(r.id.len())]),
            Cell::new(fmt_time(r.takeoff_time)),
            Cell::new(&r.takeoff_site.name),
            Cell::new(r.landing_site.as_ref().map(|s| s.name.as_str()).unwrap_or("-")),
            Cell::new(fmt_duration(r.duration_sec())),
            Cell::new(fmt_opt(r.max_altitude(), 0)),
            Cell::new(format!("{:.1}", r.track_length_m() / 1000.0)),
            Cell::new(r.track_points.len()),
            Cell::new(r.status),
        ]);
    }
    println!("{table}");
}

fn fmt_duration(secs: Option<f64>) -> String {
    match secs {
        Some(s) if s >= 0.0 => {
            let s = s as u64;
            format!("{}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)
        }
        _ => "-".into(),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_replay(file: &Path, config: &Config) {
    let points = load_points(file);
    let events = analyze_tracklog(&points, &config.detector);

    println!();
    println!("Replay: {} ({} points)", file.display(), points.len());
    println!();
    if events.is_empty() {
        println!("No takeoff detected.");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["#", "Event", "Time", "Lat", "Lon", "Alt (m)"]);
    for (i, e) in events.iter().enumerate() {
        let kind = match e.kind {
            PhaseEventKind::Takeoff => "takeoff",
            PhaseEventKind::Landing => "landing",
        };
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(kind),
            Cell::new(fmt_time(e.timestamp)),
            Cell::new(format!("{:.5}", e.lat)),
            Cell::new(format!("{:.5}", e.lon)),
            Cell::new(format!("{:.0}", e.altitude)),
        ]);
    }
    println!("{table}");
}

fn cmd_import(file: &Path, args: &SessionArgs, config: Config) {
    let (config, resolver, zones) = prepare(args, config);
    let db_path = config.database.path.clone();
    let points = load_points(file);

    // Historical tracks have no live observers
    let sinks = SessionSinks::new(open_db(&db_path), NullSink, open_db(&db_path));
    let mut session = FlightSession::new(
        &config,
        resolver,
        zones,
        sinks,
        Arc::new(SystemClock),
    );

    let mut closed = Vec::new();
    let mut violations = 0usize;
    for point in &points {
        for event in session.process_point(point) {
            match event {
                SessionEvent::FlightClosed { record, .. } => closed.push(record),
                SessionEvent::Airspace(AirspaceEvent::Entered { .. }) => violations += 1,
                _ => {}
            }
        }
    }
    if let Some(SessionEvent::FlightClosed { record, .. }) = session.finish_stream() {
        closed.push(record);
    }

    let stats = session.stats();
    println!();
    println!("Import complete: {}", file.display());
    println!(
        "  Points: {} read, {} skipped",
        stats.points_seen, stats.points_skipped
    );
    println!("  Flights: {}", closed.len());
    println!("  Zone entries: {violations}");
    println!();
    println!("Database: {db_path}");
    println!();
    print_flights(&closed);
}

async fn cmd_run(args: &SessionArgs, webhook: Option<String>, serve: bool, config: Config) {
    let (config, resolver, zones) = prepare(args, config);
    let db_path = config.database.path.clone();

    let (store, writer) = store::spawn_writer(open_db(&db_path), store::DEFAULT_QUEUE);
    let mut alerts = AlertFanout::new().with(store.clone());
    let mut webhook_task = None;
    if let Some(url) = webhook.or(config.webhook.clone()) {
        info!("posting alerts to {url}");
        let (dispatcher, task) = notification::WebhookDispatcher::spawn(&url);
        alerts = alerts.with(dispatcher);
        webhook_task = Some(task);
    }
    let sinks = SessionSinks::new(store.clone(), store, alerts);

    let session = FlightSession::new(&config, resolver, zones, sinks, runner::TokioClock::shared());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let poll = Duration::from_secs_f64(config.session.watchdog_poll_sec);
    let (handle, session_task) = runner::SessionRunner::new(session, poll)
        .with_events(events_tx)
        .spawn(runner::DEFAULT_CAPACITY);

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    let reader_handle = handle.clone();
    let reader = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match input::parse_line(&line) {
                    Some(Ok(point)) => {
                        if reader_handle.send_point(point).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!("skipping unparseable point: {e}"),
                    None => {}
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    break;
                }
            }
        }
    });

    if serve {
        let web_handle = handle.clone();
        let host = config.dashboard.host.clone();
        let port = config.dashboard.port;
        let web_db = db_path.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_db, Some(web_handle), &host, port).await {
                eprintln!("Error serving on {host}:{port}: {e}");
                std::process::exit(1);
            }
        });
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("waiting for ctrl-c failed: {e}");
        }
        reader.abort();
    } else {
        let _ = reader.await;
    }

    let _ = handle.finish().await;
    drop(handle);
    let session = match session_task.await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Session runner failed: {e}");
            std::process::exit(1);
        }
    };
    let stats = session.stats();
    // Dropping the session releases the last store handles
    drop(session);
    let written = writer.await.unwrap_or_default();
    if let Some(task) = webhook_task {
        match task.await {
            Ok(delivered) => info!(delivered, "webhook deliveries finished"),
            Err(e) => warn!("webhook dispatcher failed: {e}"),
        }
    }
    let _ = printer.await;

    println!();
    println!("Session ended");
    println!(
        "  Points: {} read, {} skipped",
        stats.points_seen, stats.points_skipped
    );
    println!(
        "  Flights: {} opened, {} closed",
        stats.flights_opened, stats.flights_closed
    );
    println!(
        "  Live uploads: {} ok, {} failed",
        stats.uploads, stats.upload_failures
    );
    println!("  Store writes: {} ok, {} failed", written.applied, written.failed);
}

fn cmd_flights(db_path: &str, limit: i64) {
    let database = open_db(db_path);
    let rows = database.list_flights(limit).unwrap_or_else(|e| {
        eprintln!("Error reading flights: {e}");
        std::process::exit(1);
    });

    if rows.is_empty() {
        println!("No flights stored in {db_path}");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Flight", "Operator", "Takeoff", "From", "To", "Duration", "Max alt (m)", "Track (km)",
        "Points", "Status",
    ]);
    for r in &rows {
        table.add_row(vec![
            Cell::new(&r.id[..8.min(r.id.len())]),
            Cell::new(&r.operator_id),
            Cell::new(fmt_time(r.takeoff_time)),
            Cell::new(&r.takeoff_site),
            Cell::new(r.landing_site.as_deref().unwrap_or("-")),
            Cell::new(fmt_duration(r.landing_time.map(|t| t - r.takeoff_time))),
            Cell::new(fmt_opt(r.max_altitude, 0)),
            Cell::new(format!("{:.1}", r.track_length_m / 1000.0)),
            Cell::new(r.point_count),
            Cell::new(&r.status),
        ]);
    }
    println!("{table}");
}

fn cmd_stats(db_path: &str) {
    let database = open_db(db_path);
    let stats = database.stats().unwrap_or_else(|e| {
        eprintln!("Error reading stats: {e}");
        std::process::exit(1);
    });

    println!();
    println!("Database: {db_path}");
    println!();
    println!("  Flights:      {} ({} completed, {} cancelled)", stats.flights, stats.completed, stats.cancelled);
    println!("  Track points: {}", stats.track_points);
    println!("  Alerts:       {}", stats.alerts);
    println!("  Violations:   {}", stats.violations);
    println!("  Live:         {}", stats.live);
    println!();
}

fn cmd_config(init: bool, config: &Config, path: Option<&Path>) {
    if init {
        let target = path.map(Path::to_path_buf).unwrap_or_else(config::config_file);
        if target.exists() {
            eprintln!("Config already exists at {}", target.display());
            std::process::exit(1);
        }
        let written = match path {
            Some(p) => config::save_config_to(&Config::default(), p).map(|_| target),
            None => config::save_config(&Config::default()),
        };
        match written {
            Ok(p) => println!("Wrote default config to {}", p.display()),
            Err(e) => {
                eprintln!("Error writing config: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    match config::serialize_config(config) {
        Ok(text) => print!("{text}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
