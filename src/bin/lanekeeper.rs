//! lanekeeper CLI — operator interface to the lane coordination layer.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;

use lanekeeper::admin::AdminCoordinator;
use lanekeeper::admin::audit::AuditLog;
use lanekeeper::broker::{Broker, PgmqBroker};
use lanekeeper::config::Config;
use lanekeeper::config::catalog::LaneCatalog;
use lanekeeper::control::ControlPlane;
use lanekeeper::db::Db;
use lanekeeper::external::hook::HookProcessor;
use lanekeeper::external::jsonl::{FileSource, JsonlMalformLog, JsonlSink};
use lanekeeper::external::{ItemProcessor, ItemSource, MalformLog, ResultSink};
use lanekeeper::model::LaneKey;
use lanekeeper::monitor::HealthMonitor;
use lanekeeper::ratelimit::RateLimiter;
use lanekeeper::supervisor::Supervisor;
use lanekeeper::supervisor::process::ExecRunner;
use lanekeeper::telemetry::{TelemetryConfig, init_telemetry};
use lanekeeper::worker::Worker;

#[derive(Parser)]
#[command(name = "lanekeeper", about = "Coordination layer for worker lanes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the health monitor daemon
    Monitor,
    /// Run one lane's worker loop (spawned by the supervisor)
    Work {
        /// Lane to serve, as owner:category
        #[arg(long)]
        lane: LaneKey,
    },
    /// Lane lifecycle and status operations
    Lane {
        #[command(subcommand)]
        action: LaneAction,
    },
    /// Administrative operations
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
    /// Fleet-wide metrics rollup
    Metrics,
}

#[derive(Subcommand)]
enum LaneAction {
    /// Launch a worker for a lane
    Launch { lane: LaneKey },
    /// Launch every lane declared in the catalog (LANE_CATALOG_PATH)
    LaunchAll,
    /// Stop a lane's worker
    Stop {
        lane: LaneKey,
        /// Skip the grace period and kill immediately
        #[arg(long)]
        force: bool,
    },
    /// Pause queue consumption, keeping the worker alive
    Pause { lane: LaneKey },
    /// Resume a paused lane
    Resume { lane: LaneKey },
    /// Restart a lane's worker process
    Restart { lane: LaneKey },
    /// Discard everything pending on a lane's queue
    Flush { lane: LaneKey },
    /// Show one lane's status
    Status { lane: LaneKey },
    /// Show every registered lane
    List,
    /// Pause all lanes of one owner
    PauseOwner { owner: i32 },
    /// Resume all lanes of one owner
    ResumeOwner { owner: i32 },
    /// Stop every registered lane
    StopAll {
        #[arg(long)]
        force: bool,
    },
    /// Remove a stopped lane's registry entry and queue
    Teardown { lane: LaneKey },
}

#[derive(Subcommand)]
enum AdminAction {
    /// Wipe one lane's checkpoints, metrics, and queue
    Reset {
        lane: LaneKey,
        /// Drop the lane's sink output instead of archiving it
        #[arg(long)]
        discard: bool,
    },
    /// Reset every lane of one owner
    ResetOwner {
        owner: i32,
        /// Drop the lanes' sink output instead of archiving it
        #[arg(long)]
        discard: bool,
    },
    /// Tear down all coordination state
    FactoryReset {
        /// Required acknowledgement
        #[arg(long)]
        confirm: bool,
    },
    /// Export checkpoint state to a JSON file
    Export {
        /// Output path
        #[arg(long, default_value = "checkpoints.json")]
        out: PathBuf,
        /// Lanes to export; all lanes when omitted
        lanes: Vec<LaneKey>,
    },
    /// Import checkpoint state from a JSON file
    Import {
        path: PathBuf,
        /// Merge into existing checkpoints instead of replacing
        #[arg(long)]
        merge: bool,
    },
    /// Report checkpoint/sink discrepancies
    Verify,
    /// Enqueue a lane's pending items from the item source
    Populate { lane: LaneKey },
}

/// Everything the commands share, wired from config.
struct App {
    config: Config,
    db: Arc<Db>,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn ResultSink>,
    malform_log: Arc<dyn MalformLog>,
    source: Option<Arc<dyn ItemSource>>,
    limiter: RateLimiter,
}

impl App {
    async fn build() -> anyhow::Result<Self> {
        let config = Config::from_env()?;
        let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
        db.migrate().await?;

        let broker: Arc<dyn Broker> = Arc::new(PgmqBroker::new(
            Arc::clone(&db),
            config.limits.visibility_timeout_secs,
        ));
        let sink: Arc<dyn ResultSink> = Arc::new(JsonlSink::new(&config.sink_path));
        let malform_log: Arc<dyn MalformLog> =
            Arc::new(JsonlMalformLog::new(&config.malform_log_path));
        let source: Option<Arc<dyn ItemSource>> = config
            .source_path
            .as_ref()
            .map(|p| Arc::new(FileSource::new(p)) as Arc<dyn ItemSource>);
        let limiter = RateLimiter::new(
            Arc::clone(&db),
            config.limits.rate_capacity,
            config.limits.rate_refill_per_sec,
        );

        Ok(Self {
            config,
            db,
            broker,
            sink,
            malform_log,
            source,
            limiter,
        })
    }

    fn supervisor(&self) -> Supervisor {
        Supervisor::new(
            Arc::clone(&self.db),
            Arc::new(ExecRunner),
            Arc::clone(&self.broker),
            Arc::clone(&self.sink),
            self.source.clone(),
            self.config.limits.clone(),
        )
    }

    fn control(&self) -> ControlPlane {
        ControlPlane::new(
            Arc::clone(&self.db),
            Arc::clone(&self.broker),
            self.supervisor(),
            self.source.clone(),
            self.config.limits.clone(),
        )
    }

    fn admin(&self) -> AdminCoordinator {
        AdminCoordinator::new(
            Arc::clone(&self.db),
            Arc::clone(&self.broker),
            Arc::clone(&self.sink),
            self.source.clone(),
            self.limiter.clone(),
            AuditLog::new(&self.config.audit_log_path),
            self.config.limits.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Monitor => cmd_monitor().await,
        Command::Work { lane } => cmd_work(lane).await,
        Command::Lane { action } => {
            let app = App::build().await?;
            let control = app.control();
            match action {
                LaneAction::Launch { lane } => {
                    let pid = control.launch(&lane).await?;
                    println!("Launched {lane} as pid {pid}");
                }
                LaneAction::LaunchAll => {
                    let path = app
                        .config
                        .catalog_path
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("LANE_CATALOG_PATH is not set"))?;
                    let catalog = LaneCatalog::load(path)?;
                    print_outcomes(&control.launch_all(&catalog.lane_keys()).await?);
                }
                LaneAction::Stop { lane, force } => {
                    control.stop(&lane, force).await?;
                    println!("Stopped {lane}");
                }
                LaneAction::Pause { lane } => {
                    control.pause(&lane).await?;
                    println!("Paused {lane}");
                }
                LaneAction::Resume { lane } => {
                    control.resume(&lane).await?;
                    println!("Resumed {lane}");
                }
                LaneAction::Restart { lane } => {
                    let pid = control.restart(&lane).await?;
                    println!("Restarted {lane} as pid {pid}");
                }
                LaneAction::Flush { lane } => {
                    let n = control.flush(&lane).await?;
                    println!("Flushed {n} message(s) from {lane}");
                }
                LaneAction::Status { lane } => {
                    let report = control.status(&lane).await?;
                    print_status(&report);
                }
                LaneAction::List => {
                    let reports = control.list().await?;
                    print_list(&reports);
                }
                LaneAction::PauseOwner { owner } => {
                    print_outcomes(&control.pause_owner(owner).await?);
                }
                LaneAction::ResumeOwner { owner } => {
                    print_outcomes(&control.resume_owner(owner).await?);
                }
                LaneAction::StopAll { force } => {
                    print_outcomes(&control.stop_all(force).await?);
                }
                LaneAction::Teardown { lane } => {
                    control.teardown(&lane).await?;
                    println!("Tore down {lane}");
                }
            }
            Ok(())
        }
        Command::Admin { action } => {
            let app = App::build().await?;
            let admin = app.admin();
            match action {
                AdminAction::Reset { lane, discard } => {
                    let deleted = admin.reset_lane(&lane, !discard).await?;
                    println!("Reset {lane}: {deleted} checkpoint(s) removed");
                }
                AdminAction::ResetOwner { owner, discard } => {
                    let deleted = admin.reset_owner(owner, !discard).await?;
                    println!("Reset owner {owner}: {deleted} checkpoint(s) removed");
                }
                AdminAction::FactoryReset { confirm } => {
                    admin.factory_reset(confirm).await?;
                    println!("Factory reset complete");
                }
                AdminAction::Export { out, lanes } => {
                    let filter = if lanes.is_empty() {
                        None
                    } else {
                        Some(lanes.as_slice())
                    };
                    let n = admin.export(filter, &out).await?;
                    println!("Exported {n} lane(s) to {}", out.display());
                }
                AdminAction::Import { path, merge } => {
                    let n = admin.import(&path, merge).await?;
                    println!("Imported {n} checkpoint(s) from {}", path.display());
                }
                AdminAction::Verify => {
                    let discrepancies = admin.verify().await?;
                    if discrepancies.is_empty() {
                        println!("All lanes consistent.");
                    } else {
                        println!("{:<20}  {:>12}  {:>8}", "LANE", "CHECKPOINTS", "SINK");
                        for d in &discrepancies {
                            println!(
                                "{:<20}  {:>12}  {:>8}",
                                d.lane.to_string(),
                                d.checkpoint_count,
                                d.sink_count
                            );
                        }
                        anyhow::bail!("{} lane(s) inconsistent", discrepancies.len());
                    }
                }
                AdminAction::Populate { lane } => {
                    let n = admin.populate(&lane).await?;
                    println!("Enqueued {n} pending item(s) for {lane}");
                }
            }
            Ok(())
        }
        Command::Metrics => {
            let app = App::build().await?;
            let m = app.control().system_metrics().await?;
            println!("Lanes:      {} total", m.total_lanes);
            println!(
                "Status:     {} running, {} paused, {} stopped, {} error, {} restarting",
                m.running, m.paused, m.stopped, m.errored, m.restarting
            );
            println!("Processed:  {} (this run)", m.total_processed);
            println!("Completed:  {} / {}", m.total_completed, m.total_expected);
            Ok(())
        }
    }
}

async fn cmd_monitor() -> anyhow::Result<()> {
    let app = App::build().await?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: app.config.otel_endpoint.clone(),
        service_name: "lanekeeper-monitor".to_string(),
    })?;

    let monitor = HealthMonitor::new(
        Arc::clone(&app.db),
        app.supervisor(),
        Arc::clone(&app.sink),
        app.config.limits.clone(),
    );

    let shutdown = monitor.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.notify_one();
    });

    monitor.run().await?;
    Ok(())
}

async fn cmd_work(lane: LaneKey) -> anyhow::Result<()> {
    let app = App::build().await?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: app.config.otel_endpoint.clone(),
        service_name: format!("lanekeeper-worker-{lane}"),
    })?;

    let processor: Arc<dyn ItemProcessor> = match app.config.processor_command {
        Some(ref command) => Arc::new(HookProcessor::new(command.clone())),
        None => anyhow::bail!("LANE_PROCESSOR_COMMAND is not set"),
    };

    let worker = Worker::new(
        lane,
        Arc::clone(&app.db),
        Arc::clone(&app.broker),
        processor,
        Arc::clone(&app.sink),
        Arc::clone(&app.malform_log),
        app.limiter.clone(),
        app.config.limits.clone(),
    );
    worker.run().await?;
    Ok(())
}

fn print_status(report: &lanekeeper::model::LaneStatusReport) {
    println!("Lane:       {}", report.lane);
    println!("Status:     {}", report.status);
    println!(
        "PID:        {}",
        report.pid.map(|p| p.to_string()).unwrap_or("-".to_string())
    );
    if let Some(started) = report.started_at {
        println!("Started:    {started}");
    }
    match report.heartbeat_age_secs {
        Some(age) => println!(
            "Heartbeat:  {age}s ago ({})",
            if report.heartbeat_fresh { "fresh" } else { "stale" }
        ),
        None => println!("Heartbeat:  never"),
    }
    println!("Processed:  {} (this run)", report.processed_count);
    println!("Progress:   {} / {}", report.completed, report.total);
    println!("In flight:  {}", report.in_flight);
    if let Some(ref err) = report.last_error {
        println!("Last error: {err}");
    }
}

fn print_list(reports: &[lanekeeper::model::LaneStatusReport]) {
    if reports.is_empty() {
        println!("No lanes registered.");
        return;
    }
    println!(
        "{:<20}  {:<11}  {:>7}  {:>12}  {:>9}  HEARTBEAT",
        "LANE", "STATUS", "PID", "PROGRESS", "IN-FLIGHT"
    );
    println!("{}", "-".repeat(80));
    for r in reports {
        let progress = format!("{}/{}", r.completed, r.total);
        let heartbeat = match r.heartbeat_age_secs {
            Some(age) if r.heartbeat_fresh => format!("{age}s"),
            Some(age) => format!("{age}s (stale)"),
            None => "never".to_string(),
        };
        println!(
            "{:<20}  {:<11}  {:>7}  {:>12}  {:>9}  {}",
            r.lane.to_string(),
            r.status.to_string(),
            r.pid.map(|p| p.to_string()).unwrap_or("-".to_string()),
            progress,
            r.in_flight,
            heartbeat
        );
    }
    println!("\n{} lane(s)", reports.len());
}

fn print_outcomes(
    outcomes: &std::collections::BTreeMap<LaneKey, lanekeeper::model::OpOutcome>,
) {
    for (lane, outcome) in outcomes {
        if outcome.success {
            println!("{lane}: ok");
        } else {
            println!(
                "{lane}: FAILED: {}",
                outcome.error.as_deref().unwrap_or("unknown")
            );
        }
    }
    let failures = outcomes.values().filter(|o| !o.success).count();
    println!("\n{} lane(s), {} failure(s)", outcomes.len(), failures);
}
