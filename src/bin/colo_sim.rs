use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colo::sim::SimNode;
use colo::{
    accept_session, connect_session, CheckpointConfig, CheckpointSession, FailoverSignal,
    MetricsRegistry, MetricsSnapshot, PrimaryCoordinator, SecondaryProcessor, SessionExit,
    StatisticsSnapshot, Takeover, VmControl,
};
use env_logger::Env;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug, Clone)]
#[command(about = "Run a simulated primary/secondary checkpoint session over loopback TCP")]
struct Cli {
    /// Path to a checkpoint configuration YAML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest memory size in pages
    #[arg(long, default_value_t = 256)]
    pages: usize,

    /// Run time before the guest is shut down
    #[arg(long, default_value_t = 3000)]
    duration_ms: u64,

    /// Overrides the configured checkpoint period
    #[arg(long)]
    checkpoint_period_ms: Option<u64>,

    /// Request a manual failover after this many milliseconds
    #[arg(long)]
    failover_after_ms: Option<u64>,

    /// Side that receives the manual failover request
    #[arg(long, value_enum, default_value_t = Side::Secondary)]
    failover_side: Side,

    /// Seed for the simulated guest workload
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// env_logger-style filter string (e.g. "info,colo=debug"); overrides RUST_LOG/defaults
    #[arg(long)]
    log_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Side {
    Primary,
    Secondary,
}

const DEFAULT_LOG_FILTER: &str = "info,colo=info";
const GUEST_TICK: Duration = Duration::from_millis(1);

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    builder.format(|buf, record| {
        let ts = buf.timestamp();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

#[derive(Debug, Serialize)]
struct Report {
    primary_exit: SessionExit,
    secondary_exit: SessionExit,
    secondary_handoff: Option<Takeover>,
    statistics: StatisticsSnapshot,
    metrics: MetricsSnapshot,
}

fn spawn_guest(node: &SimNode, seed: u64, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    let machine = node.machine.clone();
    thread::spawn(move || {
        let mut rng = StdRng::seed_from_u64(seed);
        while !stop.load(Ordering::Relaxed) {
            machine.guest_tick(&mut rng);
            thread::sleep(GUEST_TICK);
        }
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());

    let mut config = match &cli.config {
        Some(path) => CheckpointConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CheckpointConfig::default(),
    };
    if let Some(period) = cli.checkpoint_period_ms {
        config.checkpoint_period_ms = period;
    }
    config.validate().context("invalid checkpoint configuration")?;

    let listener = TcpListener::bind("127.0.0.1:0").context("binding loopback listener")?;
    let addr = listener.local_addr()?;
    let primary_channel = connect_session(addr).context("connecting to secondary")?;
    let secondary_channel = accept_session(&listener).context("accepting primary")?;
    info!("event=colo_sim_session_open addr={addr} pages={}", cli.pages);

    let primary_node = SimNode::new(cli.pages);
    let secondary_node = SimNode::new(cli.pages);

    let primary_session = CheckpointSession::new(
        primary_channel,
        config.clone(),
        Arc::new(FailoverSignal::new()),
    );
    let secondary_session = CheckpointSession::new(
        secondary_channel,
        config.clone(),
        Arc::new(FailoverSignal::new()),
    );
    let (handoff_tx, handoff_rx) = mpsc::channel();
    let coordinator = PrimaryCoordinator::new(primary_session, primary_node.collaborators());
    let processor = SecondaryProcessor::new(secondary_session, secondary_node.collaborators())
        .with_handoff(handoff_tx);
    let primary_control = coordinator.control();
    let secondary_control = processor.control();

    let stop_guests = Arc::new(AtomicBool::new(false));
    let guests = vec![
        spawn_guest(&primary_node, cli.seed, stop_guests.clone()),
        spawn_guest(&secondary_node, cli.seed, stop_guests.clone()),
    ];

    let started = Instant::now();
    let secondary = thread::spawn(move || processor.run());
    let primary = thread::spawn(move || coordinator.run());

    match cli.failover_after_ms {
        Some(delay) => {
            thread::sleep(Duration::from_millis(delay));
            let requested = match cli.failover_side {
                Side::Primary => primary_control.request_failover(),
                Side::Secondary => secondary_control.request_failover(),
            };
            info!(
                "event=colo_sim_failover side={:?} requested={requested}",
                cli.failover_side
            );
        }
        None => {
            thread::sleep(Duration::from_millis(cli.duration_ms));
            primary_control.request_guest_shutdown();
        }
    }

    let secondary_exit = secondary
        .join()
        .map_err(|_| anyhow::anyhow!("secondary loop panicked"))?;
    let primary_exit = primary
        .join()
        .map_err(|_| anyhow::anyhow!("primary loop panicked"))?;
    let secondary_handoff = handoff_rx.try_recv().ok();
    if let Some(takeover) = secondary_handoff {
        // generic resumption path: continue from the last applied checkpoint
        secondary_node.machine.start();
        info!(
            "event=colo_sim_resumed role=secondary applied_checkpoints={}",
            takeover.applied_checkpoints
        );
    }
    stop_guests.store(true, Ordering::Relaxed);
    for guest in guests {
        guest
            .join()
            .map_err(|_| anyhow::anyhow!("guest thread panicked"))?;
    }

    let statistics = primary_control.statistics();
    let mut registry = MetricsRegistry::new("colo");
    registry.inc_counter("sim.sessions", 1);
    registry.set_duration_gauge("sim.run", started.elapsed());
    primary_control.publish_metrics(&mut registry);
    let report = Report {
        primary_exit,
        secondary_exit,
        secondary_handoff,
        statistics,
        metrics: registry.snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    ensure_not_terminated(&report)
}

/// A terminated secondary stands for a forced process exit, so the run fails
/// even though the report is printed.
fn ensure_not_terminated(report: &Report) -> Result<()> {
    if report.secondary_exit == SessionExit::Terminated {
        anyhow::bail!("secondary terminated: checkpoint channel lost without a failover request");
    }
    Ok(())
}
