//! corr-ctl: command-line control of a correlator cluster.
//!
//! # Usage
//!
//! ```text
//! corr-ctl [OPTIONS] <COMMAND>
//!
//! Commands:
//!   ping       Check that every board answers
//!   status     Show the sync and accumulator status registers
//!   arm        Establish a new sync epoch
//!   schedule   Start accumulation on every board at a common time
//!   init-config  Write the effective config to the config path
//!
//! Options:
//!   -c, --config <PATH>     Config file [env: CORR_CONFIG]
//!       --simulate <N>      Drive N in-memory boards instead of the config's
//!       --json              Print machine-readable JSON
//! ```
//!
//! Log output goes to stderr and is filtered by `RUST_LOG`, falling back to
//! the config's `control.log_level`.
//!
//! # Architecture overview
//!
//! ```text
//! corr-ctl  ← this process
//!   application/      arm, schedule, register access, request tracking
//!   infrastructure/
//!     network/        TCP connection per board
//!     board/          simulated boards for --simulate
//!     storage/        TOML config
//!       ↕
//! boards  (line protocol over TCP, port 7147)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use corr_control::application::arm::{arm, ArmReport};
use corr_control::application::clock::Clock;
use corr_control::application::cluster::{Cluster, SyncError};
use corr_control::application::registers::read;
use corr_control::application::schedule::{schedule_action, ScheduleReport, ScheduleTarget};
use corr_control::infrastructure::board::simulated_cluster;
use corr_control::infrastructure::clock::SystemClock;
use corr_control::infrastructure::network::connect_cluster;
use corr_control::infrastructure::storage::config::{self, CorrConfig};
use corr_core::register::catalog::{SYNC_STATUS, VACC_STATUS};
use corr_core::register::FieldValue;
use corr_core::timing::{Epoch, Timestamp, GLOBAL_EPOCH};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Correlator cluster control.
#[derive(Debug, Parser)]
#[command(name = "corr-ctl", about = "Arm and schedule a correlator cluster", version)]
struct Cli {
    /// Path to the TOML config.  Defaults to the platform config directory.
    #[arg(long, short, env = "CORR_CONFIG")]
    config: Option<PathBuf>,

    /// Drive this many simulated boards instead of connecting to hardware.
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that every board answers a watchdog request.
    Ping,
    /// Read `sync_status` and `vacc_status` from every board.
    Status,
    /// Arm all boards on the next PPS edge and establish a new epoch.
    Arm,
    /// Schedule an accumulator start on every board.
    ///
    /// Without `--sync-time` the cluster is armed first.
    Schedule {
        /// Absolute target, in Unix seconds.
        #[arg(long, conflicts_with = "delay")]
        at: Option<f64>,

        /// Target this many seconds from now.
        #[arg(long)]
        delay: Option<f64>,

        /// Use an existing epoch (Unix seconds) instead of arming.
        #[arg(long)]
        sync_time: Option<f64>,
    },
    /// Write the effective config (defaults filled in) to the config path.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (path, cfg) = load_config(&cli)?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.control.log_level)),
        )
        .init();

    if let Command::InitConfig { force } = cli.command {
        return init_config(&path, &cfg, force);
    }

    let cluster = match cli.simulate {
        Some(count) => {
            info!(count, "Using simulated boards");
            simulated_cluster(count).0
        }
        None => connect_cluster(&cfg)
            .await
            .context("failed to connect to the cluster")?,
    };
    if cluster.is_empty() {
        bail!("no boards configured; add [[boards]] entries or pass --simulate");
    }

    let clock = SystemClock;
    match cli.command {
        Command::Ping => ping(&cluster, cli.json).await,
        Command::Status => status(&cluster, cli.json).await,
        Command::Arm => run_arm(&cluster, &clock, &cfg, cli.json).await.map(|_| ()),
        Command::Schedule {
            at,
            delay,
            sync_time,
        } => {
            match sync_time {
                Some(secs) => {
                    let epoch = Epoch::new(
                        Timestamp::from_secs_f64(secs),
                        cfg.timing.counter_spec()?,
                        cfg.timing.pcnt_ratio,
                    )?;
                    GLOBAL_EPOCH.publish(epoch);
                }
                None => {
                    run_arm(&cluster, &clock, &cfg, cli.json).await?;
                }
            }
            let target = match (at, delay) {
                (Some(secs), _) => ScheduleTarget::At(Timestamp::from_secs_f64(secs)),
                (None, Some(secs)) => ScheduleTarget::At(
                    clock.now() + Duration::try_from_secs_f64(secs).context("invalid --delay")?,
                ),
                (None, None) => ScheduleTarget::Asap,
            };
            run_schedule(&cluster, &clock, &cfg, target, cli.json).await
        }
        Command::InitConfig { .. } => Ok(()),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<(PathBuf, CorrConfig)> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_file_path()?,
    };
    let lenient = cli.simulate.is_some()
        || cli.config.is_none()
        || matches!(cli.command, Command::InitConfig { .. });
    let loaded = if lenient {
        config::load_or_default(&path)
    } else {
        config::load_from(&path)
    };
    let cfg = loaded.with_context(|| format!("failed to load config from {}", path.display()))?;
    Ok((path, cfg))
}

fn init_config(path: &Path, cfg: &CorrConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    config::save_to(path, cfg)
        .with_context(|| format!("failed to write config to {}", path.display()))?;
    info!(path = %path.display(), boards = cfg.boards.len(), "Config written");
    println!("{}", path.display());
    Ok(())
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn ping(cluster: &Cluster, json: bool) -> anyhow::Result<()> {
    let results = cluster.ping_all().await;
    if json {
        #[derive(Serialize)]
        struct Ping<'a> {
            board: &'a str,
            alive: bool,
        }
        let rows: Vec<Ping<'_>> = results
            .iter()
            .map(|(id, alive)| Ping {
                board: &id.0,
                alive: *alive,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for (id, alive) in &results {
            println!("{id:<24} {}", if *alive { "ok" } else { "UNREACHABLE" });
        }
    }
    let dead = results.iter().filter(|(_, alive)| !alive).count();
    if dead > 0 {
        bail!("{dead} board(s) did not answer");
    }
    Ok(())
}

async fn status(cluster: &Cluster, json: bool) -> anyhow::Result<()> {
    let mut rows = Vec::new();
    for board in cluster.boards() {
        let mut registers = serde_json::Map::new();
        for layout in [&SYNC_STATUS, &VACC_STATUS] {
            let value = match read(board.bus.as_ref(), layout).await {
                Ok(snapshot) => serde_json::to_value(
                    snapshot
                        .iter()
                        .collect::<std::collections::BTreeMap<&str, FieldValue>>(),
                )?,
                Err(e) => serde_json::Value::String(format!("error: {e}")),
            };
            registers.insert(layout.register.to_string(), value);
        }
        rows.push(serde_json::json!({
            "board": board.id,
            "role": board.role,
            "registers": registers,
        }));
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            println!("{} ({})", row["board"].as_str().unwrap_or("?"), row["role"].as_str().unwrap_or("?"));
            if let Some(registers) = row["registers"].as_object() {
                for (name, fields) in registers {
                    println!("  {name:<14} {fields}");
                }
            }
        }
    }
    Ok(())
}

async fn run_arm(
    cluster: &Cluster,
    clock: &dyn Clock,
    cfg: &CorrConfig,
    json: bool,
) -> anyhow::Result<ArmReport> {
    let settings = cfg.arm_settings()?;
    match arm(cluster, clock, &GLOBAL_EPOCH, &settings).await {
        Ok(report) => {
            print_arm(&report, json)?;
            Ok(report)
        }
        Err(SyncError::PartialArmFailure { failed, report }) => {
            print_arm(&report, json)?;
            Err(SyncError::PartialArmFailure { failed, report }.into())
        }
        Err(other) => Err(other.into()),
    }
}

fn print_arm(report: &ArmReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    match report.sync_time {
        Some(sync_time) => println!(
            "armed: sync time {sync_time} (epoch v{})",
            report.epoch_version.unwrap_or_default()
        ),
        None => println!("arm FAILED after {} poll(s)", report.polls),
    }
    for board in &report.boards {
        println!("  {:<24} {:?}", board.board, board.status);
    }
    Ok(())
}

async fn run_schedule(
    cluster: &Cluster,
    clock: &dyn Clock,
    cfg: &CorrConfig,
    target: ScheduleTarget,
    json: bool,
) -> anyhow::Result<()> {
    let report = schedule_action(cluster, clock, &GLOBAL_EPOCH, target, &cfg.schedule_settings())
        .await
        .context("schedule failed")?;
    print_schedule(&report, json)?;
    if !report.all_committed() {
        bail!("accumulator load not confirmed on {} board(s)", report.failed().len());
    }
    Ok(())
}

fn print_schedule(report: &ScheduleReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "load at {} (pcnt {}, epoch v{}){}",
        report.target_time,
        report.target_pcnt,
        report.epoch_version,
        if report.reset_issued { ", counters reset first" } else { "" }
    );
    for board in &report.boards {
        println!("  {:<24} {:?}", board.board, board.verdict);
    }
    Ok(())
}
