//! qdiskd - Disk-Based Quorum Daemon
//!
//! Heartbeats through a shared quorum disk and feeds the result to the
//! cluster manager as a tiebreaker vote.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qdiskd::cluster::{ClusterManager, SocketClusterManager};
use qdiskd::config::{QuorumdConfig, DEFAULT_CONFIG_PATH};
use qdiskd::daemon::{stop_cluster_on_failure, QuorumDaemon};
use qdiskd::disk::{check_node_id, scan, QuorumDisk};
use qdiskd::failsafe::RebootFailSafe;
use qdiskd::heuristic::{HeuristicScorer, Score, ScoreCell};
use qdiskd::protocol::{QuorumHeader, StatusBlock, MAX_NODES_DISK};
use qdiskd::sys;

/// How often to retry while the cluster manager is not up
const CLUSTER_RETRY: Duration = Duration::from_secs(2);

/// qdiskd - Disk-Based Quorum Daemon
#[derive(Parser)]
#[command(name = "qdiskd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Debug mode: never reboot, dump node state in the status report
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the quorum daemon (default)
    Run,

    /// Write a fresh quorum header and blank status blocks to a device
    Init {
        /// Device to initialize
        #[arg(short, long)]
        device: PathBuf,

        /// Label to identify the quorum disk by
        #[arg(short, long)]
        label: String,
    },

    /// Scan the system for quorum disks
    List,

    /// Print the header and every status block of a quorum disk
    Dump {
        /// Device to read
        #[arg(short, long)]
        device: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(cli.config, cli.log_level, cli.debug).await,
        Commands::Init { device, label } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_init(&device, &label)
        }
        Commands::List => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            run_list()
        }
        Commands::Dump { device, json } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            run_dump(&device, json)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the quorum daemon until signalled or a fatal error occurs
async fn run_daemon(
    config_path: PathBuf,
    log_level: Option<String>,
    debug: bool,
) -> anyhow::Result<()> {
    let loaded = QuorumdConfig::from_file(&config_path);

    let level = match (&log_level, &loaded) {
        (Some(level), _) => level.clone(),
        (None, _) if debug => "debug".to_string(),
        (None, Ok(config)) => config.logging.level.clone(),
        (None, Err(_)) => "info".to_string(),
    };
    init_logging(&level);

    let config = loaded.with_context(|| {
        format!("Failed to load configuration from {}", config_path.display())
    })?;

    if !sys::is_root() {
        if !debug {
            bail!("qdiskd must be run as root");
        }
        tracing::warn!("Not running as root; continuing in debug mode");
    }

    tracing::info!("Starting qdiskd");
    let cancel = CancellationToken::new();
    let failsafe = RebootFailSafe::new(debug);
    let mut cluster = SocketClusterManager::new(&config.quorumd.cluster_socket);

    wait_for_cluster(&mut cluster).await?;
    let my_id = cluster
        .local_node_id()
        .context("Could not determine local node ID")?;
    tracing::info!("Local node ID is {}", my_id);
    check_node_id(my_id).context("Local node ID cannot use the quorum disk")?;

    let disk = match open_quorum_disk(&config) {
        Ok(disk) => disk,
        Err(e) => {
            tracing::error!("Unable to open quorum disk: {:#}", e);
            stop_cluster_on_failure(&mut cluster, &failsafe, config.quorumd.stop_cman)?;
            return Err(e);
        }
    };

    let max_score = config.max_score();
    if config.quorumd.min_score > max_score {
        tracing::warn!(
            "min_score {} is above the maximum possible score {}",
            config.quorumd.min_score,
            max_score
        );
    }

    // Scorer task
    let score_cancel = CancellationToken::new();
    let (cell, scorer) = if config.heuristics.is_empty() {
        tracing::debug!("Permanently setting score to 1/1");
        (ScoreCell::new(Score::FIXED), None)
    } else {
        let cell = ScoreCell::new(Score {
            score: 0,
            max: max_score,
        });
        let scorer =
            HeuristicScorer::from_config(&config.heuristics, cell.clone(), score_cancel.clone());
        (cell, Some(scorer.spawn()))
    };

    let scheduler = config.quorumd.scheduler;
    let priority = config.quorumd.priority;
    let mut daemon = QuorumDaemon::new(
        config,
        my_id,
        disk,
        Box::new(cluster),
        Box::new(failsafe),
        cell,
        cancel.clone(),
    )
    .with_debug(debug)
    .with_config_path(config_path);
    let reconfig = daemon.reconfigure_flag();

    let signals = tokio::spawn(handle_signals(cancel.clone(), reconfig));

    // Quorum loop on its own thread so scheduling and timing are ours
    let handle = std::thread::Builder::new()
        .name("quorum-loop".to_string())
        .spawn(move || -> qdiskd::Result<()> {
            sys::set_priority(scheduler, priority);
            sys::lock_memory();

            if let Err(e) = daemon.init() {
                tracing::error!("Initialization failed: {}", e);
                daemon.stop_cluster()?;
                return Err(e);
            }
            daemon.register()?;
            daemon.run()
        })
        .context("Failed to start quorum loop thread")?;

    let joined = tokio::task::spawn_blocking(move || handle.join()).await;

    signals.abort();
    score_cancel.cancel();
    if let Some(scorer) = scorer {
        if let Err(e) = scorer.await {
            tracing::warn!("Score task failed: {}", e);
        }
    }

    match joined {
        Ok(Ok(result)) => result.map_err(anyhow::Error::from),
        Ok(Err(_)) => Err(anyhow!("Quorum loop panicked")),
        Err(e) => Err(e.into()),
    }?;

    tracing::info!("qdiskd stopped");
    Ok(())
}

/// Block until the cluster manager is reachable and active
async fn wait_for_cluster(cluster: &mut SocketClusterManager) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut logged = false;

    loop {
        match cluster.is_active() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => tracing::debug!("Cluster manager not reachable: {}", e),
        }

        if !logged {
            tracing::warn!("Waiting for the cluster manager to become active");
            logged = true;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => bail!("Interrupted while waiting for the cluster manager"),
            _ = sigterm.recv() => bail!("Terminated while waiting for the cluster manager"),
            _ = tokio::time::sleep(CLUSTER_RETRY) => {}
        }
    }
}

/// Resolve the configured label or device and validate it
fn open_quorum_disk(config: &QuorumdConfig) -> anyhow::Result<QuorumDisk> {
    let path = match (&config.quorumd.label, &config.quorumd.device) {
        (Some(label), _) => PathBuf::from(scan::find_by_label(label)?),
        (None, Some(device)) => device.clone(),
        (None, None) => bail!("No quorum device or label configured"),
    };

    let (disk, header) = scan::open_device(&path)
        .with_context(|| format!("Invalid quorum device {}", path.display()))?;
    tracing::info!(
        "Quorum Partition: {} Label: {}",
        path.display(),
        header.cluster
    );
    Ok(disk)
}

/// SIGINT/SIGTERM stop the daemon; SIGHUP reloads its configuration
async fn handle_signals(cancel: CancellationToken, reconfig: Arc<AtomicBool>) {
    let (mut sigterm, mut sighup) =
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(term), Ok(hup)) => (term, hup),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down");
                cancel.cancel();
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                cancel.cancel();
            }
            _ = sighup.recv() => {
                tracing::info!("Received SIGHUP, reloading configuration");
                reconfig.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Initialize a quorum disk
fn run_init(device: &Path, label: &str) -> anyhow::Result<()> {
    if label.is_empty() {
        bail!("Label cannot be empty");
    }
    scan::init_disk(device, label)
        .with_context(|| format!("Failed to initialize {}", device.display()))?;
    println!("Initialized {} with label '{}'", device.display(), label);
    Ok(())
}

/// List every device carrying a quorum header
fn run_list() -> anyhow::Result<()> {
    let disks = scan::scan().context("Failed to scan for quorum disks")?;
    if disks.is_empty() {
        println!("No quorum disks found");
        return Ok(());
    }

    for disk in disks {
        println!("{}:", disk.path);
        print_header(&disk.header);
        println!();
    }
    Ok(())
}

fn print_header(header: &QuorumHeader) {
    let created = chrono::DateTime::from_timestamp(header.timestamp as i64, 0)
        .map(|t| t.to_rfc2822())
        .unwrap_or_else(|| header.timestamp.to_string());

    println!("\tMagic:                {:08x}", header.version);
    println!("\tLabel:                {}", header.cluster);
    println!("\tCreated:              {}", created);
    println!("\tHost:                 {}", header.update_host);
    println!("\tKernel Sector Size:   {}", header.kernel_block_size);
    println!("\tRecorded Sector Size: {}", header.block_size);
}

/// One slot as shown by `dump`
#[derive(Serialize)]
#[serde(untagged)]
enum SlotDump {
    Block(StatusBlock),
    Unreadable { node_id: u32, error: String },
}

#[derive(Serialize)]
struct DiskDump {
    device: String,
    header: QuorumHeader,
    slots: Vec<SlotDump>,
}

/// Print the header and every status block of a device
fn run_dump(device: &Path, json: bool) -> anyhow::Result<()> {
    let (disk, header) = scan::open_device(device)
        .with_context(|| format!("Invalid quorum device {}", device.display()))?;

    let slots = (1..=MAX_NODES_DISK as u32)
        .map(|node_id| match disk.read_status(node_id) {
            Ok((block, _)) => SlotDump::Block(block),
            Err(e) => SlotDump::Unreadable {
                node_id,
                error: e.to_string(),
            },
        })
        .collect();

    let dump = DiskDump {
        device: device.display().to_string(),
        header,
        slots,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&dump)?);
        return Ok(());
    }

    println!("{}:", dump.device);
    print_header(&dump.header);
    for slot in &dump.slots {
        println!();
        match slot {
            SlotDump::Block(block) => {
                println!("Status block for node {}", block.node_id);
                println!("\tLast updated by node {}", block.update_node);
                println!("\tLast updated at {}", block.timestamp);
                println!("\tState: {}", block.state);
                println!("\tFlags: {:04x}", block.flags);
                println!("\tScore: {}/{}", block.score, block.score_max);
                println!(
                    "\tAverage Cycle speed: {}.{:06} seconds",
                    block.average_cycle.as_secs(),
                    block.average_cycle.subsec_micros()
                );
                println!(
                    "\tLast Cycle speed: {}.{:06} seconds",
                    block.last_cycle.as_secs(),
                    block.last_cycle.subsec_micros()
                );
                println!("\tIncarnation: {:016x}", block.incarnation);
                println!(
                    "\tMessage: {:?} arg={} seq={}",
                    block.message.id, block.message.arg, block.message.seq
                );
                println!("\tMembership: {}", block.mask);
                println!("\tMaster mask: {}", block.master_mask);
            }
            SlotDump::Unreadable { node_id, error } => {
                println!("Status block for node {}: unreadable ({})", node_id, error);
            }
        }
    }
    Ok(())
}
