//! Redfire CWMP agent daemon

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use fs2::FileExt;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use redfire_cwmp::{
    config::AgentConfig,
    core::daemon::{Daemon, Engine, Trigger},
    services::backup::BackupStore,
    services::connreq::ConnReqServer,
    services::control::ControlServer,
    services::datamodel::{DataModelProvider, ExternalProvider},
    services::netmon::InterfaceWatcher,
    utils::setup_logging,
    Result,
};

const PID_FILE: &str = "/var/run/redfire-cwmpd.pid";

#[derive(Parser)]
#[command(name = "redfire-cwmpd")]
#[command(about = "TR-069 CWMP client agent")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run in the foreground
    #[arg(short, long)]
    foreground: bool,

    /// Run with a "1 BOOT" event
    #[arg(short, long)]
    boot: bool,

    /// Run with a "2 PERIODIC" event and with ACS GetRPCMethods
    #[arg(short, long)]
    getrpcmethod: bool,

    /// Display the version
    #[arg(short = 'v', long)]
    version: bool,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("{} version: {}", redfire_cwmp::NAME, redfire_cwmp::VERSION);
        return Ok(());
    }

    if cli.generate_config {
        let config = AgentConfig::default_config();
        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| redfire_cwmp::Error::internal(format!("cannot render config: {}", e)))?;
        println!("{}", rendered);
        return Ok(());
    }

    let config = load_configuration(&cli)?;
    let _log_guard = setup_logging(&config.logging)?;

    if let Err(e) = config.validate() {
        error!("configuration loading failed, exit daemon: {}", e);
        std::process::exit(1);
    }

    // The lock lives as long as this binding; dropping it would let a
    // second instance in.
    let _pid_file = match acquire_pid_file(Path::new(PID_FILE)) {
        // A second start is not an error.
        Ok(None) => {
            info!("daemon already running, exiting");
            return Ok(());
        }
        Ok(Some(file)) => file,
        Err(e) => {
            error!("cannot acquire pid file {}: {}", PID_FILE, e);
            std::process::exit(1);
        }
    };

    info!("Starting {} v{}", redfire_cwmp::NAME, redfire_cwmp::VERSION);
    if !cli.foreground {
        info!("daemonization is delegated to the service manager");
    }

    run_daemon(config, &cli).await
}

fn load_configuration(cli: &Cli) -> Result<AgentConfig> {
    let config = if let Some(config_path) = &cli.config {
        AgentConfig::load_from_file(config_path)?
    } else {
        match AgentConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => AgentConfig::default_config(),
        }
    };
    Ok(config)
}

/// Double-start guard: take an exclusive flock on the pid file and record
/// our pid behind it. `None` means another instance holds the lock; the
/// lock itself is released only when the returned file is dropped at
/// process exit.
fn acquire_pid_file(path: &Path) -> std::io::Result<Option<std::fs::File>> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    if file.try_lock_exclusive().is_err() {
        return Ok(None);
    }
    file.set_len(0)?;
    write!(file, "{}", std::process::id())?;
    Ok(Some(file))
}

async fn run_daemon(config: AgentConfig, cli: &Cli) -> Result<()> {
    let mut provider = ExternalProvider::new(&config.provider.command);
    let device_id = match provider.device_id().await {
        Ok(device_id) => device_id,
        Err(e) => {
            warn!("cannot read device identity from the provider: {}", e);
            Default::default()
        }
    };

    let backup = BackupStore::load(&config.local.backup_file);
    let mut engine = Engine::new(
        config.clone(),
        cli.config.clone(),
        device_id,
        backup,
        Box::new(provider),
    );
    let inform_pending = engine.startup(cli.boot, cli.getrpcmethod)?;

    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

    // The listener port is config-fatal: bind before entering the loop.
    let listener = TcpListener::bind(("0.0.0.0", config.local.port))
        .await
        .map_err(|e| {
            error!("cannot bind connection-request port {}: {}", config.local.port, e);
            e
        })?;
    let connreq = ConnReqServer::new(&config.local, trigger_tx.clone());
    tokio::spawn(async move {
        if let Err(e) = connreq.run_on(listener).await {
            error!("connection-request listener failed: {}", e);
        }
    });

    let control = ControlServer::new(&config.local.control_socket, trigger_tx.clone());
    tokio::spawn(async move {
        if let Err(e) = control.run().await {
            warn!("control socket initialization failed: {}", e);
        }
    });

    let watcher = InterfaceWatcher::new(&config.local.interface, trigger_tx.clone());
    tokio::spawn(watcher.run());

    let shutdown_tx = trigger_tx.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down gracefully");
            let _ = shutdown_tx.send(Trigger::Stop);
        }
    });

    info!("daemon started");
    let mut daemon = Daemon::new(engine, trigger_rx, inform_pending);
    daemon.run().await?;

    info!("exiting");
    Ok(())
}
