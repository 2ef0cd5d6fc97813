//! tunnelrack: a supervisor for frpc/frps tunnel instances.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, and either runs the supervisor (auto-start, log tailing,
//! stdin control, signal-driven shutdown) or edits the persisted settings.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing_subscriber::EnvFilter;

use tunnelrack::autostart;
use tunnelrack::config::{self, Config};
use tunnelrack::configs::ConfigStore;
use tunnelrack::control::{self, ControlCommand, Flow};
use tunnelrack::events::SupervisorEvent;
use tunnelrack::identity::{ConfigIdentity, Role};
use tunnelrack::output::{LogSnapshot, LogTail};
use tunnelrack::process::BinarySpec;
use tunnelrack::settings::SettingsStore;
use tunnelrack::supervisor::{self, Supervisor, SupervisorOptions};

const DEFAULT_CONFIG_FILE: &str = "tunnelrack.toml";
const DEFAULT_DATA_DIR: &str = "tunnelrack-data";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "tunnelrack",
    version,
    about = "Run and supervise frpc/frps tunnel configurations"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to tunnelrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any tunnelrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Directory holding frpc/, frps/ and settings.json.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the supervisor until interrupted.
    Run(RunArgs),
    /// List configurations; `*` marks auto-start entries.
    List,
    /// Add a configuration to (or remove it from) the auto-start list.
    Autostart {
        #[arg(value_enum)]
        role: Role,
        file: String,
        /// Remove instead of add.
        #[arg(long)]
        off: bool,
    },
    /// Enable or disable launching the supervisor at boot.
    Boot {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Extra configuration to start (ROLE:FILE, repeatable).
    #[arg(long = "start", value_name = "ROLE:FILE")]
    start: Vec<ConfigIdentity>,
    /// Skip the persisted auto-start list.
    #[arg(long)]
    no_autostart: bool,
    /// Exit immediately unless launch-at-boot is enabled.
    #[arg(long)]
    boot: bool,
    /// Program for client configurations.
    #[arg(long)]
    client_binary: Option<String>,
    /// Program for server configurations.
    #[arg(long)]
    server_binary: Option<String>,
    /// Time to wait after SIGTERM before force-killing (ms).
    #[arg(long)]
    grace_period_ms: Option<u64>,
    /// Upper bound on retained log bytes.
    #[arg(long)]
    max_log_bytes: Option<usize>,
    /// Strip ANSI escapes from printed output.
    #[arg(long)]
    strip_ansi: bool,
    /// Do not read control commands from stdin.
    #[arg(long)]
    no_input: bool,
}

/// Effective settings for `run`, layered from defaults, config file and flags.
#[derive(Debug, Clone)]
struct RunSettings {
    options: SupervisorOptions,
    strip_ansi: bool,
}

impl RunSettings {
    fn from_args(args: &RunArgs, config: &Config) -> Self {
        let defaults = SupervisorOptions::default();
        let client = args
            .client_binary
            .clone()
            .or_else(|| config.client_binary.clone())
            .map(BinarySpec::new)
            .unwrap_or(defaults.client);
        let server = args
            .server_binary
            .clone()
            .or_else(|| config.server_binary.clone())
            .map(BinarySpec::new)
            .unwrap_or(defaults.server);
        let grace_period = args
            .grace_period_ms
            .or(config.grace_period_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.grace_period);
        Self {
            options: SupervisorOptions {
                client: client.with_args(config.client_args.clone().unwrap_or_default()),
                server: server.with_args(config.server_args.clone().unwrap_or_default()),
                grace_period,
                max_log_bytes: args
                    .max_log_bytes
                    .or(config.max_log_bytes)
                    .unwrap_or(defaults.max_log_bytes),
            },
            strip_ansi: args.strip_ansi || config.strip_ansi.unwrap_or(false),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let file_config = load_file_config(&cli)?;
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| file_config.data_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let configs = ConfigStore::new(&data_dir);
    let settings = SettingsStore::in_dir(&data_dir);

    match cli.command {
        Commands::Run(args) => run(args, &file_config, configs, settings).await,
        Commands::List => list(&configs, &settings),
        Commands::Autostart { role, file, off } => {
            let identity = ConfigIdentity::try_new(role, file)?;
            if !off && !configs.exists(&identity) {
                bail!("no config file at {}", configs.path(&identity)?.display());
            }
            let changed = settings.update(|s| s.set_auto_start(role, identity.file_name(), !off))?;
            if changed {
                println!("{} auto-start {}", identity, if off { "disabled" } else { "enabled" });
            }
            Ok(())
        }
        Commands::Boot { state } => {
            let on = state == Toggle::On;
            settings.update(|s| s.launch_at_boot = on)?;
            println!("launch at boot {}", if on { "enabled" } else { "disabled" });
            Ok(())
        }
    }
}

fn load_file_config(cli: &Cli) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    let path = cli
        .config
        .clone()
        .or_else(|| default_config_path().filter(|path| path.exists()));
    match path {
        Some(path) => config::load_config(&path),
        None => Ok(Config::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

async fn run(
    args: RunArgs,
    file_config: &Config,
    configs: ConfigStore,
    settings: SettingsStore,
) -> Result<()> {
    if args.boot && !settings.load()?.launch_at_boot {
        tracing::info!("launch at boot is disabled");
        return Ok(());
    }
    configs.prepare()?;

    let run_settings = RunSettings::from_args(&args, file_config);
    let supervisor = Supervisor::new(run_settings.options.clone());
    let (tail_done, tail_done_rx) = oneshot::channel();
    let tail = tokio::spawn(tail_log(
        supervisor.log().subscribe(),
        run_settings.strip_ansi,
        tail_done_rx,
    ));

    let reporter = tokio::spawn(report_events(supervisor.events()));

    let (control_tx, mut control_rx) = mpsc::channel(16);
    spawn_signal_listener(control_tx.clone())?;

    if !args.no_autostart {
        autostart::launch(&supervisor, &configs, &settings).await;
    }
    for identity in &args.start {
        let result = match configs.path(identity) {
            Ok(path) => supervisor.start(identity, &path).await.map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::error!(identity = %identity, error = %err, "start failed");
        }
    }

    if !args.no_input {
        control::spawn_stdin_listener(control_tx);
    } else {
        drop(control_tx);
    }

    while let Some(command) = control_rx.recv().await {
        match control::execute(command, &supervisor, &configs).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(err) => eprintln!("{:#}", err),
        }
    }

    supervisor.shutdown_all().await;
    reporter.abort();
    let _ = tail_done.send(());
    let _ = tail.await;
    Ok(())
}

// Spawns and self-exits are already logged by the supervisor; requested stops
// are reported here with their exit code.
async fn report_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::Exited {
                identity,
                code,
                requested: true,
            }) => {
                tracing::info!(identity = %identity, code = ?code, "tunnel stopped");
            }
            Ok(event) => tracing::debug!(?event, "lifecycle event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "lifecycle events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// Print log text as it arrives; on `done`, flush what is left and return.
async fn tail_log(
    mut rx: watch::Receiver<LogSnapshot>,
    strip_ansi: bool,
    mut done: oneshot::Receiver<()>,
) {
    let mut tail = LogTail::new(strip_ansi);
    loop {
        let finished = tokio::select! {
            changed = rx.changed() => changed.is_err(),
            _ = &mut done => true,
        };
        let fresh = tail.take(&rx.borrow_and_update());
        if !fresh.is_empty() {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(fresh.as_bytes());
            let _ = stdout.flush();
        }
        if finished {
            break;
        }
    }
}

// Handlers are registered before returning, so a signal that arrives while
// auto-start is still spawning children is not lost.
fn spawn_signal_listener(tx: mpsc::Sender<ControlCommand>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("shutdown requested");
            let _ = tx.send(ControlCommand::Quit).await;
        });
    }
    #[cfg(not(unix))]
    {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::spawn(async move {
            let _ = ctrl_c.await;
            tracing::info!("shutdown requested");
            let _ = tx.send(ControlCommand::Quit).await;
        });
    }
    Ok(())
}

fn list(configs: &ConfigStore, settings: &SettingsStore) -> Result<()> {
    // Listing doubles as the refresh that drops stale auto-start entries.
    let (survivors, _) = autostart::prune_missing(configs, settings)?;
    for role in Role::ALL {
        println!("{} ({}):", role, role.dir_name());
        let identities = configs.list(role)?;
        if identities.is_empty() {
            println!("  (none)");
        }
        for identity in identities {
            let mark = if survivors.contains(&identity) { "*" } else { " " };
            println!("  {} {}", mark, identity.file_name());
        }
    }
    Ok(())
}
