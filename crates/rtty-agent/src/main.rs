//! rtty agent entrypoint
//!
//! Parses the CLI into the configuration record, sets up logging and the
//! runtime signal handlers, then hands over to the client loop. The `-R`
//! and `-S` flags short-circuit into transfer helper mode instead.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use rtty_agent::transfer;
use rtty_agent::Client;
use rtty_core::config::{DEFAULT_HEARTBEAT, DEFAULT_PORT};
use rtty_core::Config;

#[derive(Parser)]
#[command(name = "rtty")]
#[command(about = "Access your terminal from anywhere via the web")]
#[command(version, disable_help_flag = true)]
struct Args {
    /// Show help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Set an ID for the device (max 32 chars, no spaces allowed)
    #[arg(short = 'I', long)]
    id: Option<String>,

    /// Set a group for the device (max 16 chars, no spaces allowed)
    #[arg(short = 'g', long)]
    group: Option<String>,

    /// Server's host or ipaddr
    #[arg(short = 'h', long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Add a description to the device (maximum 126 bytes)
    #[arg(short = 'd', long)]
    description: Option<String>,

    /// Auto reconnect to the server
    #[arg(short = 'a', long)]
    reconnect: bool,

    /// Set heartbeat interval in seconds
    #[arg(short = 'i', long, default_value_t = DEFAULT_HEARTBEAT)]
    heartbeat: u8,

    /// SSL on
    #[arg(short = 's', long)]
    ssl: bool,

    /// CA certificate to verify peer against
    #[arg(short = 'C', long)]
    cacert: Option<PathBuf>,

    /// Allow insecure server connections when using SSL
    #[arg(short = 'x', long)]
    insecure: bool,

    /// Certificate file to use
    #[arg(short = 'c', long)]
    cert: Option<PathBuf>,

    /// Private key file to use
    #[arg(short = 'k', long)]
    key: Option<PathBuf>,

    /// Run in the background
    #[arg(short = 'D', long)]
    daemon: bool,

    /// Authorization token
    #[arg(short = 't', long)]
    token: Option<String>,

    /// Receive file
    #[arg(short = 'R')]
    recv: bool,

    /// Send file
    #[arg(short = 'S', value_name = "PATH")]
    send: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Skip a second login authentication. See man login(1) about the details
    #[arg(short = 'f', long = "username")]
    username: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.recv {
        transfer::request(None).await;
        return Ok(());
    }

    if let Some(path) = &args.send {
        transfer::request(Some(path)).await;
        return Ok(());
    }

    install_panic_hook();
    let reload_handle = init_logging(args.verbose);

    if args.daemon {
        tracing::warn!("daemonization is left to the service manager, staying in the foreground");
    }

    tracing::info!("rtty version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("OS/Arch: {}/{}", std::env::consts::OS, std::env::consts::ARCH);

    #[cfg(unix)]
    {
        if !nix::unistd::geteuid().is_root() {
            bail!("operation not permitted, must be run as root");
        }
        spawn_debug_signal_handler(reload_handle);
    }
    #[cfg(not(unix))]
    let _ = reload_handle;

    let mut cfg = Config {
        id: args.id.unwrap_or_default(),
        group: args.group,
        description: args.description,
        host: args.host,
        port: args.port,
        heartbeat: args.heartbeat,
        token: args.token,
        username: args.username,
        reconnect: args.reconnect,
        ssl: args.ssl,
        cacert: args.cacert,
        cert: args.cert,
        key: args.key,
        insecure: args.insecure,
    };
    cfg.validate()?;

    Client::new(cfg).run().await
}

fn init_logging(verbose: bool) -> reload::Handle<EnvFilter, Registry> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| level.into()));

    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    handle
}

/// SIGUSR1 raises the log level to debug on a running agent.
#[cfg(unix)]
fn spawn_debug_signal_handler(handle: reload::Handle<EnvFilter, Registry>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let Ok(mut stream) = signal(SignalKind::user_defined1()) else {
            return;
        };

        while stream.recv().await.is_some() {
            if handle.reload(EnvFilter::new("debug")).is_ok() {
                tracing::debug!("Debug mode enabled");
            }
        }
    });
}

/// A panic means corrupted state: log it and exit instead of limping on.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!("{info}");
        tracing::error!("{backtrace}");
        std::process::exit(2);
    }));
}
