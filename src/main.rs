//! awg-peerd CLI
//!
//! Runs the provisioning daemon, validates a settings file, or works with
//! keys in the same text format `awg genkey` / `awg pubkey` use.

use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use awg_peerd::config::{DriverKind, DEFAULT_CONFIG_PATH};
use awg_peerd::error::{ConfigError, DriverError, StorageError};
use awg_peerd::{daemon, Key, KeyProvider, OsKeyProvider, PeerRegistry, PeerdError, Settings};

/// awg-peerd - AmneziaWG peer provisioning daemon
#[derive(Parser, Debug)]
#[command(name = "awg-peerd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the settings file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the interface and serve the REST API
    Serve {
        /// Override `api.listen`
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Validate settings and registry, then print a summary
    Check,
    /// Print a new base64 private key
    Genkey,
    /// Read a base64 private key from stdin and print its public key
    Pubkey,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // RUST_LOG wins over the defaults
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), PeerdError> {
    match args.command {
        Command::Serve { listen } => {
            let settings = load_settings(&args.config)?;
            tracing::info!("awg-peerd {} starting...", env!("CARGO_PKG_VERSION"));
            daemon::serve(settings, listen).await
        }
        Command::Check => check(&args.config),
        Command::Genkey => {
            let pair = OsKeyProvider.generate()?;
            println!("{}", pair.private_key);
            Ok(())
        }
        Command::Pubkey => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            let private = Key::from_base64(input.trim())?;
            println!("{}", private.public_key());
            Ok(())
        }
    }
}

fn load_settings(path: &Path) -> Result<Settings, PeerdError> {
    tracing::info!("Loading settings from: {}", path.display());
    let settings = Settings::load(path)?;

    if settings.interface.driver == DriverKind::Awg && !is_root() {
        tracing::warn!(
            "Not running as root; `{}` needs CAP_NET_ADMIN to change {}",
            settings.interface.tool,
            settings.interface.name
        );
    }
    Ok(settings)
}

fn check(path: &Path) -> Result<(), PeerdError> {
    let settings = load_settings(path)?;
    let identity = settings.server_identity()?;
    let registry = PeerRegistry::open(&settings.storage.data_dir)?;

    let mut pool = settings.address_pool();
    for record in registry.list() {
        pool.reserve(record.address).map_err(PeerdError::Pool)?;
    }

    println!("Server key:  {}", identity.public_key);
    println!("Endpoint:    {}", identity.endpoint);
    println!("Subnet:      {} (server {})", identity.subnet, settings.server_address());
    println!("Interface:   {} ({:?} driver)", settings.interface.name, settings.interface.driver);
    println!("Registry:    {}", registry.path().display());
    println!(
        "Peers:       {} ({} of {} addresses free)",
        registry.len(),
        pool.free_count(),
        pool.capacity()
    );
    Ok(())
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Get user-friendly error message
fn user_message(error: &PeerdError) -> String {
    match error {
        PeerdError::Config(ConfigError::FileNotFound { path }) => {
            format!("Settings file not found: {}\n  \
                    Pass --config or create {}.", path, DEFAULT_CONFIG_PATH)
        }

        PeerdError::Config(ConfigError::InvalidKey { field }) => {
            format!("Invalid {} in configuration.\n  \
                    Expected 32-byte base64-encoded key.", field)
        }

        PeerdError::Driver(DriverError::Spawn { command, .. }) => {
            format!("{}\n  \
                    Is amneziawg-tools installed? `{}` must be on PATH (see interface.tool).",
                    error, command.split_whitespace().next().unwrap_or_default())
        }

        PeerdError::Storage(StorageError::Corrupt { path, .. }) => {
            format!("{}\n  \
                    Restore {} from a backup; it is never rewritten automatically.",
                    error, path.display())
        }

        _ => format!("{}", error),
    }
}
