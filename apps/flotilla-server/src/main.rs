use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use flotilla::registry::Registry;
use flotilla::runtime::{run, RunOptions, ShutdownOptions};
use flotilla_bootstrap::{load_config, AppConfig};

mod registered_services;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Flotilla server - runs one server of a declarative deployment
#[derive(Parser)]
#[command(name = "flotilla-server")]
#[command(about = "Flotilla server - declarative multi-server service runtime")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to a configuration file or a directory of YAML files
    #[arg(short, long)]
    config: PathBuf,

    /// Server to run: "deployment.server", a bare server name, or "first"
    #[arg(short, long, default_value = "first")]
    server: String,

    /// Print the effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the selected server
    Run,
    /// Validate configuration and exit
    Check,
}

fn apply_verbosity(config: &mut AppConfig, verbose: u8) {
    if verbose == 0 {
        return;
    }
    let level = if verbose == 1 { "debug" } else { "trace" };
    let logging = config.logging.get_or_insert_with(Default::default);
    logging
        .entry("default".to_string())
        .or_insert_with(|| flotilla_bootstrap::LogSection {
            console_level: "info".into(),
            file: String::new(),
            file_level: String::new(),
            max_backups: None,
            max_size_mb: None,
        })
        .console_level = level.to_string();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    apply_verbosity(&mut config, cli.verbose);

    flotilla_bootstrap::init_logging(config.logging.as_ref(), Path::new("."));
    tracing::info!(config = %cli.config.display(), server = %cli.server, "flotilla-server starting");

    if cli.print_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config, cli.server).await,
        Commands::Check => check_config(config, &cli.server),
    }
}

async fn run_server(config: AppConfig, server: String) -> Result<()> {
    let registry = Arc::new(Registry::new());
    registered_services::register_all(&registry, &config)?;

    run(RunOptions {
        config: config.deployment,
        registry,
        server,
        shutdown: ShutdownOptions::Signals,
    })
    .await
}

fn check_config(config: AppConfig, server: &str) -> Result<()> {
    // selection + normalization exercise the whole static config surface
    let (deployment, server) = config.deployment.select_server(server)?;
    flotilla::deploy::normalize_server(&config.deployment, &deployment, &server)?;
    println!("configuration is valid for {deployment}.{server}");
    Ok(())
}
