use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};
use warden_core::{ComponentFilter, StateKind, WardenConfig, WardenError};
use warden_runtime::Warden;

mod output;

const DEFAULT_CONFIG: &str = "warden.toml";

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "warden: lifecycle and resource governor for security-analysis components"
)]
struct Cli {
    /// Config file. Defaults to ./warden.toml, or built-in defaults if that
    /// does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config and print the effective settings
    CheckConfig,
    /// List registered components
    List {
        /// Only components in this state (active, dormant, disabled, transitioning)
        #[arg(long)]
        state: Option<StateKind>,
        #[arg(long)]
        json: bool,
    },
    /// Show one component
    Show { id: String },
    /// Return a disabled component to dormant
    Enable { id: String },
    /// Take a component out of service
    Disable {
        id: String,
        #[arg(long, default_value = "disabled by operator")]
        reason: String,
    },
    /// Budget committed by active components
    Budget {
        #[arg(long)]
        json: bool,
    },
    /// Delete snapshots beyond the retention count
    Gc {
        /// Only this component's snapshots
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout is for command output.
    let subscriber = fmt()
        .with_env_filter(EnvFilter::from_env("WARDEN_LOG"))
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<WardenError>()
                .map_or(1, WardenError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

/// Explicit `--config` must exist; the implicit default may be absent.
fn load_config(path: Option<&Path>) -> Result<(WardenConfig, Option<PathBuf>)> {
    match path {
        Some(path) => Ok((WardenConfig::from_file(path)?, Some(path.to_path_buf()))),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Ok((WardenConfig::from_file(&default)?, Some(default)))
            } else {
                tracing::debug!("No {DEFAULT_CONFIG} found; using built-in defaults");
                Ok((WardenConfig::from_toml_str("")?, None))
            }
        }
    }
}

async fn open(config: WardenConfig) -> Result<Warden> {
    Warden::open(config)
        .await
        .context("failed to open warden stores")
}

async fn run(cli: Cli) -> Result<()> {
    let (config, source) = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig => output::print_config(&config, source.as_deref())?,
        Commands::List { state, json } => {
            let warden = open(config).await?;
            let filter = state.map_or_else(ComponentFilter::all, ComponentFilter::in_state);
            let components = warden.admin().list_components(filter).await?;
            if json {
                output::print_json(&components)?;
            } else {
                output::print_components(&components);
            }
        }
        Commands::Show { id } => {
            let warden = open(config).await?;
            output::print_json(&warden.admin().get_component(&id).await?)?;
        }
        Commands::Enable { id } => {
            let warden = open(config).await?;
            let status = warden.admin().enable(&id).await?;
            println!("{} is now {}", status.id, status.state);
        }
        Commands::Disable { id, reason } => {
            let warden = open(config).await?;
            let status = warden.admin().disable(&id, &reason).await?;
            println!("{} is now {}", status.id, status.state);
        }
        Commands::Budget { json } => {
            let warden = open(config).await?;
            let budget = warden.admin().committed_budget().await?;
            if json {
                output::print_json(&budget)?;
            } else {
                output::print_budget(&budget);
            }
        }
        Commands::Gc { id } => {
            let warden = open(config).await?;
            let removed = warden.admin().gc(id.as_deref()).await?;
            println!("removed {removed} snapshot(s)");
        }
    }
    Ok(())
}
