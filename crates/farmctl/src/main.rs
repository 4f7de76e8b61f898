//! Build farm controller CLI
//!
//! A command-line tool for inspecting the controller, changing the desired
//! state and waking a parked farm.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{decisions, desired, status, wake};

/// Build farm controller CLI
#[derive(Parser)]
#[command(name = "farmctl")]
#[command(author, version, about = "CLI for the Build Farm Controller", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via FARMCTL_API_URL env var)
    #[arg(long, env = "FARMCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show controller status from the last reconcile cycle
    Status,

    /// Show controller health per component
    Health,

    /// Show recent cost decisions
    Decisions {
        /// Number of decisions to show
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// Show the desired state
    Desired,

    /// Update the desired state
    Set(desired::SetArgs),

    /// Signal build activity so a parked farm scales up
    Wake {
        /// Origin of the signal, recorded in the controller log
        #[arg(long)]
        source: Option<String>,
    },

    /// Save the API URL and output format as defaults
    Configure,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let api_url = config.resolve_api_url(cli.api_url.as_deref());
    let format = cli.format.or(config.default_format).unwrap_or_default();

    if let Commands::Configure = cli.command {
        let updated = config::Config {
            api_url: Some(api_url),
            default_format: Some(format),
        };
        updated.save()?;
        output::print_success(&format!(
            "Saved defaults to {}",
            config::Config::config_path()?.display()
        ));
        return Ok(());
    }

    let client = client::ApiClient::new(&api_url)?;

    match cli.command {
        Commands::Status => status::show_status(&client, format).await?,
        Commands::Health => status::show_health(&client, format).await?,
        Commands::Decisions { limit } => decisions::show_decisions(&client, limit, format).await?,
        Commands::Desired => desired::show_desired(&client, format).await?,
        Commands::Set(args) => desired::set_desired(&client, &args, format).await?,
        Commands::Wake { source } => wake::wake(&client, source, format).await?,
        Commands::Configure => {}
    }

    Ok(())
}
