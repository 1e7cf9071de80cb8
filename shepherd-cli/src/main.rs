//! Shepherd CLI
//!
//! Command-line interface for the Shepherd cluster registry

mod api;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::cluster::ClusterCommands;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// API server address [default: from ~/.config/shepherd/cli.toml]
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Bearer token used to authenticate
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered clusters
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },
    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load().unwrap_or_default();
    let server = cli.server.unwrap_or_else(|| config.default_server.clone());
    let token = cli.token.or_else(|| config.token.clone());

    let api_client = api::ApiClient::new(&server, token);

    match cli.command {
        Commands::Cluster { command } => {
            commands::cluster::handle_cluster_command(command, &api_client, &config.default_output).await?
        }
        Commands::Completions { shell } => {
            generate_completions(shell);
        }
    }

    Ok(())
}

/// Generate shell completions
fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "shepherd", &mut std::io::stdout());
}
