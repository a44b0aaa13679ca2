mod subcommands;


use crate::bus::DomainEvent;
use crate::config::{Config, load_config};
use crate::console::Console;
use crate::model::Role;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "zapdesk")]
#[command(about = "WhatsApp support console server")]
pub struct Cli {
    /// Config file (default: ~/.zapdesk/config.json)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the console: HTTP API, event stream and WhatsApp session
    Serve {
        /// Override the configured listen port
        #[arg(long, short = 'p')]
        port: Option<u16>,
    },
    /// Manage agent accounts in the configured store
    Agents {
        #[command(subcommand)]
        cmd: AgentCommands,
    },
    /// Create, show or check the config file
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// List agent accounts
    List,
    /// Create an agent account
    Add {
        #[arg(long, short = 'n')]
        name: String,
        #[arg(long, short = 'e')]
        email: String,
        /// Password (reads from stdin if omitted)
        #[arg(long)]
        password: Option<String>,
        #[arg(long, value_enum, default_value = "agent")]
        role: RoleArg,
        /// Max open conversations (default: routing.maxConversationsPerAgent)
        #[arg(long)]
        capacity: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Print the effective config (secrets redacted)
    Show,
    /// Load and validate the config file
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Admin,
    Agent,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Admin => Role::Admin,
            RoleArg::Agent => Role::Agent,
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve { port } => {
            let mut config = load_config(config_path)?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            serve(config).await?;
        }
        Commands::Agents { cmd } => {
            subcommands::agents_command(cmd, config_path)?;
        }
        Commands::Config { cmd } => {
            subcommands::config_command(cmd, config_path)?;
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;

    let console = Console::from_config(config)
        .await
        .context("Failed to start console")?;
    let qr_task = tokio::spawn(print_credential_challenges(console.clone()));
    let server = crate::gateway::start(console.clone(), &host, port).await?;
    info!("zapdesk v{} ready on http://{}:{}", crate::VERSION, host, port);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
        _ = server => {
            warn!("HTTP API server stopped");
        }
    }

    qr_task.abort();
    console.shutdown();
    Ok(())
}

/// Print each credential challenge as a terminal QR code so the operator
/// can link the device without the web console.
async fn print_credential_challenges(console: Arc<Console>) {
    let mut rx = console.feed().subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                if !matches!(event.event, DomainEvent::CredentialIssued { .. }) {
                    continue;
                }
                match console.session().render_qr() {
                    Ok(qr) => println!("\nScan with WhatsApp > Linked devices:\n\n{}\n", qr),
                    Err(e) => warn!("failed to render credential challenge: {}", e),
                }
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
