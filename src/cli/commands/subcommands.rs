use super::{AgentCommands, ConfigCommands};
use anyhow::{Context, Result, bail};
use std::fmt::Write;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::auth::Principal;
use crate::bus::EventFeed;
use crate::config::credentials::{CREDENTIAL_ENV_VARS, is_credential_set};
use crate::config::{Config, StorageBackend, get_config_path, load_config, save_config};
use crate::directory::{Directory, NewAgent};
use crate::model::AgentProfile;
use crate::persistence::{Persistence, SqlitePersistence};
use crate::router::AssignmentLedger;

pub(super) fn agents_command(cmd: AgentCommands, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let directory = open_directory(&config)?;

    match cmd {
        AgentCommands::List => {
            let agents = directory.profiles();
            if agents.is_empty() {
                println!("No agents.");
                return Ok(());
            }
            println!("{}", format_agent_table(&agents));
        }
        AgentCommands::Add {
            name,
            email,
            password,
            role,
            capacity,
        } => {
            let password = match password {
                Some(p) => p,
                None => read_password()?,
            };
            let profile = directory.create_agent(
                &Principal::system(),
                NewAgent {
                    name,
                    email,
                    confirm_password: password.clone(),
                    password,
                    role: role.into(),
                    capacity,
                },
            )?;
            println!(
                "\u{2713} Created {} {} <{}> (id {})",
                profile.role, profile.name, profile.email, profile.id
            );
        }
    }
    Ok(())
}

/// Agent directory over the configured SQLite store. The in-memory
/// backend keeps nothing between runs, so there is nothing to manage.
pub(super) fn open_directory(config: &Config) -> Result<Directory> {
    if config.storage.backend != StorageBackend::Sqlite {
        bail!("agent accounts are only stored with storage.backend = \"sqlite\"");
    }
    let path = config.storage.database_path()?;
    let persistence: Arc<dyn Persistence> = Arc::new(
        SqlitePersistence::new(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?,
    );
    let agents = persistence.load_agents()?;
    let labels = persistence.load_labels()?;

    let directory = Directory::new(
        Arc::new(AssignmentLedger::new()),
        persistence,
        Arc::new(EventFeed::default()),
        Arc::new(RwLock::new(config.console_settings())),
    );
    directory.restore(agents, labels);
    Ok(directory)
}

pub(super) fn format_agent_table(agents: &[AgentProfile]) -> String {
    let name_width = agents
        .iter()
        .map(|a| a.name.chars().count())
        .max()
        .unwrap_or(0)
        .max(4);
    let mut out = format!(
        "{:<name_width$}  {:<6}  {:>8}  EMAIL",
        "NAME", "ROLE", "CAPACITY"
    );
    for agent in agents {
        let _ = write!(
            out,
            "\n{:<name_width$}  {:<6}  {:>8}  {}",
            agent.name,
            agent.role.to_string(),
            agent.capacity,
            agent.email
        );
    }
    out
}

fn read_password() -> Result<String> {
    use std::io::BufRead;

    eprintln!("Password: ");
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    let password = input.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("no password given");
    }
    Ok(password)
}

pub(super) fn config_command(cmd: ConfigCommands, config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };

    match cmd {
        ConfigCommands::Init { force } => {
            init_config(&path, force)?;
            println!("\u{2713} Created config at {}", path.display());
            println!("\nNext steps:");
            println!("  1. Set auth.bootstrapAdmin (or ZAPDESK_ADMIN_PASSWORD) for the first login");
            println!("  2. Start the console: zapdesk serve");
        }
        ConfigCommands::Show => {
            let config = load_config(Some(&path))?;
            println!("# {}", path.display());
            println!("{:#?}", config);
        }
        ConfigCommands::Validate => {
            let config = load_config(Some(&path))?;
            println!("\u{2713} {} is valid", path.display());
            for (name, env) in CREDENTIAL_ENV_VARS {
                let state = match is_credential_set(&config, name) {
                    Some(true) => "set",
                    _ => "empty",
                };
                println!("  {:<16} [{}] (env {})", name, state, env);
            }
        }
    }
    Ok(())
}

pub(super) fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    save_config(&Config::default(), Some(path))?;
    Ok(())
}
