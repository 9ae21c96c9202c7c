//! Glocker Control - CLI client for the glocker daemon

use anyhow::Result;
use clap::{Parser, Subcommand};
use glocker_common::client::{send_command, GlockerClient};
use glocker_common::config::{CONFIG_PATH, DEFAULT_SOCKET_PATH};
use glocker_common::gate::{confirmed_uninstall, gate_for};
use glocker_common::{Command, Config, ConfigSource, YamlConfigSource};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "glockerctl")]
#[command(about = "Glocker - talk to the running glocker daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Control socket (default: $GLOCKER_SOCKET or the configured path)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Config file, used for the socket path and uninstall confirmation
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show live daemon status
    Status,

    /// Reload the config file
    Reload,

    /// Temporarily unblock domains
    Unblock {
        /// Comma-separated domains
        domains: String,

        /// Why you need access
        #[arg(long, short)]
        reason: String,
    },

    /// Permanently block domains
    Block {
        /// Comma-separated domains
        domains: String,
    },

    /// Suspend the machine and keep it suspended for a while
    Panic {
        minutes: u64,
    },

    /// Block sudo until the next scheduled change
    Lock,

    /// Add keywords to the browser extension lists
    AddKeyword {
        /// Comma-separated keywords
        keywords: String,
    },

    /// Undo all system changes and stop the daemon
    Uninstall {
        #[arg(long, short)]
        reason: String,
    },
}

impl Commands {
    /// Wire line; validated by the same parser the daemon uses
    fn to_command(&self) -> Result<Command> {
        let line = match self {
            Commands::Status => "status".to_string(),
            Commands::Reload => "reload".to_string(),
            Commands::Unblock { domains, reason } => format!("unblock:{}:{}", domains, reason),
            Commands::Block { domains } => format!("block:{}", domains),
            Commands::Panic { minutes } => format!("panic:{}", minutes),
            Commands::Lock => "lock".to_string(),
            Commands::AddKeyword { keywords } => format!("add-keyword:{}", keywords),
            Commands::Uninstall { reason } => format!("uninstall:{}", reason),
        };
        Ok(Command::parse(&line)?)
    }
}

fn load_config(path: &Path) -> Config {
    YamlConfigSource::new(path).load().unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
    let config = load_config(&config_path);

    let socket = match &cli.socket {
        Some(path) => path.clone(),
        None if config.socket_path != Path::new(DEFAULT_SOCKET_PATH) => config.socket_path.clone(),
        None => GlockerClient::discover_socket_path(Path::new(DEFAULT_SOCKET_PATH)),
    };

    let command = cli.command.to_command()?;
    let reply = match &command {
        Command::Uninstall { reason } => {
            let gate = gate_for(&config);
            confirmed_uninstall(gate.as_ref(), &socket, reason).await?
        }
        _ => send_command(&socket, &command).await?,
    };

    println!("{}", reply.text());
    if reply.is_error() {
        std::process::exit(1);
    }
    Ok(())
}
