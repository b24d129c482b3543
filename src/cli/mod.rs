// CLI module - User-facing command-line interface

mod output;

use crate::error::Result;
use crate::ipc::{Command, IpcClient, DEFAULT_SOCKET_PATH};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tether - supervise the apps of an ecosystem descriptor
#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Daemon control socket
    #[arg(long, global = true, env = "TETHER_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every stopped instance of an app
    Start {
        /// App name from the descriptor
        name: String,
    },

    /// Stop every instance of an app
    Stop { name: String },

    /// Restart every instance of an app
    Restart { name: String },

    /// Show instance status for one app, or for all apps
    Status { name: Option<String> },

    /// Re-read the descriptor and reload every app in it
    Reload,
}

impl Cli {
    /// Run the CLI application
    pub fn run() -> Result<()> {
        let cli = Cli::parse();
        cli.execute()
    }

    fn execute(&self) -> Result<()> {
        let single = matches!(self.command, Commands::Status { name: Some(_) });
        let client = IpcClient::with_socket_path(&self.socket);
        let data = client.request(self.build_command())?;

        output::print_success(&data, single);
        Ok(())
    }

    fn build_command(&self) -> Command {
        match &self.command {
            Commands::Start { name } => Command::Start { name: name.clone() },
            Commands::Stop { name } => Command::Stop { name: name.clone() },
            Commands::Restart { name } => Command::Restart { name: name.clone() },
            Commands::Status { name } => Command::Status { name: name.clone() },
            Commands::Reload => Command::Reload,
        }
    }
}
