use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cinder::logging::{LogFormat, LogLevel, init_logging};

mod cmd;

#[derive(Parser)]
#[command(name = "cinder")]
#[command(version, about = "Actions CI orchestration core for a self-hosted git forge")]
pub struct Cli {
    /// Log level; overrides CINDER_LOG
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Path to cinder.toml (defaults to ./cinder.toml when present)
    #[arg(short, long, global = true, env = "CINDER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the runner RPC and operator API server with the scheduler loops
    Serve {
        /// Address to listen on, e.g. 127.0.0.1:3142
        #[arg(long)]
        listen: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Create the database schema and exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage runner registration tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default cinder.toml
    Init,
}

#[derive(Subcommand, Clone)]
pub enum TokenCommands {
    /// Create a registration token, retiring older tokens of the same scope
    Create {
        /// Scope the token to an owner (user or organization)
        #[arg(long)]
        owner: Option<i64>,

        /// Scope the token to a repository
        #[arg(long, conflicts_with = "owner")]
        repo: Option<i64>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.log_format)?;
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Serve { listen, db_path } => cmd::cmd_serve(config, listen, db_path).await?,
        Commands::InitDb { db_path } => cmd::cmd_init_db(config, db_path)?,
        Commands::Config { command } => cmd::cmd_config(config, command)?,
        Commands::Token { command } => cmd::cmd_token(config, command).await?,
    }

    Ok(())
}
