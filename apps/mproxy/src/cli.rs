use std::path::PathBuf;

use clap::Parser;

/// Protocol-adapting reverse proxy for conversational LLM APIs.
#[derive(Debug, Parser)]
#[command(name = "mproxy", version, about)]
pub struct Cli {
    /// Static server config (bind address, logging, dump toggles).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Hot-reloadable user config (providers, models, routing).
    #[arg(long, value_name = "FILE", default_value = "user.yaml")]
    pub user_config: PathBuf,

    /// Override the bind host from the server config.
    #[arg(long)]
    pub host: Option<String>,

    /// Override the bind port from the server config.
    #[arg(long)]
    pub port: Option<u16>,
}
