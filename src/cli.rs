//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// OAuth 2.1 / OIDC-A authorization server for autonomous agent delegation chains
#[derive(Parser, Debug)]
#[command(name = "agent-token-authority")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTHORITY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "AUTHORITY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "AUTHORITY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "AUTHORITY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTHORITY_LOG_FORMAT")]
    pub log_format: Option<String>,
}
