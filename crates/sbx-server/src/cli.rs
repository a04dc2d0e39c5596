//! Server CLI.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use sbx_core::LogFormat;

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

/// sbx server - authoritative endpoint for the sbx sync service.
#[derive(Debug, Parser)]
#[command(
    name = "sbx-server",
    version,
    about = "sbx server - authoritative endpoint for the sbx sync service"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value_t = 8000)]
    pub port: u16,

    /// Directory holding the per-user object buckets
    #[arg(long = "storage-root", default_value = "sbx-storage")]
    pub storage_root: PathBuf,

    /// Reference database path (overrides SB_DB_DATABASE)
    #[arg(long = "db", value_name = "PATH")]
    pub db_path: Option<String>,

    /// Accept a mid-connection identity change instead of rejecting it
    #[arg(long = "allow-identity-rebind")]
    pub allow_identity_rebind: bool,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["sbx-server"]);
        assert_eq!(cli.bind_addr.to_string(), "0.0.0.0");
        assert_eq!(cli.port, 8000);
        assert!(!cli.allow_identity_rebind);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn verbosity_accumulates() {
        let cli = Cli::parse_from(["sbx-server", "-vvv"]);
        assert_eq!(cli.verbose, 3);
    }
}
