//! Client CLI.
//!
//! Flag names follow the service's established surface: `--root_dir`,
//! `--tmp_dir`, `--Username`, `--Password`. The password is md5-hashed in
//! memory before it is ever put on the wire.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use md5::{Digest as _, Md5};

use sbx_core::constants::ENV_SERVER_HOST;
use sbx_core::error::{Error, Result};
use sbx_core::protocol::Identity;
use sbx_core::LogFormat;

use crate::agent::ClientConfig;

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

/// sbx client - watches a directory and keeps it synchronized.
#[derive(Debug, Parser)]
#[command(
    name = "sbx-client",
    version,
    about = "sbx client - watches a directory and keeps it synchronized"
)]
pub struct Cli {
    /// The root directory to watch (defaults to sb-root beside the binary)
    #[arg(long = "root_dir", value_name = "PATH")]
    pub root_dir: Option<PathBuf>,

    /// Scratch directory for in-flight file moves (defaults under $TMPDIR)
    #[arg(long = "tmp_dir", value_name = "PATH")]
    pub tmp_dir: Option<PathBuf>,

    /// Username to login
    #[arg(long = "Username", default_value = "hello")]
    pub username: String,

    /// Password to login
    #[arg(long = "Password", default_value = "world")]
    pub password: String,

    /// Device name presented to the server (defaults to the hostname)
    #[arg(long = "device")]
    pub device: Option<String>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// Resolve defaults against the environment and build the immutable
    /// agent configuration.
    pub fn into_config(self) -> Result<ClientConfig> {
        let root_dir = match self.root_dir {
            Some(dir) => dir,
            None => {
                let exe = std::env::current_exe()?;
                let beside = exe.parent().ok_or_else(|| {
                    Error::protocol("executable has no parent directory")
                })?;
                beside.join("sb-root")
            }
        };

        let tmp_dir = match self.tmp_dir {
            Some(dir) => dir,
            None => {
                let base = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(base).join("sb-tmp")
            }
        };

        let server_host = std::env::var(ENV_SERVER_HOST)
            .map_err(|_| Error::protocol(format!("{ENV_SERVER_HOST} is not set")))?;

        let device = match self.device {
            Some(device) => device,
            None => hostname_device(),
        };

        let identity = Identity {
            username: self.username,
            password: hash_password(&self.password),
            device,
        };

        Ok(ClientConfig::new(root_dir, tmp_dir, server_host, identity))
    }
}

/// Lowercase hex md5 of the cleartext; the cleartext never leaves this
/// function.
pub fn hash_password(password: &str) -> String {
    let digest = Md5::digest(password.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hostname_device() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_hashed_to_hex_md5() {
        // md5("world") = 7d793037a0760186574b0282f2f435e7
        assert_eq!(hash_password("world"), "7d793037a0760186574b0282f2f435e7");
        assert_eq!(hash_password("").len(), 32);
    }

    #[test]
    fn flag_surface_matches_the_service() {
        let cli = Cli::parse_from([
            "sbx-client",
            "--root_dir",
            "/watch",
            "--tmp_dir",
            "/scratch",
            "--Username",
            "alice",
            "--Password",
            "secret",
            "--device",
            "laptop",
        ]);
        assert_eq!(cli.root_dir.as_deref().unwrap().to_str(), Some("/watch"));
        assert_eq!(cli.tmp_dir.as_deref().unwrap().to_str(), Some("/scratch"));
        assert_eq!(cli.username, "alice");
        assert_eq!(cli.password, "secret");
        assert_eq!(cli.device.as_deref(), Some("laptop"));
    }

    #[test]
    fn username_and_password_default() {
        let cli = Cli::parse_from(["sbx-client"]);
        assert_eq!(cli.username, "hello");
        assert_eq!(cli.password, "world");
    }
}
