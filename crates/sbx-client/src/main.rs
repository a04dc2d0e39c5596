//! sbx client binary entry point.

use clap::Parser;
use tracing::{error, info};

use sbx_client::agent::Client;
use sbx_client::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = sbx_core::init_logging(cli.verbose, None, cli.log_format.into()) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        root = %config.root_dir.display(),
        user = %config.identity.username,
        device = %config.identity.device,
        "sbx-client starting"
    );

    let client = Client::new(config);
    if let Err(err) = client.run().await {
        error!(error = %err, "fatal");
        std::process::exit(1);
    }
}
