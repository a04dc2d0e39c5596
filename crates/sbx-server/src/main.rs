//! sbx server binary entry point.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use sbx_core::error::Result;
use sbx_server::db::{Db, DbConfig};
use sbx_server::store_fs::FsStore;
use sbx_server::{Cli, Server, ServerConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = sbx_core::init_logging(
        cli.verbose,
        cli.log_file.as_deref(),
        cli.log_format.into(),
    ) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "sbx-server starting");

    if let Err(err) = run(cli).await {
        error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut db_config = DbConfig::from_env();
    if let Some(path) = cli.db_path {
        db_config.database = path;
    }
    let db = Db::connect(&db_config).await?;

    let storage = Arc::new(FsStore::from_env(cli.storage_root));

    let server = Server::new(
        db,
        storage,
        ServerConfig {
            bind_addr: cli.bind_addr,
            port: cli.port,
            allow_identity_rebind: cli.allow_identity_rebind,
        },
    );
    server.listen().await
}
