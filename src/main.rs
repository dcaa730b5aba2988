mod cli;

use anyhow::Context;
use clap::Parser;
use farmrelay_core::{Config, ConfigValidator};
use farmrelay_gateway::{
    build_router, serve_api, spawn_retention_task, GatewayConfig, GatewayServer, RelayHandlers,
    SessionRegistry,
};
use farmrelay_storage::{SqliteStorage, StorageGateway};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands, ServeArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle ConfigSample immediately without loading config
    if let Some(Commands::ConfigSample { output }) = &cli.command {
        let path = output
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("./farmrelay.sample.yaml"));
        Config::sample().save(&path)?;
        println!("Sample config written to {}", path.display());
        return Ok(());
    }

    let mut config = Config::load(cli.config_path.as_deref())?;
    let serve_args = match cli.command {
        Some(Commands::Serve(args)) => args,
        Some(Commands::CheckConfig) => {
            ConfigValidator::validate(&config)?;
            print!("{}", serde_yml::to_string(&config)?);
            return Ok(());
        }
        Some(Commands::ConfigSample { .. }) => return Ok(()),
        None => ServeArgs::default(),
    };
    serve_args.apply(&mut config);

    init_tracing(&config);
    serve(config).await
}

fn init_tracing(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter_directive()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}

async fn serve(config: Config) -> anyhow::Result<()> {
    ConfigValidator::validate(&config)?;
    info!("FarmRelay v{}", env!("CARGO_PKG_VERSION"));

    let db_path = &config.storage.database_path;
    let storage: Arc<dyn StorageGateway> = Arc::new(
        SqliteStorage::open(db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );
    info!("Database ready at {}", db_path.display());

    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&storage),
        config.storage.snapshot_limit,
    ));
    let handlers = Arc::new(RelayHandlers::new(registry));

    let gateway = GatewayServer::bind(
        &config.server.ws_addr(),
        GatewayConfig::from(&config.server),
        Arc::clone(&handlers),
    )
    .await?;

    let api_addr = config.server.api_addr();
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP API on {}", api_addr))?;
    let router = build_router(Arc::clone(&handlers), &config.server.allowed_origins);

    let _retention = spawn_retention_task(storage, config.storage.retention_days);

    tokio::select! {
        result = gateway.run() => result?,
        result = serve_api(api_listener, router) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
