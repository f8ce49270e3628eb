use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use blogroll::config::{Cli, Config};
use blogroll::routes;
use blogroll::state::AppState;
use blogroll::store::users;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli)?;
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli)?;

    // Refuse to serve requests that could not be authenticated
    let state = AppState::build(config).inspect_err(|e| {
        tracing::error!("FATAL: {:#}", e);
    })?;

    if let Some(email) = cli.grant_admin {
        let conn = state.db.get()?;
        if !users::set_admin(&conn, &email, true)? {
            anyhow::bail!("No account with email {}", email);
        }
        tracing::info!("Granted admin to {}", email);
        return Ok(());
    }

    let addr: SocketAddr =
        format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
    let app = routes::router(state);

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
