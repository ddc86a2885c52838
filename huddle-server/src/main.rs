//! huddle-server binary entry point.
//!
//! ```bash
//! huddle-server --config huddle.toml
//! ```

use huddle_server::config::Config;
use huddle_server::{http, sweep, ServerContext};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = config_path();
    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        tracing::info!("no config file at {config_path:?}, using defaults");
        Config::default()
    };

    let bind_address = config.server.bind_address.clone();
    let ctx = ServerContext::new(config);

    sweep::spawn_sweeper(ctx.credentials.clone(), ctx.config().tokens.clone());

    let app = http::router(ctx);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("huddle server listening on {bind_address}");
    axum::serve(listener, app).await?;

    Ok(())
}

fn config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("huddle.toml"))
}
