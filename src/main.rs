use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mailform::{web, Settings};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Serve the mail form.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Use a custom `.env` file.
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,

    /// Read settings from a TOML file instead of the environment.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on. Overrides `LISTEN_ADDR`.
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = cli.env_file.as_deref() {
        dotenvy::from_filename(path).context("load custom `.env` file")?;
    } else if dotenvy::dotenv().is_err() {
        eprintln!("WARNING: no `.env` file found");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut settings = match cli.config.as_deref() {
        Some(path) => {
            Settings::load_from_file(path).with_context(|| format!("load config from {path:?}"))?
        }
        None => Settings::from_env().context("load config from environment")?,
    };
    if let Some(listen) = cli.listen {
        settings.listen = listen;
    }

    info!(transport = ?settings.transport, "loaded configuration");
    if let Err(err) = settings.transport.validate() {
        // still serve, the form page shows the problem
        warn!(error = %err, "SMTP configuration is incomplete");
    }

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("bind {}", settings.listen))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, web::router(Arc::new(settings.transport)))
        .await
        .context("serve HTTP")?;

    Ok(())
}
