use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

mod app;
mod auth;
mod http;
mod pipeline;

#[derive(Parser)]
#[command(name = "aero-gateway", about = "Protocol-translation gateway for AI chat backends")]
struct Cli {
    /// Path to aero.toml (default: $AERO_CONFIG, then ~/.aero/aero.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Register an identity file produced by the credential login handshake.
    Login {
        /// Backend key the identity belongs to.
        #[arg(long)]
        backend: String,
        /// Path to the identity JSON file.
        #[arg(long)]
        identity: PathBuf,
    },
    /// Create or update the on-disk sqlite schemas.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aero_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = aero_core::config::AeroConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("config: {e}"))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Login { backend, identity } => login(&config, &backend, &identity),
        Command::Migrate => migrate(&config),
    }
}

async fn serve(config: aero_core::config::AeroConfig) -> anyhow::Result<()> {
    let host = config.server.host.clone();
    let port = config.server.port;

    let state = Arc::new(app::AppState::build(config)?);
    app::spawn_sweeper(state.clone());
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("aero gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Validate an identity file and install it under the storage dir so the
/// credential manager picks it up on the next start.
fn login(
    config: &aero_core::config::AeroConfig,
    backend: &str,
    identity: &std::path::Path,
) -> anyhow::Result<()> {
    let credential = aero_auth::refresh::load_identity_file(identity)
        .map_err(|e| anyhow::anyhow!("identity: {e}"))?;

    let dir = PathBuf::from(&config.storage.data_dir)
        .join("identities")
        .join(backend);
    std::fs::create_dir_all(&dir)?;
    let dest = dir.join(format!("{}.json", credential.id));
    std::fs::copy(identity, &dest)?;

    println!("registered identity '{}' for backend '{backend}'", credential.id);
    println!("  -> {}", dest.display());
    Ok(())
}

/// Open every sqlite database the gateway can use and run the idempotent
/// schema batches.
fn migrate(config: &aero_core::config::AeroConfig) -> anyhow::Result<()> {
    let dir = PathBuf::from(&config.storage.data_dir);
    std::fs::create_dir_all(&dir)?;

    aero_cache::mirror::SignatureMirror::open(&dir.join("signatures.db"))
        .map_err(|e| anyhow::anyhow!("signatures.db: {e}"))?;
    let conn = rusqlite::Connection::open(dir.join("conversations.db"))?;
    aero_state::db::init_db(&conn).map_err(|e| anyhow::anyhow!("conversations.db: {e}"))?;
    aero_state::UsageRecorder::open(&dir.join("usage.db"))
        .map_err(|e| anyhow::anyhow!("usage.db: {e}"))?;

    println!("schemas ready under {}", dir.display());
    Ok(())
}
