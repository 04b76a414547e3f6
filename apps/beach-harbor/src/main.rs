use std::net::SocketAddr;

use anyhow::Context;
use beach_harbor::{
    cli::{self, Cli, Commands},
    config::AppConfig,
    orchestrator::SessionOrchestrator,
    registry::Registry,
    routes::{build_router, cors_layer},
    state::AppState,
};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(AppConfig::from_env()?).await,
        Commands::Heartbeat {
            url,
            droplet_ip,
            clients,
            secret,
        } => {
            let secret = cli::resolve_secret(secret)?;
            let response = cli::send_heartbeat(&url, &droplet_ip, clients, &secret).await?;
            println!("{response}");
            Ok(())
        }
        Commands::End {
            url,
            droplet_ip,
            secret,
        } => {
            let secret = cli::resolve_secret(secret)?;
            let response = cli::send_end(&url, &droplet_ip, &secret).await?;
            println!("{response}");
            Ok(())
        }
        Commands::Sync => {
            let cfg = AppConfig::from_env()?;
            let orchestrator = open_orchestrator(&cfg).await?;
            let result = orchestrator.sync_with_provider().await;
            orchestrator.registry().close().await;
            println!("reconciled {} droplets", result?);
            Ok(())
        }
        Commands::Inspect => {
            let cfg = AppConfig::from_env()?;
            let registry = Registry::open(&cfg.db_path).await?;
            let records = registry.list().await;
            registry.close().await;
            print!("{}", cli::render_records(&records?));
            Ok(())
        }
    }
}

async fn open_orchestrator(cfg: &AppConfig) -> anyhow::Result<SessionOrchestrator> {
    let registry = Registry::open(&cfg.db_path)
        .await
        .with_context(|| format!("failed to open registry at {}", cfg.db_path))?;
    Ok(SessionOrchestrator::new(registry, cfg.provisioner()))
}

async fn serve(cfg: AppConfig) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(&cfg).await?;
    let verifier = cfg.verifier();
    if !verifier.is_configured() {
        warn!("INTERNAL_HMAC_KEY / INTERNAL_HMAC_SECRET not set; /server/* endpoints will answer 503");
    }

    if cfg.provisioning_enabled() {
        if let Err(err) = orchestrator.sync_with_provider().await {
            warn!(error = %err, "initial provider sync failed; continuing with local registry");
        }
    }

    let registry = orchestrator.registry().clone();
    let app = build_router(AppState::new(orchestrator, verifier))
        .layer(cors_layer(cfg.cors_origins()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!(
        %addr,
        db_path = %cfg.db_path,
        cors_origins = ?cfg.cors_origins(),
        "starting Beach Harbor"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.close().await;
    info!("Beach Harbor stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
