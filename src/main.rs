use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tmy_builder::config::{Config, StateBackend};
use tmy_builder::db::PgProjectState;
use tmy_builder::fetcher::Fetcher;
use tmy_builder::logsink::{LogSink, ProjectLog};
use tmy_builder::persistence::ProjectLayout;
use tmy_builder::render::PlotDataWriter;
use tmy_builder::state::{FileProjectState, ProjectState};
use tmy_builder::workflow::Workflow;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tmy_builder=debug,sqlx=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("TMY builder starting...");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = Config::load(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Cannot use configuration {}: {}\n\
             Usage: tmy-builder [CONFIG_PATH]   (default: {})\n\
             Variables referenced as ${{NAME}} must be exported or listed in .env",
            config_path,
            e,
            DEFAULT_CONFIG_PATH
        )
    })?;
    info!("Configuration loaded from {}", config_path);

    let layout = ProjectLayout::create(&config.project.directory).map_err(|e| {
        anyhow::anyhow!(
            "Failed to prepare project directory {}: {}",
            config.project.directory.display(),
            e
        )
    })?;
    let log: Arc<dyn LogSink> = Arc::new(ProjectLog::new(layout.log_path()));

    let state: Arc<dyn ProjectState> = match config.state.backend {
        StateBackend::File => Arc::new(FileProjectState::open(layout.state_path()).await?),
        StateBackend::Postgres => {
            let database = config
                .database
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("State backend 'postgres' needs a database section"))?;

            let pool = PgPoolOptions::new()
                .max_connections(database.max_connections)
                .connect(&database.connection_string())
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Postgres state backend unreachable at {}:{} (database '{}', user '{}'): {}",
                        database.host,
                        database.port,
                        database.name,
                        database.user,
                        e
                    )
                })?;

            info!(
                "Project state stored in postgres {}:{}/{}",
                database.host, database.port, database.name
            );

            let state = PgProjectState::new(pool, layout.root().display().to_string());
            state.repository().run_migrations().await?;
            Arc::new(state)
        }
    };

    let source = Arc::new(Fetcher::new(
        &config.source.base_url,
        &config.source.api_key,
        Duration::from_secs(config.source.timeout_seconds),
    )?);
    let renderer = Box::new(PlotDataWriter::new(layout.plots_dir()));

    // Ctrl+C / SIGTERM stop new chunk dispatches; in-flight requests finish
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let workflow = Workflow::new(config, layout, source, state, log, renderer, shutdown_rx);

    match workflow.run().await {
        Ok(outcome) => {
            for (month, year) in &outcome.source_years {
                info!("Month {:02}: {}", month, year);
            }
            if let Some(path) = &outcome.tmy_path {
                info!("TMY written to {}", path.display());
            }
            if !outcome.failed_chunks.is_empty() {
                warn!(
                    "{} chunk(s) could not be fetched; re-run to retry them",
                    outcome.failed_chunks.len()
                );
            }
        }
        Err(e) => {
            match e.stage() {
                Some(stage) => error!("Workflow stopped in stage '{}': {}", stage, e),
                None => error!("Workflow failed: {}", e),
            }
            return Err(e.into());
        }
    }

    info!("TMY builder finished");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing in-flight requests");
        }
        _ = terminate => {
            info!("Received SIGTERM, finishing in-flight requests");
        }
    }
}
