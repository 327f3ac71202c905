use anyhow::{Context, Result};
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use specfix_core::llm::ChatClient;
use specfix_server::analysis::ChatAnalyzer;
use specfix_server::build_farm::{EulerMakerClient, EulerMakerConfig};
use specfix_server::config::Config;
use specfix_server::dispatch::{dispatch_loop, work_queue};
use specfix_server::hosting::{GitHubHostingClient, HostingProvider, HostingRegistry, V5Client};
use specfix_server::reconcile::reclaim_orphaned_requests;
use specfix_server::repair::RepairMachine;
use specfix_server::store::{RequestStore, SqliteRequestStore};
use specfix_server::webhook::webhook_router;
use specfix_server::worker::{WorkerContext, WorkerPool};
use specfix_server::{AppState, RecordingLogger};

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "specfix",
        "version": specfix_server::get_version()
    }))
}

fn build_hosting_registry(
    config: &Config,
    recording_logger: &Option<RecordingLogger>,
) -> HostingRegistry {
    let mut registry = HostingRegistry::new();
    if let Some(token) = &config.gitee_token {
        registry.register(
            HostingProvider::Gitee,
            Arc::new(V5Client::gitee(token.clone(), recording_logger.clone())),
        );
    }
    if let Some(token) = &config.gitcode_token {
        registry.register(
            HostingProvider::GitCode,
            Arc::new(V5Client::gitcode(token.clone(), recording_logger.clone())),
        );
    }
    if let Some(token) = &config.github_token {
        registry.register(
            HostingProvider::GitHub,
            Arc::new(GitHubHostingClient::new(
                token.clone(),
                recording_logger.clone(),
            )),
        );
    }
    registry
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting specfix {}", specfix_server::get_version());

    let config = Config::from_env().context("Failed to load configuration")?;

    let recording_logger = if config.recording_enabled {
        match RecordingLogger::new(PathBuf::from(&config.recording_log_path)) {
            Ok(logger) => {
                info!(
                    "Recording enabled, logging to: {}",
                    config.recording_log_path
                );
                Some(logger)
            }
            Err(e) => {
                error!("Failed to initialize recording logger: {}", e);
                None
            }
        }
    } else {
        None
    };

    let db_path = config.database_path();
    info!("Using state database: {}", db_path.display());
    let store: Arc<dyn RequestStore> = Arc::new(
        SqliteRequestStore::new(&db_path)
            .context("Failed to initialize SQLite database")?
            .with_max_claims(config.max_claims),
    );

    let hosting = Arc::new(build_hosting_registry(&config, &recording_logger));
    info!("Hosting providers: {:?}", hosting.providers());

    let mut farm_config = EulerMakerConfig::new(config.build_farm_token.clone());
    farm_config.base_url = config.build_farm_api_url.clone();
    farm_config.target = config.build_target();
    let farm = Arc::new(EulerMakerClient::new_with_recording(
        farm_config,
        recording_logger.clone(),
    ));

    let analyzer = Arc::new(ChatAnalyzer::new(ChatClient::new_with_recording(
        config.llm_api_url.clone(),
        config.llm_api_key.clone(),
        config.chat_options(),
        recording_logger.clone(),
    )));

    let machine = Arc::new(RepairMachine::new(
        farm,
        analyzer,
        config.repair_settings(),
    ));

    // Recover requests orphaned by a previous process before taking new work.
    reclaim_orphaned_requests(store.as_ref(), config.lease_ttl).await;

    let shutdown = CancellationToken::new();
    let dispatch_settings = config.dispatch_settings();
    let worker_settings = config.worker_settings();
    let (queue_tx, queue_rx) = work_queue(&dispatch_settings);

    let pool = WorkerPool::spawn(
        Arc::new(WorkerContext {
            store: store.clone(),
            hosting: hosting.clone(),
            machine,
            settings: worker_settings,
        }),
        queue_rx,
        shutdown.clone(),
    );

    let dispatcher = tokio::spawn(dispatch_loop(
        store.clone(),
        queue_tx,
        dispatch_settings,
        shutdown.clone(),
    ));

    let app_state = Arc::new(AppState {
        store,
        hosting,
        webhook_secret: config.webhook_secret.clone(),
        commands: config.commands.clone(),
        require_source_url: config.require_source_url,
        recording_logger,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // The server only returns once shutdown was signalled.
    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        error!("Dispatcher task failed: {}", e);
    }
    pool.shutdown(worker_settings.shutdown_grace).await;

    info!("specfix stopped");
    Ok(())
}
