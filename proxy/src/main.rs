// Stratum proxy - per-user ports, credential rewrite, scheduled modes.
//
// Core: proxy fabric (one listener per user), rewriter, worker registry
// Control: schedule loop, admin API, internal proxy API

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stratum_proxy::api;
use stratum_proxy::config::Config;
use stratum_proxy::control::ControlPlane;
use stratum_proxy::db::postgres::PgRepository;
use stratum_proxy::db::Repository;
use stratum_proxy::fabric::ProxyFabric;
use stratum_proxy::notify::LogNotifier;
use stratum_proxy::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    let cfg = Config::load();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("🚀 Stratum proxy v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "port range {}..={}, scheduler interval {}s",
        cfg.port_range.0, cfg.port_range.1, cfg.scheduler_check_interval
    );

    // Storage
    let repo = match PgRepository::connect(&cfg.database_url).await {
        Ok(repo) => repo,
        Err(e) => {
            error!("cannot connect to database: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = repo.init_schema().await {
        error!("schema initialization failed: {:#}", e);
        std::process::exit(1);
    }
    let repo: Arc<dyn Repository> = Arc::new(repo);
    let notifier = Arc::new(LogNotifier);

    // Proxy fabric: one listener per user port
    let fabric = Arc::new(ProxyFabric::new(repo.clone(), notifier.clone(), &cfg));
    if let Err(e) = fabric.start_all().await {
        error!("proxy fabric failed to start: {:#}", e);
        std::process::exit(1);
    }

    // Schedule loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(Scheduler::new(
        repo.clone(),
        fabric.clone(),
        notifier.clone(),
        Duration::from_secs(cfg.scheduler_check_interval),
    ));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let control = Arc::new(ControlPlane::new(repo.clone(), fabric.clone(), cfg.clone()));

    // Internal proxy API (reload-port callbacks from a split deployment)
    {
        let app = api::proxy_router(control.clone(), cfg.proxy_api_token.clone());
        let addr = (cfg.proxy_api_host.clone(), cfg.proxy_api_port);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(addr.clone()).await {
                Ok(l) => l,
                Err(e) => {
                    error!("proxy API bind {}:{} failed: {}", addr.0, addr.1, e);
                    return;
                }
            };
            info!("proxy API listening on {}:{}", addr.0, addr.1);
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = serve.await {
                error!("proxy API server error: {}", e);
            }
        });
    }

    // Admin API, in the foreground until a shutdown signal arrives
    let shutdown_signal = async {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM — shutting down"),
                _ = ctrl_c => info!("SIGINT — shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to register Ctrl+C handler");
            info!("Ctrl+C — shutting down");
        }
    };

    let app = api::admin_router(control.clone(), cfg.app_api_token.clone());
    let listener = match TcpListener::bind((cfg.app_api_host.as_str(), cfg.app_api_port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(
                "admin API bind {}:{} failed: {}",
                cfg.app_api_host, cfg.app_api_port, e
            );
            std::process::exit(1);
        }
    };
    info!(
        "admin API listening on {}:{}",
        cfg.app_api_host, cfg.app_api_port
    );
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
    {
        error!("admin API server error: {}", e);
    }

    // Orderly teardown: scheduler first, then every port server
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    fabric.stop_all().await;

    info!("🏁 proxy shut down cleanly");
}
