/// One TCP listener per user port.
///
/// The effective mode is resolved once at start and cached in the
/// snapshot; reload_port replaces the whole server to pick up changes.
/// In-flight sessions keep their old snapshot until they are cancelled.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::pipeline::Pipeline;
use crate::db::Repository;
use crate::notify::Notifier;
use crate::resolver::{self, ResolvedMode};
use crate::workers::WorkerRegistry;

/// Everything a pipeline needs to know about its port, frozen at server
/// start.
#[derive(Debug, Clone)]
pub struct PortSnapshot {
    pub listen_port: u16,
    pub user_id: i64,
    pub tg_id: i64,
    pub login: String,
    pub mode: ResolvedMode,
    pub mode_name: String,
    pub subscription_until: DateTime<Utc>,
}

pub struct PortServer {
    port: u16,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl PortServer {
    /// Open the listener for `port`. Returns None when no user owns the
    /// port (nothing to serve).
    pub async fn start(
        port: u16,
        bind_host: &str,
        repo: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
        dial_timeout: Duration,
    ) -> Result<Option<Self>> {
        let user = match repo.find_user_by_port(port).await? {
            Some(user) => user,
            None => {
                debug!("no user owns port {}, not listening", port);
                return Ok(None);
            }
        };

        if !user.is_subscription_active(Utc::now()) {
            warn!(
                "user {} (port {}) has an expired subscription; connections will be refused",
                user.id, port
            );
        }

        let (mode, mode_name) = match resolver::effective_mode(&repo, &user).await? {
            Some(m) => {
                let name = m.name.clone();
                (ResolvedMode::from_mode(&m), name)
            }
            None => {
                warn!(
                    "user {} (port {}) has no mode configured, serving sleep",
                    user.id, port
                );
                (ResolvedMode::Sleep, "Sleep".to_string())
            }
        };

        let snapshot = Arc::new(PortSnapshot {
            listen_port: port,
            user_id: user.id,
            tg_id: user.tg_id,
            login: user.login.clone(),
            mode,
            mode_name,
            subscription_until: user.subscription_until,
        });

        let listener = TcpListener::bind((bind_host, port))
            .await
            .with_context(|| format!("bind {}:{}", bind_host, port))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(WorkerRegistry::new());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            snapshot.clone(),
            registry,
            repo,
            notifier,
            dial_timeout,
            shutdown_rx,
        ));

        info!(
            "listening on {}:{} for user {} (mode '{}')",
            bind_host, port, snapshot.user_id, snapshot.mode_name
        );

        Ok(Some(Self {
            port,
            shutdown,
            accept_task,
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the listener, cancel every live pipeline, await their
    /// cleanup.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;
        info!("port {} stopped", self.port);
    }
}

async fn accept_loop(
    listener: TcpListener,
    snapshot: Arc<PortSnapshot>,
    registry: Arc<WorkerRegistry>,
    repo: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    dial_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pipelines = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!("port {}: connection from {}", snapshot.listen_port, peer);
                        let pipeline = Pipeline::new(
                            snapshot.clone(),
                            registry.clone(),
                            repo.clone(),
                            notifier.clone(),
                            dial_timeout,
                        );
                        pipelines.spawn(pipeline.run(stream, peer, shutdown.clone()));
                        // reap whatever already finished
                        while pipelines.try_join_next().is_some() {}
                    }
                    Err(e) => {
                        warn!("port {}: accept failed: {}", snapshot.listen_port, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    // Refuse further connects, then drain live sessions (they see the
    // same shutdown signal and unwind on their own).
    drop(listener);
    while pipelines.join_next().await.is_some() {}
    debug!("port {}: all pipelines drained", snapshot.listen_port);
}
