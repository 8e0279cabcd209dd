/// The set of per-user port servers.
///
/// Structural changes (start/stop/reload) serialize on one mutex so a
/// reload never races a shutdown; traffic on other ports is untouched.
pub mod pipeline;
pub mod port_server;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::Config;
use crate::db::Repository;
use crate::notify::Notifier;
use port_server::PortServer;

pub struct ProxyFabric {
    repo: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    bind_host: String,
    dial_timeout: Duration,
    servers: Mutex<HashMap<u16, PortServer>>,
}

impl ProxyFabric {
    pub fn new(repo: Arc<dyn Repository>, notifier: Arc<dyn Notifier>, config: &Config) -> Self {
        Self {
            repo,
            notifier,
            bind_host: config.proxy_host.clone(),
            dial_timeout: Duration::from_secs(config.dial_timeout_secs),
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Open a listener for every user in the repository. Per-port
    /// failures are logged and skipped; an across-the-board bind failure
    /// is fatal (bad bind address).
    pub async fn start_all(&self) -> Result<usize> {
        let users = self.repo.list_users().await?;
        let mut servers = self.servers.lock().await;
        let mut started = 0usize;
        let mut last_error = None;

        for user in &users {
            if servers.contains_key(&user.port) {
                continue;
            }
            match PortServer::start(
                user.port,
                &self.bind_host,
                self.repo.clone(),
                self.notifier.clone(),
                self.dial_timeout,
            )
            .await
            {
                Ok(Some(server)) => {
                    servers.insert(user.port, server);
                    started += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("failed to start port {}: {:#}", user.port, e);
                    last_error = Some(e);
                }
            }
        }

        if started == 0 {
            if let Some(e) = last_error {
                return Err(e.context("no port server could start"));
            }
        }
        info!("proxy fabric up: {} of {} user ports listening", started, users.len());
        Ok(started)
    }

    /// Stop-then-start of a single port. Other ports keep serving.
    pub async fn reload_port(&self, port: u16) -> Result<()> {
        let mut servers = self.servers.lock().await;
        if let Some(server) = servers.remove(&port) {
            server.stop().await;
        }
        if let Some(server) = PortServer::start(
            port,
            &self.bind_host,
            self.repo.clone(),
            self.notifier.clone(),
            self.dial_timeout,
        )
        .await?
        {
            servers.insert(port, server);
        }
        info!("port {} reloaded", port);
        Ok(())
    }

    /// Shut every listener down and drain their sessions. Safe to call
    /// more than once.
    pub async fn stop_all(&self) {
        let mut servers = self.servers.lock().await;
        if servers.is_empty() {
            return;
        }
        info!("stopping {} port servers", servers.len());
        for (_, server) in servers.drain() {
            server.stop().await;
        }
    }

    pub async fn listening_ports(&self) -> Vec<u16> {
        let servers = self.servers.lock().await;
        let mut ports: Vec<u16> = servers.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, AsyncBufReadExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    use crate::db::memory::MemoryRepository;
    use crate::db::{NewUser, Repository, UserRole};
    use crate::notify::LogNotifier;

    fn test_config(port_range: (u16, u16)) -> Config {
        Config {
            database_url: String::new(),
            proxy_host: "127.0.0.1".to_string(),
            port_range,
            scheduler_check_interval: 60,
            dial_timeout_secs: 2,
            app_api_host: String::new(),
            app_api_port: 0,
            app_api_token: String::new(),
            proxy_api_host: String::new(),
            proxy_api_port: 0,
            proxy_api_token: String::new(),
            log_level: "info".to_string(),
        }
    }

    async fn seed_user(repo: &MemoryRepository, tg_id: i64, port: u16) -> crate::db::User {
        repo.create_user(NewUser {
            tg_id,
            username: None,
            role: UserRole::User,
            port,
            login: "ivan_worker".to_string(),
            timezone: "UTC".to_string(),
            subscription_until: Utc::now() + chrono::Duration::days(30),
        })
        .await
        .unwrap()
    }

    fn fabric_for(repo: &Arc<MemoryRepository>, port_range: (u16, u16)) -> Arc<ProxyFabric> {
        let repo_dyn: Arc<dyn Repository> = repo.clone();
        Arc::new(ProxyFabric::new(
            repo_dyn,
            Arc::new(LogNotifier),
            &test_config(port_range),
        ))
    }

    /// A pool stub: every received line goes into the channel, every line
    /// gets an OK reply.
    async fn fake_pool() -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let _ = tx.send(line);
                        let _ = write
                            .write_all(b"{\"id\":1,\"result\":true,\"error\":null}\n")
                            .await;
                    }
                });
            }
        });
        (port, rx)
    }

    async fn read_line(stream: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn test_sleep_mode_replies_and_hangs_up() {
        let repo = Arc::new(MemoryRepository::new());
        seed_user(&repo, 1, 49411).await;
        let fabric = fabric_for(&repo, (49400, 49499));
        fabric.start_all().await.unwrap();

        let mut miner = TcpStream::connect("127.0.0.1:49411").await.unwrap();
        let reply = read_line(&mut miner).await;
        assert_eq!(
            reply,
            "{\"id\":null,\"result\":null,\"error\":{\"code\":-1,\"message\":\"proxy sleep\"}}\n"
        );
        // then FIN
        let mut rest = Vec::new();
        let n = miner.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);

        fabric.stop_all().await;
    }

    #[tokio::test]
    async fn test_authorize_rewrite_and_device_lifecycle() {
        let (pool_port, mut pool_rx) = fake_pool().await;
        let repo = Arc::new(MemoryRepository::new());
        let user = seed_user(&repo, 1, 49412).await;
        repo.add_mode(user.id, "day", "127.0.0.1", pool_port, "poolacct", true)
            .await
            .unwrap();

        let fabric = fabric_for(&repo, (49400, 49499));
        fabric.start_all().await.unwrap();

        let mut miner1 = TcpStream::connect("127.0.0.1:49412").await.unwrap();
        miner1
            .write_all(b"{\"id\":1,\"method\":\"mining.authorize\",\"params\":[\"ivan_worker.rig01\",\"x\"]}\n")
            .await
            .unwrap();

        let upstream_line = tokio::time::timeout(Duration::from_secs(2), pool_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            upstream_line,
            "{\"id\":1,\"method\":\"mining.authorize\",\"params\":[\"poolacct.rig01\",\"x\"]}"
        );

        // the pool's reply flows back to the miner untouched
        let reply = read_line(&mut miner1).await;
        assert_eq!(reply, "{\"id\":1,\"result\":true,\"error\":null}\n");

        let device = repo.find_device(user.id, "rig01").await.unwrap().unwrap();
        assert!(device.is_online);

        // a concurrent second rig with the same worker gets suffixed
        let mut miner2 = TcpStream::connect("127.0.0.1:49412").await.unwrap();
        miner2
            .write_all(b"{\"id\":1,\"method\":\"mining.authorize\",\"params\":[\"ivan_worker.rig01\",\"x\"]}\n")
            .await
            .unwrap();
        let upstream_line = tokio::time::timeout(Duration::from_secs(2), pool_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            upstream_line,
            "{\"id\":1,\"method\":\"mining.authorize\",\"params\":[\"poolacct.rig01-2\",\"x\"]}"
        );

        // first rig leaves: device stays online while the second lives
        drop(miner1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let device = repo.find_device(user.id, "rig01").await.unwrap().unwrap();
        assert!(device.is_online);

        drop(miner2);
        let mut offline = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let device = repo.find_device(user.id, "rig01").await.unwrap().unwrap();
            if !device.is_online {
                offline = true;
                break;
            }
        }
        assert!(offline, "device should go offline after the last rig leaves");

        fabric.stop_all().await;
    }

    #[tokio::test]
    async fn test_tls_from_miner_passes_through_untouched() {
        let (pool_port, mut pool_rx) = fake_pool().await;
        let repo = Arc::new(MemoryRepository::new());
        let user = seed_user(&repo, 1, 49413).await;
        repo.add_mode(user.id, "day", "127.0.0.1", pool_port, "poolacct", true)
            .await
            .unwrap();

        let fabric = fabric_for(&repo, (49400, 49499));
        fabric.start_all().await.unwrap();

        let mut miner = TcpStream::connect("127.0.0.1:49413").await.unwrap();
        // a TLS ClientHello fragment ending in '\n' so the line-based pool
        // stub reports what it saw
        miner.write_all(&[0x16, 0x03, 0x01, 0x41, 0x42, b'\n']).await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(2), pool_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.as_bytes(), &[0x16, 0x03, 0x01, 0x41, 0x42]);

        fabric.stop_all().await;
    }

    #[tokio::test]
    async fn test_dial_failure_notifies_miner() {
        let repo = Arc::new(MemoryRepository::new());
        let user = seed_user(&repo, 1, 49414).await;
        // nothing listens on this upstream port
        repo.add_mode(user.id, "day", "127.0.0.1", 1, "poolacct", true)
            .await
            .unwrap();

        let fabric = fabric_for(&repo, (49400, 49499));
        fabric.start_all().await.unwrap();

        let mut miner = TcpStream::connect("127.0.0.1:49414").await.unwrap();
        let reply = read_line(&mut miner).await;
        assert!(reply.starts_with("Ошибка подключения к пулу"), "got: {}", reply);

        fabric.stop_all().await;
    }

    #[tokio::test]
    async fn test_reload_port_cancels_old_sessions() {
        let (pool_port, mut pool_rx) = fake_pool().await;
        let repo = Arc::new(MemoryRepository::new());
        let user = seed_user(&repo, 1, 49415).await;
        repo.add_mode(user.id, "day", "127.0.0.1", pool_port, "poolacct", true)
            .await
            .unwrap();

        let fabric = fabric_for(&repo, (49400, 49499));
        fabric.start_all().await.unwrap();

        let mut miner = TcpStream::connect("127.0.0.1:49415").await.unwrap();
        miner
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), pool_rx.recv())
            .await
            .unwrap()
            .unwrap();

        fabric.reload_port(49415).await.unwrap();

        // the pre-reload session is gone by the time reload returns;
        // EOF and reset both count as "closed"
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), miner.read_to_end(&mut rest))
            .await
            .unwrap();

        // and the port accepts fresh sessions against the same snapshot
        let mut miner2 = TcpStream::connect("127.0.0.1:49415").await.unwrap();
        miner2
            .write_all(b"{\"id\":2,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        let line = tokio::time::timeout(Duration::from_secs(2), pool_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(line.contains("mining.subscribe"));

        fabric.stop_all().await;
        // stop_all twice is fine
        fabric.stop_all().await;
    }

    #[tokio::test]
    async fn test_port_move_frees_old_listener() {
        let repo = Arc::new(MemoryRepository::new());
        let user = seed_user(&repo, 1, 49416).await;
        let fabric = fabric_for(&repo, (49400, 49499));
        fabric.start_all().await.unwrap();
        assert_eq!(fabric.listening_ports().await, vec![49416]);

        let repo_dyn: Arc<dyn Repository> = repo.clone();
        repo_dyn.set_user_port(user.id, 49417).await.unwrap();
        fabric.reload_port(49416).await.unwrap();
        fabric.reload_port(49417).await.unwrap();

        assert_eq!(fabric.listening_ports().await, vec![49417]);
        assert!(TcpStream::connect("127.0.0.1:49416").await.is_err());
        assert!(TcpStream::connect("127.0.0.1:49417").await.is_ok());

        fabric.stop_all().await;
    }
}
