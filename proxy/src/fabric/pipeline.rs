/// One accepted miner connection: dial the pool, pump bytes both ways,
/// keep the worker registry and device records in step.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_native_tls::{native_tls, TlsConnector};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::port_server::PortSnapshot;
use crate::db::Repository;
use crate::notify::Notifier;
use crate::resolver::ResolvedMode;
use crate::rewrite::{classify_pool_line, rewrite_line, Frame, MinerStream, PoolDiag};
use crate::workers::WorkerRegistry;

/// Pool ports that are conventionally TLS endpoints.
pub const TLS_UPSTREAM_PORTS: [u16; 3] = [443, 3334, 4444];

/// Sent to the miner when its port's mode is Sleep.
pub const SLEEP_REPLY: &str = r#"{"id":null,"result":null,"error":{"code":-1,"message":"proxy sleep"}}"#;

const READ_BUF: usize = 4096;

enum Upstream {
    Plain(TcpStream),
    Tls(tokio_native_tls::TlsStream<TcpStream>),
}

pub struct Pipeline {
    id: Uuid,
    snapshot: Arc<PortSnapshot>,
    registry: Arc<WorkerRegistry>,
    repo: Arc<dyn Repository>,
    #[cfg_attr(not(feature = "offline-notify"), allow(dead_code))]
    notifier: Arc<dyn Notifier>,
    dial_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        snapshot: Arc<PortSnapshot>,
        registry: Arc<WorkerRegistry>,
        repo: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            snapshot,
            registry,
            repo,
            notifier,
            dial_timeout,
        }
    }

    pub async fn run(self, mut miner: TcpStream, peer: SocketAddr, mut shutdown: watch::Receiver<bool>) {
        set_keepalive(&miner);

        if Utc::now() > self.snapshot.subscription_until {
            info!(
                "port {}: subscription of user {} expired, refusing {}",
                self.snapshot.listen_port, self.snapshot.user_id, peer
            );
            let _ = miner
                .write_all("Подписка истекла. Обратитесь к администратору.\n".as_bytes())
                .await;
            let _ = miner.shutdown().await;
            return;
        }

        let (host, pool_port, alias) = match &self.snapshot.mode {
            ResolvedMode::Sleep => {
                info!(
                    "port {}: sleep mode, refusing {}",
                    self.snapshot.listen_port, peer
                );
                let _ = miner.write_all(format!("{}\n", SLEEP_REPLY).as_bytes()).await;
                let _ = miner.shutdown().await;
                return;
            }
            ResolvedMode::Live { host, port, alias, .. } => (host.clone(), *port, alias.clone()),
        };

        // A port reload must not wait out a slow dial.
        let dialed = tokio::select! {
            _ = shutdown.changed() => {
                let _ = miner.shutdown().await;
                return;
            }
            dialed = timeout(self.dial_timeout, dial(&host, pool_port)) => dialed,
        };
        let upstream = match dialed {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                warn!(
                    "port {}: upstream dial {}:{} failed: {:#}",
                    self.snapshot.listen_port, host, pool_port, e
                );
                let _ = miner
                    .write_all(format!("Ошибка подключения к пулу: {:#}\n", e).as_bytes())
                    .await;
                let _ = miner.shutdown().await;
                return;
            }
            Err(_) => {
                warn!(
                    "port {}: upstream dial {}:{} timed out after {:?}",
                    self.snapshot.listen_port, host, pool_port, self.dial_timeout
                );
                let _ = miner
                    .write_all("Ошибка подключения к пулу: timeout\n".as_bytes())
                    .await;
                let _ = miner.shutdown().await;
                return;
            }
        };

        info!(
            "port {}: {} -> {}:{} (login='{}', alias='{}', mode='{}')",
            self.snapshot.listen_port,
            peer,
            host,
            pool_port,
            self.snapshot.login,
            alias,
            self.snapshot.mode_name
        );

        match upstream {
            Upstream::Plain(stream) => self.forward(miner, stream, alias, peer, shutdown).await,
            Upstream::Tls(stream) => self.forward(miner, stream, alias, peer, shutdown).await,
        }
    }

    /// Run both directions until one side closes, a shutdown is signalled,
    /// or an error ends the session; then drain the other task and release
    /// everything this pipeline claimed.
    async fn forward<U>(
        self,
        miner: TcpStream,
        upstream: U,
        alias: String,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) where
        U: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (miner_read, miner_write) = miner.into_split();
        let (upstream_read, upstream_write) = tokio::io::split(upstream);

        // Worker from the last forwarded authorize, for offline bookkeeping.
        let authorized: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut miner_to_pool = tokio::spawn(pump_miner_to_pool(
            miner_read,
            upstream_write,
            alias,
            self.id,
            self.registry.clone(),
            self.repo.clone(),
            self.snapshot.clone(),
            authorized.clone(),
        ));
        let mut pool_to_miner = tokio::spawn(pump_pool_to_miner(
            upstream_read,
            miner_write,
            self.snapshot.listen_port,
        ));

        let mut miner_side_done = false;
        let mut pool_side_done = false;
        tokio::select! {
            _ = &mut miner_to_pool => { miner_side_done = true; }
            _ = &mut pool_to_miner => { pool_side_done = true; }
            _ = shutdown.changed() => {
                debug!("port {}: shutdown requested, cancelling {}", self.snapshot.listen_port, peer);
            }
        }

        // Dropping the halves inside the aborted tasks closes both sockets.
        if !miner_side_done {
            miner_to_pool.abort();
            let _ = miner_to_pool.await;
        }
        if !pool_side_done {
            pool_to_miner.abort();
            let _ = pool_to_miner.await;
        }

        if let Some(released) = self.registry.release(self.id) {
            if released.now_zero {
                let worker = authorized.lock().unwrap().clone();
                if let Some(worker) = worker {
                    if let Err(e) = self
                        .repo
                        .mark_device_offline(self.snapshot.user_id, &worker, Utc::now())
                        .await
                    {
                        warn!(
                            "port {}: failed to mark device '{}' offline: {:#}",
                            self.snapshot.listen_port, worker, e
                        );
                    }
                    #[cfg(feature = "offline-notify")]
                    if let Err(e) = self
                        .notifier
                        .notify(
                            self.snapshot.tg_id,
                            &format!("Воркер {} отключился.", worker),
                        )
                        .await
                    {
                        warn!("offline notification failed: {:#}", e);
                    }
                }
            }
        }

        info!("port {}: session {} closed", self.snapshot.listen_port, peer);
    }
}

async fn dial(host: &str, port: u16) -> Result<Upstream> {
    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connect {}:{}", host, port))?;
    set_keepalive(&tcp);

    if TLS_UPSTREAM_PORTS.contains(&port) {
        let connector = TlsConnector::from(
            native_tls::TlsConnector::new().context("build TLS connector")?,
        );
        let tls = connector
            .connect(host, tcp)
            .await
            .with_context(|| format!("TLS handshake with {}:{}", host, port))?;
        debug!("connected to pool {}:{} over TLS", host, port);
        Ok(Upstream::Tls(tls))
    } else {
        debug!("connected to pool {}:{}", host, port);
        Ok(Upstream::Plain(tcp))
    }
}

/// Miner bytes: framed, rewritten, forwarded. Registry claims happen
/// before the rewritten line reaches the socket.
#[allow(clippy::too_many_arguments)]
async fn pump_miner_to_pool<W>(
    mut miner_read: tokio::net::tcp::OwnedReadHalf,
    mut upstream_write: W,
    alias: String,
    conn_id: Uuid,
    registry: Arc<WorkerRegistry>,
    repo: Arc<dyn Repository>,
    snapshot: Arc<PortSnapshot>,
    authorized: Arc<Mutex<Option<String>>>,
) where
    W: AsyncWrite + Unpin,
{
    let mut stream = MinerStream::new();
    let mut tls_warned = false;
    let mut buf = [0u8; READ_BUF];

    loop {
        let n = match miner_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_io_error("miner read", snapshot.listen_port, &e);
                return;
            }
        };

        let frames = stream.feed(&buf[..n]);
        if stream.is_passthrough() && !tls_warned {
            warn!(
                "port {}: TLS traffic from miner, credential rewrite disabled for this session",
                snapshot.listen_port
            );
            tls_warned = true;
        }

        for frame in frames {
            let bytes = match frame {
                Frame::Raw(bytes) => bytes,
                Frame::Line(line) => {
                    process_line(
                        &line, &alias, conn_id, &registry, &repo, &snapshot, &authorized,
                    )
                    .await
                }
            };
            if let Err(e) = upstream_write.write_all(&bytes).await {
                log_io_error("upstream write", snapshot.listen_port, &e);
                return;
            }
        }
    }

    // The miner closed mid-line: a complete trailing object is still
    // processed, anything else goes out untouched.
    if let Some(tail) = stream.take_tail() {
        let bytes = if serde_json::from_slice::<serde_json::Value>(&tail).is_ok() {
            process_line(
                &tail, &alias, conn_id, &registry, &repo, &snapshot, &authorized,
            )
            .await
        } else {
            tail
        };
        if let Err(e) = upstream_write.write_all(&bytes).await {
            log_io_error("upstream write", snapshot.listen_port, &e);
        }
    }
}

async fn process_line(
    line: &[u8],
    alias: &str,
    conn_id: Uuid,
    registry: &Arc<WorkerRegistry>,
    repo: &Arc<dyn Repository>,
    snapshot: &Arc<PortSnapshot>,
    authorized: &Arc<Mutex<Option<String>>>,
) -> Vec<u8> {
    let outcome = rewrite_line(line, alias, |base| registry.claim(conn_id, base));
    if let Some(worker) = outcome.authorized_worker {
        debug!(
            "port {}: authorize for worker '{}' (alias '{}')",
            snapshot.listen_port, worker, alias
        );
        *authorized.lock().unwrap() = Some(worker.clone());
        if let Err(e) = repo.upsert_device(snapshot.user_id, &worker, Utc::now()).await {
            warn!(
                "port {}: device upsert for '{}' failed: {:#}",
                snapshot.listen_port, worker, e
            );
        }
    }
    outcome.bytes
}

/// Pool bytes: forwarded verbatim, observed line-by-line for diagnostics.
async fn pump_pool_to_miner<R>(
    mut upstream_read: R,
    mut miner_write: tokio::net::tcp::OwnedWriteHalf,
    listen_port: u16,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUF];
    let mut diag_buf: Vec<u8> = Vec::new();
    let mut benign_rejects: u64 = 0;

    loop {
        let n = match upstream_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_io_error("upstream read", listen_port, &e);
                return;
            }
        };

        diag_buf.extend_from_slice(&buf[..n]);
        while let Some(pos) = diag_buf.iter().position(|&b| b == b'\n') {
            let rest = diag_buf.split_off(pos + 1);
            let line = std::mem::replace(&mut diag_buf, rest);
            match classify_pool_line(&line) {
                Some(PoolDiag::Benign(message)) => {
                    benign_rejects += 1;
                    info!(
                        "port {}: pool reject '{}' (benign, total {})",
                        listen_port, message, benign_rejects
                    );
                }
                Some(PoolDiag::Error(message)) => {
                    warn!("port {}: pool error '{}'", listen_port, message);
                }
                None => {}
            }
        }

        if let Err(e) = miner_write.write_all(&buf[..n]).await {
            log_io_error("miner write", listen_port, &e);
            return;
        }
    }
}

fn log_io_error(what: &str, listen_port: u16, e: &std::io::Error) {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
            info!("port {}: {} closed ({})", listen_port, what, e);
        }
        _ => {
            warn!("port {}: {} error: {}", listen_port, what, e);
        }
    }
}

fn set_keepalive(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!("failed to enable TCP keepalive: {}", e);
    }
}
