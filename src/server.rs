//! Listeners, the accept fan-in and the connection registry

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::connection::FtpConnection;
use crate::context::{ControlSecurity, Services};
use crate::protocol::{reply, timeouts, ACCEPT_QUEUE_CAPACITY};
use crate::response::Response;
use crate::server_command::ServerCommand;
use crate::stats::{ServerStatistics, StatisticsSnapshot};

const LISTEN_BACKLOG: i32 = 1024;

/// Addresses to listen on for a configured listen value.
///
/// `*` means IPv4 and IPv6 any, empty or `any` means IPv4 any. Anything
/// else is an IP address or a host name resolving to one or more addresses.
pub async fn listen_addresses(listen: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let listen = listen.trim();
    let any4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let any6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    match listen {
        "*" => return Ok(vec![any4, any6]),
        "" | "any" => return Ok(vec![any4]),
        _ => {}
    }
    if let Ok(ip) = listen.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((listen, port))
        .await
        .with_context(|| format!("resolve listen address {}", listen))?
        .collect();
    addrs.dedup();
    if addrs.is_empty() {
        anyhow::bail!("listen address {} resolved to nothing", listen);
    }
    Ok(addrs)
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into()).with_context(|| format!("bind {}", addr))?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// A running FTP server.
pub struct FtpServer {
    services: Arc<Services>,
    statistics: Arc<ServerStatistics>,
    connections: Arc<Mutex<HashMap<String, Arc<FtpConnection>>>>,
    local_addrs: Vec<SocketAddr>,
    listeners: Mutex<Vec<TcpListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl FtpServer {
    /// Binds every listen address. Connections are only accepted after
    /// [`FtpServer::start`].
    pub async fn bind(mut services: Services) -> Result<Arc<Self>> {
        let statistics = Arc::new(ServerStatistics::default());
        services.collectors.push(statistics.clone());

        let config = &services.config;
        if config.tls.implicit && services.tls.is_none() {
            anyhow::bail!("implicit TLS requires a certificate");
        }
        let mut port = config.port;
        let mut listeners = Vec::new();
        let mut local_addrs = Vec::new();
        for addr in listen_addresses(&config.listen, config.port).await? {
            // With port 0 every address shares the first bound port
            let listener = bind_listener(SocketAddr::new(addr.ip(), port))?;
            let local = listener.local_addr()?;
            if port == 0 {
                port = local.port();
            }
            info!(addr = %local, "listening");
            local_addrs.push(local);
            listeners.push(listener);
        }

        Ok(Arc::new(Self {
            services: Arc::new(services),
            statistics,
            connections: Arc::new(Mutex::new(HashMap::new())),
            local_addrs,
            listeners: Mutex::new(listeners),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    pub fn connections(&self) -> Vec<Arc<FtpConnection>> {
        self.connections.lock().values().cloned().collect()
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Spawns the accept loops, the connection loop and the inactivity sweep.
    pub fn start(self: &Arc<Self>) {
        let listeners: Vec<TcpListener> = self.listeners.lock().drain(..).collect();
        let (tx, mut rx) = mpsc::channel::<(TcpStream, SocketAddr)>(ACCEPT_QUEUE_CAPACITY);
        let mut tasks = self.tasks.lock();

        for listener in listeners {
            let tx = tx.clone();
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        r = listener.accept() => r,
                        _ = shutdown.cancelled() => break,
                    };
                    match accepted {
                        Ok(pair) => {
                            if tx.send(pair).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
            }));
        }
        drop(tx);

        let this = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let (stream, remote) = tokio::select! {
                    next = rx.recv() => match next {
                        Some(pair) => pair,
                        None => break,
                    },
                    _ = this.shutdown.cancelled() => break,
                };
                let server = this.clone();
                tokio::spawn(async move { server.accept(stream, remote).await });
            }
        }));

        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.sweep_inactive().await }));
    }

    async fn accept(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(%remote, "no local address: {}", e);
                return;
            }
        };

        let implicit = self.services.config.tls.implicit;
        let connection = match (&self.services.tls, implicit) {
            (Some(identity), true) => {
                let handshake = tokio::time::timeout(timeouts::tls_handshake(), identity.acceptor().accept(stream));
                match handshake.await {
                    Ok(Ok(tls)) => {
                        FtpConnection::new(tls, local, remote, self.services.clone(), ControlSecurity::Implicit)
                    }
                    Ok(Err(e)) => {
                        info!(%remote, "implicit TLS handshake failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        info!(%remote, "implicit TLS handshake timed out");
                        return;
                    }
                }
            }
            _ => FtpConnection::new(stream, local, remote, self.services.clone(), ControlSecurity::Plain),
        };

        let id = connection.id().to_string();
        let limit = self.services.config.max_connections;
        let full = {
            let mut registry = self.connections.lock();
            let full = limit > 0 && registry.len() >= limit;
            if !full {
                registry.insert(id.clone(), connection.clone());
            }
            full
        };

        if let Err(e) = connection.start().await {
            warn!(%remote, "connection start failed: {:#}", e);
            self.connections.lock().remove(&id);
            connection.stop().await;
            return;
        }
        info!(connection_id = %id, %remote, "client connected");

        let ctx = connection.context();
        let greeting = if full {
            Response::new(reply::SERVICE_NOT_AVAILABLE, ctx.t("Too many users, server is full."))
        } else {
            Response::new(reply::READY, self.services.config.banner.clone())
        };
        let _ = ctx.server_commands.respond(greeting).await;

        let connections = self.connections.clone();
        let closed = connection.closed().clone();
        tokio::spawn(
            async move {
                closed.cancelled().await;
                connection.stop().await;
                connections.lock().remove(&id);
            }
            .instrument(tracing::debug_span!("registry")),
        );
    }

    /// Closes connections that have been idle past the inactivity timeout.
    async fn sweep_inactive(&self) {
        let mut interval = tokio::time::interval(self.services.config.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => break,
            }
            for connection in self.connections() {
                let ctx = connection.context();
                if ctx.keepalive.is_alive() {
                    continue;
                }
                info!(connection_id = %ctx.id(), idle_secs = ctx.keepalive.idle_for().as_secs(), "closing idle connection");
                let idle = Response::new(reply::SERVICE_NOT_AVAILABLE, ctx.t("Idle timeout, closing control connection."));
                let _ = ctx.server_commands.try_send(ServerCommand::SendResponse(idle));
                if ctx.server_commands.try_send(ServerCommand::CloseConnection).is_err() {
                    ctx.closed().cancel();
                }
            }
        }
    }

    /// Stops accepting and closes every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let connections: Vec<Arc<FtpConnection>> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.stop().await;
        }
        info!("server stopped");
    }

    /// Resolves once [`FtpServer::shutdown`] has been requested.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }
}
