//! TCP listener that accepts peers and opens the handshake on each.
//!
//! Accepted sockets become listener-side [`Connection`]s sharing one RSA
//! identity, one socket pool and (if a UDP port is configured) one UDP
//! endpoint. The accept loop runs until the shutdown channel fires, then
//! kills every live connection and waits for them to drain.

use crate::config::NetworkConfig;
use crate::connection::{AcceptContext, AllowAll, Authenticator, Connection};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::RsaIdentity;
use crate::transport::lock;
use crate::transport::udp::UdpListener;
use crate::utils::buffer_pool::SocketPool;
use crate::utils::metrics::global_metrics;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

pub struct Listener {
    ctx: AcceptContext,
    tcp: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    connections: Arc<Mutex<HashMap<u64, Connection>>>,
}

impl Listener {
    /// Bind with a freshly generated RSA identity.
    pub async fn bind(config: NetworkConfig) -> Result<Self> {
        let bits = config.connection.rsa_bits;
        let identity = tokio::task::spawn_blocking(move || RsaIdentity::generate(bits))
            .await
            .map_err(|e| ProtocolError::Custom(format!("key generation task failed: {e}")))??;
        Self::bind_with_identity(config, Arc::new(identity)).await
    }

    /// Bind the TCP socket (and the UDP endpoint when `udp_port` is set).
    pub async fn bind_with_identity(config: NetworkConfig, identity: Arc<RsaIdentity>) -> Result<Self> {
        config.validate_strict()?;

        let tcp = TcpListener::bind(&config.listener.address).await?;
        let local_addr = tcp.local_addr()?;

        let udp = if config.listener.udp_port != 0 {
            let endpoint = UdpListener::bind(
                SocketAddr::new(local_addr.ip(), config.listener.udp_port),
                config.connection.transit,
                config.connection.max_body_size,
            )?;
            endpoint.start()?;
            Some(endpoint)
        } else {
            None
        };

        let pool = SocketPool::new(&config.pool, config.connection.max_body_size);
        info!(%local_addr, udp = ?udp.as_ref().and_then(|u| u.local_addr().ok()), "Listener bound");

        Ok(Self {
            ctx: AcceptContext {
                config: Arc::new(config),
                identity,
                pool,
                udp,
                authenticator: Arc::new(AllowAll),
            },
            tcp: tokio::sync::Mutex::new(Some(tcp)),
            local_addr,
            connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.ctx.authenticator = Arc::new(authenticator);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn identity(&self) -> &Arc<RsaIdentity> {
        &self.ctx.identity
    }

    /// Pool shared by accepted connections. Each live connection holds one
    /// accept slot.
    pub fn pool(&self) -> &SocketPool {
        &self.ctx.pool
    }

    pub fn udp(&self) -> Option<&Arc<UdpListener>> {
        self.ctx.udp.as_ref()
    }

    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.connections)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_connections(&self) -> usize {
        lock(&self.connections)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    /// Accept until ctrl-c.
    pub async fn serve<F>(&self, on_accept: F) -> Result<()>
    where
        F: Fn(&Connection) + Send + Sync,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, initiating graceful shutdown");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.serve_with_shutdown(on_accept, shutdown_rx).await
    }

    /// Accept until `shutdown_rx` fires. `on_accept` sees each connection
    /// before its hello goes out, so handlers registered there never miss a
    /// packet.
    #[instrument(skip(self, on_accept, shutdown_rx), fields(address = %self.local_addr))]
    pub async fn serve_with_shutdown<F>(&self, on_accept: F, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()>
    where
        F: Fn(&Connection) + Send + Sync,
    {
        let listener = self
            .tcp
            .lock()
            .await
            .take()
            .ok_or_else(|| ProtocolError::Custom("listener is already serving".into()))?;
        let mut incoming = TcpListenerStream::new(listener);
        info!("Accepting connections");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
                accepted = incoming.next() => match accepted {
                    Some(Ok(stream)) => self.admit(stream, &on_accept),
                    Some(Err(e)) => {
                        global_metrics().connection_error();
                        error!(error = %e, "Accept failed");
                    }
                    None => break,
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn admit<F>(&self, stream: TcpStream, on_accept: &F)
    where
        F: Fn(&Connection),
    {
        let peer = stream.peer_addr().ok();
        if self.active_connections() >= self.ctx.config.listener.max_connections {
            warn!(?peer, "Connection limit reached, refusing peer");
            return;
        }

        let accepted = stream
            .into_std()
            .map_err(ProtocolError::from)
            .and_then(|stream| Connection::accept(stream, &self.ctx));
        let conn = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                global_metrics().connection_error();
                warn!(?peer, error = %e, "Failed to set up accepted connection");
                return;
            }
        };

        let registry = Arc::downgrade(&self.connections);
        let conn_id = conn.id();
        conn.on_kill(move |_, reason| {
            debug!(conn_id, %reason, "Connection left listener");
            if let Some(registry) = registry.upgrade() {
                if let Ok(mut connections) = registry.lock() {
                    connections.remove(&conn_id);
                }
            }
        });
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(conn_id, conn.clone());
        }

        on_accept(&conn);
        if let Err(e) = conn.start() {
            conn.kill(format!("handshake could not start: {e}"), false);
            return;
        }
        info!(conn_id, ?peer, "Connection accepted");
    }

    /// Kill every live connection and wait (bounded) for them to go away.
    pub async fn shutdown(&self) {
        for conn in self.connections() {
            conn.kill("listener shutting down", true);
        }
        if let Some(udp) = &self.ctx.udp {
            udp.stop();
        }

        let timeout = tokio::time::sleep(self.ctx.config.listener.shutdown_timeout);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                _ = &mut timeout => {
                    warn!(remaining = self.active_connections(), "Shutdown timeout reached, abandoning connections");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if self.active_connections() == 0 {
                        info!("All connections closed, shutting down");
                        break;
                    }
                }
            }
        }
    }
}
