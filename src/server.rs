//! Proxy listener with bounded admission and graceful shutdown

use crate::error::{ProxyError, Result};
use crate::proxy::Proxy;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Accepts client connections and hands each one to the [`Proxy`]
pub struct ProxyServer {
    proxy: Arc<Proxy>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    permits: Arc<Semaphore>,
    active: Arc<watch::Sender<usize>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Counts one in-flight connection for as long as it lives
struct ActiveConnection(Arc<watch::Sender<usize>>);

impl ActiveConnection {
    fn new(active: &Arc<watch::Sender<usize>>) -> Self {
        active.send_modify(|n| *n += 1);
        Self(active.clone())
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

impl ProxyServer {
    /// Bind the listening socket. Connections are not accepted until
    /// [`serve`](Self::serve) runs.
    pub async fn bind(addr: SocketAddr, proxy: Arc<Proxy>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let max_connections = proxy.config().max_connections.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        let (active, _) = watch::channel(0);

        Ok(Self {
            proxy,
            listener: Mutex::new(Some(listener)),
            local_addr,
            permits: Arc::new(Semaphore::new(max_connections)),
            active: Arc::new(active),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently being handled
    pub fn active_connections(&self) -> usize {
        *self.active.borrow()
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// Accepted connections beyond `max_connections` wait for a free slot.
    pub async fn serve(&self) -> Result<()> {
        let listener = self.listener.lock().take().ok_or_else(|| {
            ProxyError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                "proxy server is already serving",
            ))
        })?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!("Proxy listening on {}", self.local_addr);

        while !*shutdown_rx.borrow() {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown_rx.changed() => break,
            };

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            let active = ActiveConnection::new(&self.active);
            let proxy = self.proxy.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle(stream, remote_addr).await {
                    debug!("Connection from {} ended: {}", remote_addr, e);
                }
                drop(permit);
                drop(active);
            });
        }

        info!("Proxy on {} stopped accepting connections", self.local_addr);
        Ok(())
    }

    /// Stop accepting and wait up to `grace` for in-flight connections
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.shutdown_tx.send_replace(true);

        let mut active = self.active.subscribe();
        let result = match timeout(grace, active.wait_for(|n| *n == 0)).await {
            Ok(_) => {
                info!("Proxy connections drained");
                Ok(())
            }
            Err(_) => {
                let active = self.active_connections();
                warn!(
                    "Shutdown grace period elapsed with {} connection(s) in flight",
                    active
                );
                Err(ProxyError::ShutdownTimeout(active))
            }
        };
        result
    }
}
