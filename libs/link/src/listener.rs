use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ListenerConfig, WebSocketConfig, ACCEPT_BACKOFF};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::transport::{Acceptor, Incoming, TcpAcceptor, WsAcceptor};

/// Registration callback receiving every accepted connection
///
/// It must call [`Connection::accept`] before returning, otherwise the
/// connection is torn down as rejected.
pub type ConnectionCallback<H> = Arc<dyn Fn(Connection<H>) + Send + Sync>;

/// A running accept loop
///
/// Created through [`Listener::tcp`] or [`Listener::websocket`].
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Builder for a plain TCP listener
    pub fn tcp<H: Handler>() -> ListenerBuilder<H> {
        ListenerBuilder::new(None)
    }

    /// Builder for a WebSocket listener
    pub fn websocket<H: Handler>() -> ListenerBuilder<H> {
        ListenerBuilder::new(Some(WebSocketConfig::default()))
    }

    fn spawn<A, H>(acceptor: A, on_connection: ConnectionCallback<H>, queue_capacity: usize) -> Result<Self>
    where
        A: Acceptor,
        H: Handler,
    {
        let local_addr = acceptor.local_addr()?;
        let shutdown = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            acceptor,
            on_connection,
            queue_capacity,
            shutdown.clone(),
        ));

        debug!("listening on {}", local_addr);
        Ok(Self {
            local_addr,
            stopped: AtomicBool::new(false),
            shutdown,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop accepting and close the listening socket
    ///
    /// Waits for the accept loop to exit. Connections already accepted keep
    /// running. Calling this more than once is a no-op.
    pub async fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.shutdown.cancel();
        let accept_loop = self
            .accept_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(accept_loop) = accept_loop {
            if let Err(e) = accept_loop.await {
                error!("accept loop on {} failed: {}", self.local_addr, e);
            }
        }
        debug!("listener on {} stopped", self.local_addr);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop<A, H>(
    mut acceptor: A,
    on_connection: ConnectionCallback<H>,
    queue_capacity: usize,
    shutdown: CancellationToken,
) where
    A: Acceptor,
    H: Handler,
{
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };

        match accepted {
            Ok(incoming) => {
                tokio::spawn(serve(incoming, Arc::clone(&on_connection), queue_capacity));
            }
            Err(e) => {
                warn!("accept error: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    // Dropping the acceptor closes the listening socket
}

async fn serve<I, H>(incoming: I, on_connection: ConnectionCallback<H>, queue_capacity: usize)
where
    I: Incoming,
    H: Handler,
{
    let peer_addr = incoming.peer_addr();
    let transport = match incoming.establish().await {
        Ok(transport) => transport,
        Err(e) => {
            error!("handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };

    let connection = Connection::new(transport, queue_capacity);
    on_connection(connection.clone());
    connection.run().await;
}

/// Builder for configuring and starting a [`Listener`]
pub struct ListenerBuilder<H: Handler> {
    config: ListenerConfig,
    websocket: Option<WebSocketConfig>,
    on_connection: Option<ConnectionCallback<H>>,
    // WebSocket-only setting applied to a TCP builder
    misapplied: Option<&'static str>,
}

impl<H: Handler> ListenerBuilder<H> {
    fn new(websocket: Option<WebSocketConfig>) -> Self {
        Self {
            config: ListenerConfig::default(),
            websocket,
            on_connection: None,
            misapplied: None,
        }
    }

    fn websocket_mut(&mut self, setting: &'static str) -> Option<&mut WebSocketConfig> {
        if self.websocket.is_none() {
            self.misapplied.get_or_insert(setting);
        }
        self.websocket.as_mut()
    }

    /// Replace the shared listener settings
    pub fn config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the address to bind
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    /// Set the outbound queue capacity of accepted connections
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the registration callback
    pub fn on_connection<F>(mut self, callback: F) -> Self
    where
        F: Fn(Connection<H>) + Send + Sync + 'static,
    {
        self.on_connection = Some(Arc::new(callback));
        self
    }

    /// Replace the WebSocket settings
    ///
    /// Only valid on a [`Listener::websocket`] builder; on a TCP builder
    /// [`start`](Self::start) fails with [`Error::Config`].
    pub fn websocket_config(mut self, config: WebSocketConfig) -> Self {
        if let Some(websocket) = self.websocket_mut("websocket_config") {
            *websocket = config;
        }
        self
    }

    /// Set the WebSocket handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        if let Some(websocket) = self.websocket_mut("handshake_timeout") {
            websocket.handshake_timeout = Some(timeout);
        }
        self
    }

    /// Serve WebSockets over TLS with the given PEM files
    pub fn tls(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        if let Some(websocket) = self.websocket_mut("tls") {
            websocket.cert_file = Some(cert_file.into());
            websocket.key_file = Some(key_file.into());
        }
        self
    }

    /// Bind and start the accept loop
    pub async fn start(self) -> Result<Listener> {
        let on_connection = self
            .on_connection
            .ok_or_else(|| Error::Config("New connection callback not set".to_string()))?;

        if let Some(setting) = self.misapplied {
            return Err(Error::Config(format!(
                "{} only applies to WebSocket listeners",
                setting
            )));
        }

        if self.config.address.is_empty() {
            return Err(Error::Config("Address not set".to_string()));
        }

        match self.websocket {
            None => {
                let acceptor = TcpAcceptor::bind(&self.config.address).await?;
                Listener::spawn(acceptor, on_connection, self.config.queue_capacity)
            }
            Some(websocket) => {
                let acceptor = WsAcceptor::bind(&self.config.address, &websocket).await?;
                Listener::spawn(acceptor, on_connection, self.config.queue_capacity)
            }
        }
    }
}
