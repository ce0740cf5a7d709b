use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_rustls::rustls::ClientConfig;

use crate::config::DialerConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::transport::{Connector, TcpConnector, WsConnector};

/// Asynchronously opens outbound connections
///
/// Every [`dial`](Self::dial) is an independent attempt on its own task.
#[derive(Debug, Clone)]
pub struct Dialer<C> {
    connector: Arc<C>,
    config: DialerConfig,
}

impl Dialer<TcpConnector> {
    /// Dial `host:port` addresses over TCP
    pub fn tcp() -> Self {
        Self::new(TcpConnector)
    }
}

impl Dialer<WsConnector> {
    /// Dial `ws://` and `wss://` URLs
    pub fn websocket() -> Self {
        Self::new(WsConnector::default())
    }

    /// Dial `wss://` URLs trusting the given TLS client configuration
    pub fn websocket_tls(config: Arc<ClientConfig>) -> Self {
        Self::new(WsConnector::with_tls(config))
    }
}

impl<C: Connector> Dialer<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            config: DialerConfig::default(),
        }
    }

    /// Replace the dialer settings
    pub fn config(mut self, config: DialerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Set the outbound queue capacity of dialed connections
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Connect to `address` in the background
    ///
    /// `callback` receives the error if connecting fails. On success it
    /// receives the connection and must call [`Connection::accept`] before
    /// returning; the connection lifecycle then runs on the returned task.
    pub fn dial<H, F>(&self, address: impl Into<String>, callback: F) -> JoinHandle<()>
    where
        H: Handler,
        F: FnOnce(Result<Connection<H>>) + Send + 'static,
    {
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        let address = address.into();

        tokio::spawn(async move {
            let connect_op = connector.connect(&address);
            let connected = match config.connect_timeout {
                Some(timeout) => tokio::time::timeout(timeout, connect_op)
                    .await
                    .unwrap_or_else(|_| Err(Error::custom("Connect timeout exceeded"))),
                None => connect_op.await,
            };

            let transport = match connected {
                Ok(transport) => transport,
                Err(e) => {
                    callback(Err(e));
                    return;
                }
            };

            let connection = Connection::new(transport, config.queue_capacity);
            callback(Ok(connection.clone()));
            connection.run().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    use crate::handler::Input;
    use crate::transport::TcpTransport;

    struct Ignore;

    #[async_trait::async_trait]
    impl Handler for Ignore {
        type Message = ();

        async fn read(&self, _input: &mut Input<'_>) -> Result<()> {
            Ok(())
        }

        fn write(&self, _output: &mut Vec<u8>, _message: ()) -> Result<()> {
            Ok(())
        }

        fn on_close(&self, _error: Option<Error>) {}
    }

    /// Connector for a peer that never answers
    #[derive(Debug)]
    struct Blackhole;

    #[async_trait::async_trait]
    impl Connector for Blackhole {
        type Transport = TcpTransport;

        async fn connect(&self, _address: &str) -> Result<TcpTransport> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn connect_timeout_is_reported() {
        let dialer = Dialer::new(Blackhole).connect_timeout(Duration::from_millis(50));

        let (tx, rx) = oneshot::channel();
        let task = dialer.dial("10.255.255.1:9", move |result: Result<Connection<Ignore>>| {
            let _ = tx.send(result.map(|_| ()));
        });

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(Error::Custom(msg)) => assert_eq!(msg, "Connect timeout exceeded"),
            other => panic!("Expected timeout, got {:?}", other),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn config_carries_queue_capacity() {
        let dialer = Dialer::tcp().queue_capacity(3).connect_timeout(Duration::from_secs(1));
        assert_eq!(dialer.config.queue_capacity, 3);
        assert_eq!(dialer.config.connect_timeout, Some(Duration::from_secs(1)));
    }
}
