use std::io;
use std::net::SocketAddr;

use crate::error::Result;
use crate::handler::{Framing, Input};

pub mod tcp;
pub mod websocket;

pub use self::tcp::{StreamTransport, TcpAcceptor, TcpConnector, TcpIncoming, TcpTransport};
pub use self::websocket::{WsAcceptor, WsConnector, WsIncoming, WsTransport};

/// An established socket, ready to be split between a reader and a writer unit
///
/// Each transport instance represents a single connection.
pub trait Transport: Send + 'static {
    /// How this transport delimits a unit of input
    fn framing(&self) -> Framing;

    /// Local address of the socket
    fn local_addr(&self) -> SocketAddr;

    /// Remote address of the socket
    fn peer_addr(&self) -> SocketAddr;

    /// Split into independently owned read and write halves.
    ///
    /// The socket is released once both halves are dropped.
    fn into_split(self) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>);
}

/// Read half of a [`Transport`]
#[async_trait::async_trait]
pub trait TransportReader: Send {
    /// Wait for the next unit of input.
    ///
    /// Fails once the peer has gone away or the socket errored.
    async fn next_input<'a>(&'a mut self) -> Result<Input<'a>>;
}

/// Write half of a [`Transport`]
#[async_trait::async_trait]
pub trait TransportWriter: Send {
    /// Send one serialized outbound message
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Listening side of a transport, driven by the listener's accept loop
#[async_trait::async_trait]
pub trait Acceptor: Send + 'static {
    type Incoming: Incoming;

    /// Accept the next raw socket
    async fn accept(&mut self) -> io::Result<Self::Incoming>;

    /// Get the local address this acceptor is bound to
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// A freshly accepted socket that has not finished its handshake yet
///
/// Establishing runs on the per-connection task, never on the accept loop.
#[async_trait::async_trait]
pub trait Incoming: Send + 'static {
    type Transport: Transport;

    fn peer_addr(&self) -> SocketAddr;

    /// Finish any handshake and produce the transport
    async fn establish(self) -> Result<Self::Transport>;
}

/// Dialing side of a transport
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Open an outbound socket to `address`
    async fn connect(&self, address: &str) -> Result<Self::Transport>;
}
