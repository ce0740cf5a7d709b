use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::handler::{Framing, Input};
use crate::transport::{Acceptor, Connector, Incoming, Transport, TransportReader, TransportWriter};

/// Byte-stream transport
///
/// Inputs are whatever bytes are available on the socket; the handler does
/// its own framing over the continuous stream.
pub struct StreamTransport<S> {
    stream: S,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

/// TCP flavour of [`StreamTransport`]
pub type TcpTransport = StreamTransport<TcpStream>;

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap any byte stream, e.g. an in-memory duplex pipe
    pub fn new(stream: S, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            local_addr,
            peer_addr,
        }
    }
}

impl StreamTransport<TcpStream> {
    /// Create from an existing TcpStream
    ///
    /// Disables Nagle and sets a zero linger, so the final close resets the
    /// connection instead of leaving it half-closed.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        #[allow(deprecated)]
        stream.set_linger(Some(Duration::ZERO))?;

        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self::new(stream, local_addr, peer_addr))
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn framing(&self) -> Framing {
        Framing::Stream
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn into_split(self) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            Box::new(StreamReader {
                inner: BufReader::new(read),
            }),
            Box::new(StreamWriter { inner: write }),
        )
    }
}

struct StreamReader<S> {
    inner: BufReader<ReadHalf<S>>,
}

#[async_trait::async_trait]
impl<S> TransportReader for StreamReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn next_input<'a>(&'a mut self) -> Result<Input<'a>> {
        // Wait until bytes are buffered so an idle handler never spins on EOF
        if self.inner.fill_buf().await?.is_empty() {
            return Err(Error::ConnectionClosed);
        }
        Ok(Input::new(&mut self.inner, Framing::Stream))
    }
}

struct StreamWriter<S> {
    inner: WriteHalf<S>,
}

#[async_trait::async_trait]
impl<S> TransportWriter for StreamWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// TCP acceptor used by [`Listener::tcp`](crate::Listener::tcp)
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to a local address
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait::async_trait]
impl Acceptor for TcpAcceptor {
    type Incoming = TcpIncoming;

    async fn accept(&mut self) -> io::Result<TcpIncoming> {
        let (stream, peer_addr) = self.listener.accept().await?;
        Ok(TcpIncoming { stream, peer_addr })
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
}

/// Accepted TCP socket; there is no handshake
pub struct TcpIncoming {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

#[async_trait::async_trait]
impl Incoming for TcpIncoming {
    type Transport = TcpTransport;

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn establish(self) -> Result<TcpTransport> {
        TcpTransport::from_stream(self.stream)
    }
}

/// TCP connector used by [`Dialer::tcp`](crate::Dialer::tcp)
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self, address: &str) -> Result<TcpTransport> {
        let stream = TcpStream::connect(address).await?;
        TcpTransport::from_stream(stream)
    }
}
