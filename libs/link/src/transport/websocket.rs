use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{Method, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector as TlsConnector, MaybeTlsStream, WebSocketStream};

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::handler::{Framing, Input};
use crate::tls;
use crate::transport::{Acceptor, Connector, Incoming, Transport, TransportReader, TransportWriter};

/// Byte stream a server-side WebSocket runs over, plain or TLS
pub trait ServerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ServerIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Message transport over a WebSocket
///
/// Every input is one complete message; every send is one binary frame.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: WebSocketStream<S>, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            local_addr,
            peer_addr,
        }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn framing(&self) -> Framing {
        Framing::Message
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn into_split(self) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(WsReader {
                stream,
                current: Cursor::new(Vec::new()),
            }),
            Box::new(WsWriter { sink }),
        )
    }
}

struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    current: Cursor<Vec<u8>>,
}

#[async_trait::async_trait]
impl<S> TransportReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_input<'a>(&'a mut self) -> Result<Input<'a>> {
        loop {
            let data = match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                // Pings are answered by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(Error::ConnectionClosed),
                Some(Err(e)) => return Err(e.into()),
            };
            self.current = Cursor::new(data);
            return Ok(Input::new(&mut self.current, Framing::Message));
        }
    }
}

struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait::async_trait]
impl<S> TransportWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.send(Message::Binary(bytes.to_vec())).await?;
        Ok(())
    }
}

/// Handshake settings shared by every connection of one listener
struct Handshake {
    tls: Option<TlsAcceptor>,
    protocol: ProtocolConfig,
    timeout: Duration,
    max_header_bytes: usize,
}

/// HTTP-upgrade acceptor used by [`Listener::websocket`](crate::Listener::websocket)
pub struct WsAcceptor {
    listener: TcpListener,
    handshake: Arc<Handshake>,
}

impl WsAcceptor {
    /// Bind to a local address, loading TLS material when configured
    pub async fn bind(addr: &str, config: &WebSocketConfig) -> Result<Self> {
        let tls = if config.tls_enabled() {
            let (Some(cert), Some(key)) = (&config.cert_file, &config.key_file) else {
                return Err(Error::Config(
                    "both cert_file and key_file are required for TLS".to_string(),
                ));
            };
            Some(TlsAcceptor::from(tls::server_config(cert, key)?))
        } else {
            None
        };

        let mut protocol = ProtocolConfig::default();
        protocol.max_message_size = Some(config.max_message_size);
        protocol.max_frame_size = Some(config.max_message_size);

        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handshake: Arc::new(Handshake {
                tls,
                protocol,
                timeout: config.handshake_timeout(),
                max_header_bytes: config.max_header_bytes,
            }),
        })
    }
}

#[async_trait::async_trait]
impl Acceptor for WsAcceptor {
    type Incoming = WsIncoming;

    async fn accept(&mut self) -> io::Result<WsIncoming> {
        let (stream, peer_addr) = self.listener.accept().await?;
        Ok(WsIncoming {
            stream,
            peer_addr,
            handshake: Arc::clone(&self.handshake),
        })
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
}

/// Accepted TCP socket still waiting for its TLS and upgrade handshakes
pub struct WsIncoming {
    stream: TcpStream,
    peer_addr: SocketAddr,
    handshake: Arc<Handshake>,
}

#[async_trait::async_trait]
impl Incoming for WsIncoming {
    type Transport = WsTransport<Box<dyn ServerIo>>;

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn establish(self) -> Result<Self::Transport> {
        let WsIncoming {
            stream,
            peer_addr,
            handshake,
        } = self;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;

        let timeout = handshake.timeout;
        let upgrade = async move {
            let io: Box<dyn ServerIo> = match &handshake.tls {
                Some(tls) => Box::new(tls.accept(stream).await?),
                None => Box::new(stream),
            };
            let max_header_bytes = handshake.max_header_bytes;
            let check = move |request: &Request, response: Response| {
                check_upgrade(request, response, max_header_bytes)
            };
            let protocol = Some(handshake.protocol.clone());
            let stream =
                tokio_tungstenite::accept_hdr_async_with_config(io, check, protocol).await?;
            Ok::<_, Error>(stream)
        };

        let stream = tokio::time::timeout(timeout, upgrade)
            .await
            .map_err(|_| Error::HandshakeTimeout)??;

        debug!("websocket upgrade from {} completed", peer_addr);
        Ok(WsTransport::new(stream, local_addr, peer_addr))
    }
}

fn check_upgrade(
    request: &Request,
    response: Response,
    max_header_bytes: usize,
) -> std::result::Result<Response, ErrorResponse> {
    if request.method() != Method::GET {
        return Err(reject(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
    }

    if request_head_len(request) > max_header_bytes {
        return Err(reject(
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            "Request headers too large",
        ));
    }

    Ok(response)
}

/// Size of the request as it came over the wire, up to the blank line
fn request_head_len(request: &Request) -> usize {
    // "METHOD URI HTTP/1.1\r\n"
    let request_line = request.method().as_str().len() + 1 + request.uri().to_string().len() + 11;
    let headers: usize = request
        .headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + 2 + value.len() + 2)
        .sum();
    request_line + headers + 2
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// WebSocket connector used by [`Dialer::websocket`](crate::Dialer::websocket)
///
/// Addresses are `ws://` or `wss://` URLs. Without a TLS configuration,
/// `wss://` peers are verified against the web PKI roots.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    tls: Option<Arc<ClientConfig>>,
}

impl WsConnector {
    /// Use `config` for `wss://` connections, e.g. from [`tls::client_config`]
    pub fn with_tls(config: Arc<ClientConfig>) -> Self {
        Self { tls: Some(config) }
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport<MaybeTlsStream<TcpStream>>;

    async fn connect(&self, address: &str) -> Result<Self::Transport> {
        let tls = self.tls.clone().map(TlsConnector::Rustls);
        let (stream, _response) =
            tokio_tungstenite::connect_async_tls_with_config(address, None, true, tls).await?;

        let socket = match stream.get_ref() {
            MaybeTlsStream::Plain(socket) => socket,
            MaybeTlsStream::Rustls(tls) => tls.get_ref().0,
            _ => return Err(Error::custom("Unsupported WebSocket stream")),
        };
        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr()?;

        Ok(WsTransport::new(stream, local_addr, peer_addr))
    }
}
