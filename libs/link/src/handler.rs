use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{Error, Result};

/// How a transport delimits one unit of input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Continuous byte stream (TCP).
    ///
    /// Each [`Input`] is a view over the socket itself. The handler reads as
    /// much as it needs and is responsible for its own message boundaries.
    Stream,

    /// Discrete messages (WebSocket).
    ///
    /// Each [`Input`] holds exactly one complete message, already delimited
    /// by the transport. Bytes left unread are discarded before the next
    /// message is delivered.
    Message,
}

/// One unit of input handed to [`Handler::read`]
pub struct Input<'a> {
    reader: &'a mut (dyn AsyncRead + Send + Unpin),
    framing: Framing,
}

impl<'a> Input<'a> {
    pub(crate) fn new(reader: &'a mut (dyn AsyncRead + Send + Unpin), framing: Framing) -> Self {
        Self { reader, framing }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

impl AsyncRead for Input<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().reader).poll_read(cx, buf)
    }
}

/// Message handler attached to a [`Connection`](crate::Connection)
///
/// `read` and `write` are called concurrently from the reader and writer
/// units, so implementations that keep state need interior mutability.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Outbound item type accepted by [`Connection::send`](crate::Connection::send)
    type Message: Send + 'static;

    /// Consume one unit of input.
    ///
    /// Any error is terminal for the connection.
    async fn read(&self, input: &mut Input<'_>) -> Result<()>;

    /// Serialize one outbound message.
    ///
    /// On message transports the bytes written here become exactly one frame.
    fn write(&self, output: &mut Vec<u8>, message: Self::Message) -> Result<()>;

    /// Called exactly once when the connection is finalized.
    ///
    /// `None` means the connection was closed without an error.
    fn on_close(&self, error: Option<Error>);
}
