use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, warn};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::handler::{Framing, Handler};
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Lifecycle stage of a [`Connection`]
///
/// Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// Waiting for the registration callback to accept or reject
    Init,
    /// Handler attached, reader and writer running
    Running,
    /// Close requested, reader and writer unwinding
    WaitForClose,
    /// Finalized; the handler has been notified
    Closed,
}

/// Element of the outbound queue
enum Outbound<M> {
    Message(M),
    /// Ends the writer without an error
    Stop,
}

struct Socket {
    reader: Box<dyn TransportReader>,
    writer: Box<dyn TransportWriter>,
}

struct State<H: Handler> {
    status: Status,
    handler: Option<Arc<H>>,
    outbound: Option<mpsc::Sender<Outbound<H::Message>>>,
    // Handed to the writer unit when it starts
    pending: Option<mpsc::Receiver<Outbound<H::Message>>>,
    // Handed to the units when they start
    socket: Option<Socket>,
    error: Option<Error>,
}

struct Inner<H: Handler> {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    framing: Framing,
    queue_capacity: usize,
    state: Mutex<State<H>>,
    // Mirrors `State::status` for waiters
    status: watch::Sender<Status>,
    // Cancelled to force-close the socket
    socket_closed: CancellationToken,
}

impl<H: Handler> Inner<H> {
    fn lock(&self) -> MutexGuard<'_, State<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: &mut State<H>, status: Status) {
        debug!("connection {}: {:?} -> {:?}", self.peer_addr, state.status, status);
        state.status = status;
        if status != Status::Closed {
            self.status.send_replace(status);
        }
    }
}

/// One socket's managed lifecycle
///
/// Created by a [`Listener`](crate::Listener) or [`Dialer`](crate::Dialer)
/// and handed to their callback, which must call [`accept`](Self::accept)
/// before returning. Cloning yields another handle to the same connection.
pub struct Connection<H: Handler> {
    inner: Arc<Inner<H>>,
}

impl<H: Handler> Clone for Connection<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Handler> std::fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .field("status", &self.status())
            .finish()
    }
}

impl<H: Handler> Connection<H> {
    pub(crate) fn new(transport: impl Transport, queue_capacity: usize) -> Self {
        let local_addr = transport.local_addr();
        let peer_addr = transport.peer_addr();
        let framing = transport.framing();
        let (reader, writer) = transport.into_split();
        let (status, _) = watch::channel(Status::Init);

        Self {
            inner: Arc::new(Inner {
                local_addr,
                peer_addr,
                framing,
                queue_capacity,
                state: Mutex::new(State {
                    status: Status::Init,
                    handler: None,
                    outbound: None,
                    pending: None,
                    socket: Some(Socket { reader, writer }),
                    error: None,
                }),
                status,
                socket_closed: CancellationToken::new(),
            }),
        }
    }

    /// Attach a handler, or reject the connection with `None`
    ///
    /// Only the first call has any effect, and only while the connection is
    /// still in [`Status::Init`].
    pub fn accept(&self, handler: Option<Arc<H>>) {
        self.accept_with_capacity(handler, self.inner.queue_capacity)
    }

    /// Like [`accept`](Self::accept), with an explicit outbound queue capacity
    pub fn accept_with_capacity(&self, handler: Option<Arc<H>>, queue_capacity: usize) {
        let mut state = self.inner.lock();
        if state.status != Status::Init {
            return;
        }

        match handler {
            Some(handler) => {
                let (tx, rx) = mpsc::channel(queue_capacity.max(1));
                state.handler = Some(handler);
                state.outbound = Some(tx);
                state.pending = Some(rx);
                self.inner.transition(&mut state, Status::Running);
            }
            None => self.inner.transition(&mut state, Status::WaitForClose),
        }
    }

    /// Queue a message for the writer
    ///
    /// Waits for room when the outbound queue is full, so a slow peer
    /// throttles its producers. Wrap in a timeout for non-blocking use.
    pub async fn send(&self, message: H::Message) -> Result<()> {
        let outbound = {
            let state = self.inner.lock();
            match (&state.status, &state.outbound) {
                (Status::Running, Some(outbound)) => outbound.clone(),
                _ => return Err(Error::NotRunning),
            }
        };

        if outbound.capacity() == 0 {
            warn!("connection {}: outbound queue full", self.inner.peer_addr);
        }

        outbound
            .send(Outbound::Message(message))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Request shutdown, recording `error` as the terminal error
    ///
    /// Only the first request counts. Messages queued before it are still
    /// written. Waits only when the outbound queue is full.
    pub async fn close(&self, error: Option<Error>) {
        self.request_close(error, true).await
    }

    async fn request_close(&self, error: Option<Error>, stop_writer: bool) {
        let outbound = {
            let mut state = self.inner.lock();
            let previous = state.status;
            if previous >= Status::WaitForClose {
                return;
            }

            state.error = error;
            self.inner.transition(&mut state, Status::WaitForClose);

            if previous == Status::Running && stop_writer {
                state.outbound.clone()
            } else {
                None
            }
        };

        if let Some(outbound) = outbound {
            // Fails only if the writer is already gone
            let _ = outbound.send(Outbound::Stop).await;
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn framing(&self) -> Framing {
        self.inner.framing
    }

    pub fn status(&self) -> Status {
        self.inner.lock().status
    }

    /// Resolves once the connection is finalized and its handler notified
    pub async fn closed(&self) {
        let mut status = self.inner.status.subscribe();
        let _ = status.wait_for(|status| *status == Status::Closed).await;
    }

    /// Drive the connection from accept decision to finalization.
    ///
    /// Called right after the registration callback returned.
    pub(crate) async fn run(self) {
        if self.status() == Status::Init {
            debug!(
                "connection {}: no handler attached by callback, rejecting",
                self.inner.peer_addr
            );
            self.accept(None);
        }

        let mut decision = self.inner.status.subscribe();
        let _ = decision.wait_for(|status| *status != Status::Init).await;

        // Units only start if the connection is still running; a close that
        // landed before this point counts as a failed accept.
        let units = {
            let mut state = self.inner.lock();
            if state.status == Status::Running {
                match (state.handler.clone(), state.socket.take(), state.pending.take()) {
                    (Some(handler), Some(socket), Some(outbound)) => {
                        Some((handler, socket, outbound))
                    }
                    _ => None,
                }
            } else {
                None
            }
        };

        let Some((handler, socket, outbound)) = units else {
            self.inner.lock().error.get_or_insert(Error::AcceptFailed);
            self.finalize();
            return;
        };

        let reader = tokio::spawn(read_loop(self.clone(), Arc::clone(&handler), socket.reader));
        let writer = tokio::spawn(write_loop(self.clone(), handler, socket.writer, outbound));

        if let Err(e) = reader.await {
            error!("connection {}: reader failed: {}", self.inner.peer_addr, e);
            self.close(Some(Error::custom(format!("reader failed: {}", e))))
                .await;
        }
        if let Err(e) = writer.await {
            error!("connection {}: writer failed: {}", self.inner.peer_addr, e);
            self.request_close(Some(Error::custom(format!("writer failed: {}", e))), false)
                .await;
        }

        self.finalize();
    }

    /// Tear down exactly once and notify the handler
    fn finalize(&self) {
        let (handler, error) = {
            let mut state = self.inner.lock();
            if state.status != Status::WaitForClose {
                return;
            }

            self.inner.transition(&mut state, Status::Closed);
            state.outbound = None;
            state.pending = None;
            state.socket = None;
            self.inner.socket_closed.cancel();

            (state.handler.take(), state.error.take())
        };

        match handler {
            Some(handler) => handler.on_close(error),
            None => {
                if let Some(error) = error {
                    debug!("connection {}: closed: {}", self.inner.peer_addr, error);
                }
            }
        }

        self.inner.status.send_replace(Status::Closed);
    }
}

async fn read_loop<H: Handler>(
    connection: Connection<H>,
    handler: Arc<H>,
    mut reader: Box<dyn TransportReader>,
) {
    let socket_closed = connection.inner.socket_closed.clone();

    let error = loop {
        let result = tokio::select! {
            _ = socket_closed.cancelled() => Err(Error::ConnectionClosed),
            result = read_input(&mut *reader, &*handler) => result,
        };
        if let Err(error) = result {
            break error;
        }
    };

    drop(reader);
    connection.close(Some(error)).await;
}

async fn read_input<H: Handler>(reader: &mut dyn TransportReader, handler: &H) -> Result<()> {
    let mut input = reader.next_input().await?;
    handler.read(&mut input).await
}

async fn write_loop<H: Handler>(
    connection: Connection<H>,
    handler: Arc<H>,
    mut writer: Box<dyn TransportWriter>,
    mut outbound: mpsc::Receiver<Outbound<H::Message>>,
) {
    let socket_closed = connection.inner.socket_closed.clone();
    // Force-closes the socket on every exit path, waking the reader
    let _force_close = socket_closed.clone().drop_guard();

    let mut buf = Vec::new();
    while let Some(Outbound::Message(message)) = outbound.recv().await {
        buf.clear();
        let result = match handler.write(&mut buf, message) {
            Ok(()) => tokio::select! {
                _ = socket_closed.cancelled() => Err(Error::ConnectionClosed),
                result = writer.send(&buf) => result,
            },
            Err(e) => Err(e),
        };

        if let Err(error) = result {
            // The writer is the only consumer; no Stop needed
            connection.request_close(Some(error), false).await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::handler::Input;
    use crate::transport::StreamTransport;

    #[derive(Default)]
    struct Recorder {
        reads: Mutex<Vec<u8>>,
        writes: Mutex<Vec<Vec<u8>>>,
        closes: Mutex<Vec<Option<String>>>,
    }

    impl Recorder {
        fn closes(&self) -> Vec<Option<String>> {
            self.closes.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Handler for Recorder {
        type Message = Vec<u8>;

        async fn read(&self, input: &mut Input<'_>) -> Result<()> {
            let mut buf = [0u8; 1024];
            let n = input.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.reads.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(())
        }

        fn write(&self, output: &mut Vec<u8>, message: Vec<u8>) -> Result<()> {
            if message == b"fail" {
                return Err(Error::Codec("refusing to write".to_string()));
            }
            output.extend_from_slice(&message);
            self.writes.lock().unwrap().push(message);
            Ok(())
        }

        fn on_close(&self, error: Option<Error>) {
            self.closes
                .lock()
                .unwrap()
                .push(error.map(|e| e.to_string()));
        }
    }

    fn connection(buffer: usize, queue_capacity: usize) -> (Connection<Recorder>, DuplexStream) {
        let (local, peer) = tokio::io::duplex(buffer);
        let transport = StreamTransport::new(
            local,
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
        );
        (Connection::new(transport, queue_capacity), peer)
    }

    async fn wait_closed(connection: &Connection<Recorder>) {
        tokio::time::timeout(Duration::from_secs(5), connection.closed())
            .await
            .expect("connection did not close");
    }

    #[tokio::test]
    async fn clean_close_writes_queue_in_order_and_notifies_once() {
        let (conn, mut peer) = connection(4096, 8);
        let recorder = Arc::new(Recorder::default());
        conn.accept(Some(recorder.clone()));
        assert_eq!(conn.status(), Status::Running);
        tokio::spawn(conn.clone().run());

        for msg in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
            conn.send(msg).await.unwrap();
        }
        conn.close(None).await;

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"onetwothree");

        wait_closed(&conn).await;
        assert_eq!(conn.status(), Status::Closed);
        assert_eq!(
            *recorder.writes.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert_eq!(recorder.closes(), vec![None]);
    }

    #[tokio::test]
    async fn inbound_bytes_reach_handler() {
        let (conn, mut peer) = connection(4096, 8);
        let recorder = Arc::new(Recorder::default());
        conn.accept(Some(recorder.clone()));
        assert_eq!(conn.framing(), Framing::Stream);
        tokio::spawn(conn.clone().run());

        peer.write_all(b"hello").await.unwrap();
        drop(peer);

        wait_closed(&conn).await;
        assert_eq!(*recorder.reads.lock().unwrap(), b"hello");
        assert_eq!(
            recorder.closes(),
            vec![Some(Error::ConnectionClosed.to_string())]
        );
    }

    #[tokio::test]
    async fn rejected_accept_never_runs_handler() {
        let (conn, _peer) = connection(64, 8);
        conn.accept(None);
        assert_eq!(conn.status(), Status::WaitForClose);

        let late = Arc::new(Recorder::default());
        conn.accept(Some(late.clone()));
        assert_eq!(conn.status(), Status::WaitForClose);

        conn.clone().run().await;
        assert_eq!(conn.status(), Status::Closed);
        assert!(conn.send(b"late".to_vec()).await.is_err());
        assert!(late.writes.lock().unwrap().is_empty());
        assert!(late.closes().is_empty());
    }

    #[tokio::test]
    async fn close_before_accept_rejects() {
        let (conn, _peer) = connection(64, 8);
        conn.close(Some(Error::custom("going away"))).await;
        assert_eq!(conn.status(), Status::WaitForClose);

        let late = Arc::new(Recorder::default());
        conn.accept(Some(late.clone()));
        assert!(matches!(
            conn.send(b"late".to_vec()).await,
            Err(Error::NotRunning)
        ));

        conn.clone().run().await;
        assert_eq!(conn.status(), Status::Closed);
        assert!(late.reads.lock().unwrap().is_empty());
        assert!(late.closes().is_empty());
    }

    #[tokio::test]
    async fn callback_without_accept_is_rejected() {
        let (conn, _peer) = connection(64, 8);
        tokio::time::timeout(Duration::from_secs(5), conn.clone().run())
            .await
            .unwrap();
        assert_eq!(conn.status(), Status::Closed);
    }

    #[tokio::test]
    async fn close_before_startup_fails_accept() {
        let (conn, mut peer) = connection(4096, 8);
        let recorder = Arc::new(Recorder::default());
        conn.accept(Some(recorder.clone()));
        conn.send(b"queued".to_vec()).await.unwrap();
        conn.close(None).await;
        assert_eq!(conn.status(), Status::WaitForClose);

        conn.clone().run().await;
        assert_eq!(conn.status(), Status::Closed);

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert!(recorder.writes.lock().unwrap().is_empty());
        assert_eq!(
            recorder.closes(),
            vec![Some(Error::AcceptFailed.to_string())]
        );
    }

    #[tokio::test]
    async fn close_before_startup_keeps_first_error() {
        let (conn, _peer) = connection(4096, 8);
        let recorder = Arc::new(Recorder::default());
        conn.accept(Some(recorder.clone()));
        conn.close(Some(Error::custom("shutting down"))).await;

        conn.clone().run().await;
        assert_eq!(recorder.closes(), vec![Some("shutting down".to_string())]);
    }

    #[tokio::test]
    async fn send_after_close_fails_and_first_error_wins() {
        let (conn, _peer) = connection(4096, 8);
        let recorder = Arc::new(Recorder::default());
        conn.accept(Some(recorder.clone()));
        tokio::spawn(conn.clone().run());

        let first = conn.clone();
        let second = conn.clone();
        tokio::join!(
            first.close(Some(Error::custom("first"))),
            second.close(Some(Error::custom("second"))),
        );

        assert!(matches!(
            conn.send(b"after".to_vec()).await,
            Err(Error::NotRunning)
        ));

        wait_closed(&conn).await;
        conn.close(Some(Error::custom("third"))).await;
        assert_eq!(recorder.closes(), vec![Some("first".to_string())]);
    }

    #[tokio::test]
    async fn write_failure_closes_connection() {
        let (conn, _peer) = connection(4096, 8);
        let recorder = Arc::new(Recorder::default());
        conn.accept(Some(recorder.clone()));
        tokio::spawn(conn.clone().run());

        conn.send(b"ok".to_vec()).await.unwrap();
        conn.send(b"fail".to_vec()).await.unwrap();

        wait_closed(&conn).await;
        assert_eq!(*recorder.writes.lock().unwrap(), vec![b"ok".to_vec()]);
        assert_eq!(
            recorder.closes(),
            vec![Some("Codec error: refusing to write".to_string())]
        );
    }

    #[tokio::test]
    async fn full_queue_blocks_sender() {
        // Tiny pipe that nobody drains, so the writer stalls
        let (conn, peer) = connection(8, 1);
        let recorder = Arc::new(Recorder::default());
        conn.accept(Some(recorder.clone()));
        tokio::spawn(conn.clone().run());

        conn.send(vec![0u8; 64]).await.unwrap();
        conn.send(vec![1u8; 64]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let blocked = tokio::time::timeout(Duration::from_millis(100), conn.send(vec![2u8; 64])).await;
        assert!(blocked.is_err(), "send should wait for queue space");

        drop(peer);
        wait_closed(&conn).await;
        assert_eq!(recorder.closes().len(), 1);
    }
}
