//! Constellation Link - Connection lifecycle layer
//!
//! Wraps a TCP or WebSocket socket in a [`Connection`] that owns the accept
//! decision, runs a reader and a writer concurrently, applies backpressure
//! on outbound messages and notifies its [`Handler`] exactly once when it
//! closes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use constellation_link::{Connection, Error, Handler, Input, Listener, Result};
//! use tokio::io::AsyncReadExt;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     type Message = Vec<u8>;
//!
//!     async fn read(&self, input: &mut Input<'_>) -> Result<()> {
//!         let mut buf = [0u8; 1024];
//!         input.read(&mut buf).await?;
//!         Ok(())
//!     }
//!
//!     fn write(&self, output: &mut Vec<u8>, message: Vec<u8>) -> Result<()> {
//!         output.extend_from_slice(&message);
//!         Ok(())
//!     }
//!
//!     fn on_close(&self, error: Option<Error>) {
//!         println!("closed: {:?}", error);
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let listener = Listener::tcp()
//!     .address("127.0.0.1:7000")
//!     .on_connection(|conn: Connection<Echo>| conn.accept(Some(Arc::new(Echo))))
//!     .start()
//!     .await?;
//!
//! // ...
//! listener.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod handler;
pub mod listener;
pub mod tls;
pub mod transport;

// Re-exports for convenience
pub use config::{DialerConfig, ListenerConfig, WebSocketConfig};
pub use connection::{Connection, Status};
pub use dialer::Dialer;
pub use error::{Error, Result};
pub use handler::{Framing, Handler, Input};
pub use listener::{Listener, ListenerBuilder};
