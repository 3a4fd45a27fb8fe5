//! Framed client/server TCP messaging over a single `mio::Poll` reactor
//! per endpoint. See [`Client`] and [`Server`] for the two entry points.

mod client;
mod connection;
mod error;
mod handshake;
mod server;

pub use client::{Client, ClientBuilder, ClientConfig};
pub use connection::{ConnState, ConnectionHandle, DEFAULT_MAX_BODY_SIZE, OwnedMessage, Role};
pub use error::{BindError, ConnectError};
pub use server::{Server, ServerBuilder};

pub use tether_queue::{BlockingQueue, ByteCopy, Message, MessageHeader, MessageKind, UnderflowError};
