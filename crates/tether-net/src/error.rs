use std::io;

use thiserror::Error;

/// Raised synchronously from [`crate::client::Client::connect`].
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("couldn't resolve {host}:{port}: {source}")]
    Resolve { host: String, port: u16, source: io::Error },
    #[error("couldn't connect to {addr}: {source}")]
    Connect { addr: std::net::SocketAddr, source: io::Error },
    #[error("no addresses resolved for {host}:{port}")]
    NoAddresses { host: String, port: u16 },
}

/// Raised synchronously from [`crate::server::Server::start`].
#[derive(Error, Debug)]
pub enum BindError {
    #[error("couldn't bind to {addr}: {source}")]
    Bind { addr: std::net::SocketAddr, source: io::Error },
}
