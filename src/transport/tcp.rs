//! Bind-or-connect role election.
//!
//! The first process to bind the endpoint becomes the server; every later
//! process finds the address in use and connects to it instead.
//!
//! # Example
//!
//! ```ignore
//! use sqlite_share::transport::{negotiate, Negotiated};
//!
//! match negotiate("127.0.0.1", 48100, 128).await? {
//!     Negotiated::Server(listener) => { /* accept loop */ }
//!     Negotiated::Client(stream) => { /* talk to the server */ }
//! }
//! ```

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::error::{Result, ShareError};

/// Outcome of [`negotiate`].
#[derive(Debug)]
pub enum Negotiated {
    /// This process bound the endpoint and now owns the listener.
    Server(TcpListener),
    /// The endpoint was taken; this is the connection to its owner.
    Client(TcpStream),
}

impl Negotiated {
    /// True for the server role.
    pub fn is_server(&self) -> bool {
        matches!(self, Negotiated::Server(_))
    }
}

/// Try to listen on `address:port`; when that fails, connect to it.
///
/// Fails with [`ShareError::ConnectFailed`] carrying both causes when
/// neither works.
pub async fn negotiate(address: &str, port: u16, backlog: u32) -> Result<Negotiated> {
    let endpoint = format!("{}:{}", address, port);
    let addr = resolve(&endpoint).await?;

    let bind_err = match listen(addr, backlog) {
        Ok(listener) => {
            tracing::info!(%addr, "bound endpoint, acting as server");
            return Ok(Negotiated::Server(listener));
        }
        Err(e) => e,
    };

    tracing::debug!(%addr, error = %bind_err, "bind failed, connecting instead");

    match TcpStream::connect(addr).await {
        Ok(stream) => {
            stream.set_nodelay(true)?;
            tracing::info!(%addr, "connected to server, acting as client");
            Ok(Negotiated::Client(stream))
        }
        Err(connect_err) => Err(ShareError::ConnectFailed {
            address: endpoint,
            bind: bind_err,
            connect: connect_err,
        }),
    }
}

async fn resolve(endpoint: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(endpoint).await?;
    addrs.next().ok_or_else(|| {
        ShareError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve to any address", endpoint),
        ))
    })
}

fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    // Lets a new server rebind while connections of a dead one linger in
    // TIME_WAIT. Unix still refuses the bind while someone is listening.
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;

    socket.bind(addr)?;
    socket.listen(backlog)
}
