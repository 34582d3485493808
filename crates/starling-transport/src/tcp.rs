//! TCP dial and listen helpers.
//!
//! Sockets are created through `socket2` so buffer sizes, address reuse and
//! keepalive can be set before the socket is handed to tokio.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::TransportConfig;
use crate::transport::{BoxedReader, BoxedWriter, TransportError, TransportResult};

/// Bind a TCP listener with tuned socket options.
///
/// # Errors
///
/// Returns [`TransportError::BindFailed`] if the socket cannot be created,
/// configured, or bound.
pub fn bind(addr: SocketAddr, config: &TransportConfig) -> TransportResult<TcpListener> {
    let bind_err = |e: std::io::Error| TransportError::BindFailed(format!("{addr}: {e}"));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(bind_err)?;
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(config.backlog).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener).map_err(bind_err)?;
    tracing::debug!("TCP listener bound on {}", addr);
    Ok(listener)
}

/// Dial a TCP peer.
///
/// # Errors
///
/// Returns [`TransportError::ConnectionFailed`] if the handshake fails.
pub async fn dial(addr: &str, config: &TransportConfig) -> TransportResult<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
    tune(&stream, config)?;
    tracing::debug!("TCP connection established to {}", addr);
    Ok(stream)
}

/// Apply per-connection options to an accepted or dialed stream.
///
/// # Errors
///
/// Returns an error if the socket options cannot be set.
pub fn tune(stream: &TcpStream, config: &TransportConfig) -> TransportResult<()> {
    stream.set_nodelay(true)?;
    if config.keepalive_secs > 0 {
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_secs));
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Split a stream into type-erased halves.
#[must_use]
pub fn split(stream: TcpStream) -> (BoxedReader, BoxedWriter) {
    let (read, write) = stream.into_split();
    (Box::new(read), Box::new(write))
}
