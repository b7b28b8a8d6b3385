use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

/// Builds the non-blocking listener socket.
///
/// `SO_REUSEADDR` lets a restarted relay rebind while the old sockets sit
/// in TIME_WAIT; non-blocking is required by the mio event loop.
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Per-connection TCP flags. `TCP_NODELAY` keeps small chat frames from
/// sitting in the Nagle buffer.
pub fn apply_stream_options(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
