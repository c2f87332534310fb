//! Socket primitives.
//!
//! Listener construction and non-blocking accepts; everything the reactor
//! needs from the kernel's socket layer in one place.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use socket2::{Domain, Protocol, Socket, Type};

/// Create a socket bound to `address`.
///
/// The socket is non-blocking and close-on-exec with `SO_REUSEADDR` and
/// `SO_REUSEPORT` set.
pub fn bind_socket(address: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    Ok(socket)
}

/// Start listening on a bound socket.
pub fn listen(socket: &Socket, backlog: i32) -> io::Result<()> {
    socket.listen(backlog)
}

/// Accept a single connection on `listener`.
///
/// Returns `Ok(None)` when no connection is pending; the accepted socket is
/// made non-blocking. Callers drain the listener by calling this in a loop
/// until `None`, as required by edge-triggered registration.
pub fn accept(listener: &Socket) -> io::Result<Option<(Socket, SocketAddr)>> {
    match listener.accept() {
        Ok((socket, addr)) => {
            socket.set_nonblocking(true)?;
            let addr = addr
                .as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP peer address"))?;
            Ok(Some((socket, addr)))
        }
        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(err),
    }
}

/// Close a file descriptor, ignoring errors.
///
/// Used on raw fds whose owning handle was already consumed; double closes
/// surface as `EBADF` and are swallowed.
pub fn close(fd: RawFd) {
    if fd >= 0 {
        let _ = syscall!(close(fd));
    }
}

/// The local address `listener` is bound to.
pub fn local_addr(listener: &Socket) -> io::Result<SocketAddr> {
    listener.local_addr()?.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "non-IP local address")
    })
}

