//! The thin nonblocking stream-socket layer (spec.md §4.1). `Link` never
//! blocks a caller: `connect` returns as soon as the connect syscall is
//! issued (the socket may still be `INPROGRESS`), `accept` returns `None`
//! immediately if nothing is pending.

use std::{
    io,
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
};

use mio::net::{TcpListener, TcpStream};

/// Either end of a nonblocking TCP connection, or a listening socket.
pub enum Link {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Link {
    /// Binds a listening socket at `addr:port`. Backlog and socket options
    /// are chosen by the OS/`mio` defaults, matching spec.md §6 ("the Link
    /// layer chooses backlog and socket options").
    pub fn serve(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Link::Listener(listener))
    }

    /// Initiates a nonblocking connect. The returned link may still be
    /// connecting (spec.md §4.1); callers drive it to completion the same
    /// way a `Connection` in `InProgress` does, via writability + `SO_ERROR`.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Link::Stream(stream))
    }

    /// Accepts one pending connection. Returns `Ok(None)` if none is
    /// immediately available (`WouldBlock`), never blocks.
    pub fn accept(&mut self) -> io::Result<Option<(Self, SocketAddr)>> {
        let Link::Listener(listener) = self else {
            panic!("accept() called on a non-listening link");
        };
        match listener.accept() {
            Ok((stream, addr)) => Ok(Some((Link::Stream(stream), addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn as_stream(&self) -> &TcpStream {
        match self {
            Link::Stream(s) => s,
            Link::Listener(_) => panic!("as_stream() called on a listening link"),
        }
    }

    pub fn as_stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Link::Stream(s) => s,
            Link::Listener(_) => panic!("as_stream_mut() called on a listening link"),
        }
    }

    pub fn is_listener(&self) -> bool {
        matches!(self, Link::Listener(_))
    }

    /// The `SO_ERROR` value for a connecting socket: `Ok(None)` means
    /// connected successfully, `Ok(Some(err))` carries the failure.
    pub fn take_socket_error(&self) -> io::Result<Option<io::Error>> {
        self.as_stream().take_error()
    }

    pub fn fd(&self) -> RawFd {
        match self {
            Link::Listener(l) => l.as_raw_fd(),
            Link::Stream(s) => s.as_raw_fd(),
        }
    }
}

// `close` is just drop: `TcpListener`/`TcpStream` close their fd on drop.
// A method is still exposed so callers (and `Connection::close`) read the
// same as the language-neutral API surface in spec.md §6.
impl Link {
    pub fn close(self) {
        drop(self);
    }
}
