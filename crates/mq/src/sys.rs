//! Raw syscalls for pipe file descriptors, which have no safe std/mio
//! wrapper type the way sockets do. Mirrors the comfort `flux-network`'s
//! `set_socket_buf_size` already has calling straight into `libc`.

use std::{io, os::fd::RawFd};

pub(crate) fn pipe_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(rc as usize) }
}

pub(crate) fn pipe_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let rc = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(rc as usize) }
}

pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
