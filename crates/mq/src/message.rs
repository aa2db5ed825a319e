//! Per-message framing state: the payload source/sink, the resumable byte
//! cursors, and the flags the send/receive state machines in
//! [`crate::connection`] step through.

use std::{
    io,
    os::fd::{AsRawFd, RawFd},
};

use crate::frame::{CHUNK, FrameType, HEADER_LEN, encode_header};

/// Which kind of storage a [`Storage`] value holds. [`Connection::recv`]
/// reports this distinction through [`RecvOutcome`]'s variants directly;
/// this tag is exposed separately for callers that just want to branch on
/// storage kind without matching the full outcome (e.g. inspecting a
/// send/receive still in flight).
///
/// [`Connection::recv`]: crate::Connection::recv
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Buffer,
    Fd,
}

/// The idiomatic replacement for the C source's `recv(conn, &length)
/// -> storage_tag` out-parameter pattern (spec.md §6 `recv`).
#[derive(Debug)]
pub enum RecvOutcome {
    /// No completed message is waiting.
    None,
    /// A buffer-backed message, with its total payload length.
    Buffer(Vec<u8>, u64),
    /// An fd-backed message drained entirely to the caller's sink fd, with
    /// its total payload length.
    Fd(u64),
}

/// An adopted pipe file descriptor.
///
/// Owned by the [`Message`] for as long as the message is alive; set
/// nonblocking on adoption, original flags restored and the fd closed
/// exactly once on drop (spec.md §3 invariant 4, §5 resource discipline).
pub struct FdSlot {
    fd: RawFd,
    orig_flags: libc::c_int,
    /// Reused scratch buffer moving bytes between the pipe and the socket.
    /// Bounded by `CHUNK`.
    pub(crate) chunk: Vec<u8>,
}

impl FdSlot {
    pub(crate) fn adopt(fd: RawFd) -> io::Result<Self> {
        let orig_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if orig_flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, orig_flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, orig_flags, chunk: Vec::new() })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl AsRawFd for FdSlot {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for FdSlot {
    fn drop(&mut self) {
        unsafe {
            libc::fcntl(self.fd, libc::F_SETFL, self.orig_flags);
            libc::close(self.fd);
        }
    }
}

/// Tagged payload storage: a sum type over `{Buffer(owned buf), Fd(owned
/// fd, chunk buf, saved flags)}`, per spec.md §9 ("use a sum type... rather
/// than a discriminant plus raw union").
pub enum Storage {
    Buffer(Vec<u8>),
    Fd(FdSlot),
}

impl Storage {
    pub fn kind(&self) -> StorageKind {
        match self {
            Storage::Buffer(_) => StorageKind::Buffer,
            Storage::Fd(_) => StorageKind::Fd,
        }
    }
}

/// One frame/message's worth of framing state.
///
/// A buffer-backed send/receive is exactly one `Message` living for one
/// frame (`SINGLE`). An fd-backed send/receive is one `Message` living
/// across a `START`, zero or more `CONT`, and one `END` frame; `storage`,
/// `hdr`, and the cursors persist across that whole sequence.
pub struct Message {
    pub(crate) storage: Storage,
    pub(crate) ty: FrameType,
    /// Send side: length of the payload carried by the *current* frame.
    /// Receive side, `Buffer` storage: cumulative length received so far
    /// (the buffer grows to this length on every new frame). Receive side,
    /// `Fd` storage: length of the payload carried by the current frame
    /// (reset to 0 once drained to the pipe).
    pub(crate) len: u64,
    pub(crate) total_len: u64,
    pub(crate) hdr: [u8; HEADER_LEN],
    pub(crate) hdr_pos: usize,
    pub(crate) buf_pos: usize,
    pub(crate) parsed_header: bool,
    /// True while bytes are moving between the pipe and the chunk/caller
    /// buffer rather than directly over the socket.
    pub(crate) buffering: bool,
    pub(crate) seen_initial: bool,
    pub(crate) hung_up: bool,
}

impl Message {
    /// A whole in-memory buffer sent as one `SINGLE` frame. The header is
    /// encoded immediately, since a buffer-backed send skips straight to the
    /// header-write step of `flush_send` (it never passes through the
    /// pipe-buffering transition that encodes one for an `Fd` source) —
    /// mirrors `mq_send_buffer` computing `msg->hdr_len = htonll(msg->len)`
    /// up front in the C source.
    pub(crate) fn for_send_buffer(buf: Vec<u8>) -> Self {
        let len = buf.len() as u64;
        let mut hdr = [0; HEADER_LEN];
        encode_header(&mut hdr, FrameType::SINGLE, len);
        Self {
            storage: Storage::Buffer(buf),
            ty: FrameType::SINGLE,
            len,
            total_len: len,
            hdr,
            hdr_pos: 0,
            buf_pos: 0,
            parsed_header: true,
            buffering: false,
            seen_initial: false,
            hung_up: false,
        }
    }

    /// A streaming send sourced from a pipe, chunked at `CHUNK` bytes.
    pub(crate) fn for_send_fd(fd: RawFd) -> io::Result<Self> {
        let mut slot = FdSlot::adopt(fd)?;
        slot.chunk.resize(CHUNK, 0);
        Ok(Self {
            storage: Storage::Fd(slot),
            ty: FrameType::START,
            len: CHUNK as u64,
            total_len: 0,
            hdr: [0; HEADER_LEN],
            hdr_pos: 0,
            buf_pos: 0,
            parsed_header: true,
            buffering: true,
            seen_initial: false,
            hung_up: false,
        })
    }

    /// A receive sink backed by a caller-owned growable buffer.
    pub(crate) fn for_store_buffer(buf: Vec<u8>) -> Self {
        Self {
            storage: Storage::Buffer(buf),
            ty: FrameType::CONT,
            len: 0,
            total_len: 0,
            hdr: [0; HEADER_LEN],
            hdr_pos: 0,
            buf_pos: 0,
            parsed_header: false,
            buffering: false,
            seen_initial: false,
            hung_up: false,
        }
    }

    /// A receive sink backed by a pipe fd.
    pub(crate) fn for_store_fd(fd: RawFd) -> io::Result<Self> {
        let slot = FdSlot::adopt(fd)?;
        Ok(Self {
            storage: Storage::Fd(slot),
            ty: FrameType::CONT,
            len: 0,
            total_len: 0,
            hdr: [0; HEADER_LEN],
            hdr_pos: 0,
            buf_pos: 0,
            parsed_header: false,
            buffering: false,
            seen_initial: false,
            hung_up: false,
        })
    }

    /// The buffer currently staged for socket I/O: the caller's buffer for
    /// `Buffer` storage, the reusable chunk for `Fd` storage.
    pub(crate) fn wire_buf_mut(&mut self) -> &mut Vec<u8> {
        match &mut self.storage {
            Storage::Buffer(b) => b,
            Storage::Fd(slot) => &mut slot.chunk,
        }
    }

    pub(crate) fn wire_buf(&self) -> &Vec<u8> {
        match &self.storage {
            Storage::Buffer(b) => b,
            Storage::Fd(slot) => &slot.chunk,
        }
    }

    pub(crate) fn pipe_fd(&self) -> Option<RawFd> {
        match &self.storage {
            Storage::Buffer(_) => None,
            Storage::Fd(slot) => Some(slot.as_raw_fd()),
        }
    }

    /// Grows the receive buffer to hold `len` bytes total. `Buffer` storage
    /// grows without bound (the caller's sink accumulates every frame);
    /// `Fd` storage is always bounded by `CHUNK` already. Maps allocator
    /// failure to the `ENOMEM` error kind in spec.md §7 via `try_reserve`.
    pub(crate) fn grow_to(&mut self, len: usize) -> Result<(), crate::error::MqError> {
        let buf = self.wire_buf_mut();
        if len > buf.len() {
            let additional = len - buf.len();
            buf.try_reserve(additional).map_err(|_| crate::error::MqError::OutOfMemory)?;
            buf.resize(len, 0);
        }
        Ok(())
    }

    /// Completed message handed to the caller by `recv()`. Consumes the
    /// `Buffer` storage into the returned `Vec`; `Fd` storage is dropped
    /// here, releasing the chunk buffer and the pipe fd (restoring its
    /// original flags) per spec.md §6 ("on FD completion MQ releases its
    /// internal chunk buffer").
    pub(crate) fn into_delivered(self) -> RecvOutcome {
        let total = self.total_len;
        match self.storage {
            Storage::Buffer(b) => RecvOutcome::Buffer(b, total),
            Storage::Fd(_) => RecvOutcome::Fd(total),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffer_send_is_single_frame() {
        let msg = Message::for_send_buffer(vec![1, 2, 3]);
        assert!(msg.ty.is_start() && msg.ty.is_end());
        assert_eq!(msg.len, 3);
    }

    #[test]
    fn buffer_send_encodes_a_valid_header_up_front() {
        let msg = Message::for_send_buffer(vec![1, 2, 3, 4, 5]);
        let raw = crate::frame::parse_header(&msg.hdr);
        let ty = crate::frame::validate_header(&raw, false).expect("header must validate");
        assert!(ty.is_start() && ty.is_end());
        assert_eq!(raw.len, 5);
    }

    #[test]
    fn grow_to_extends_buffer_without_truncating() {
        let mut msg = Message::for_store_buffer(Vec::new());
        msg.grow_to(10).unwrap();
        assert_eq!(msg.wire_buf().len(), 10);
        msg.grow_to(5).unwrap();
        assert_eq!(msg.wire_buf().len(), 10, "grow_to must never shrink");
    }
}
