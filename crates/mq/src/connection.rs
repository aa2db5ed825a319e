//! The per-connection send/receive state machine (spec.md §4.3-§4.5), ported
//! from `flush_send`/`flush_recv`/`handle_revents`/`poll_events` in
//! `original_source/dttools/src/mq.c`, using the teacher's nonblocking-retry
//! idiom (`io::ErrorKind::WouldBlock`) in place of raw `errno` comparisons.

use std::{
    any::Any,
    collections::VecDeque,
    io::{Read, Write},
    net::SocketAddr,
    os::fd::RawFd,
    time::Instant,
};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use tracing::{debug, warn};

use crate::{
    error::MqError,
    frame::{CHUNK, FrameType, HEADER_LEN, encode_header, parse_header, validate_header},
    link::Link,
    message::{Message, RecvOutcome, Storage},
    safe_panic,
    sys::{is_transient, pipe_read, pipe_write},
};

/// Socket-level state (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Server,
    InProgress,
    Connected,
    Error,
}

/// A unique id stamped on a [`Connection`] the instant it joins a
/// [`crate::PollGroup`], analogous to the C source's `mq->poll_group`
/// back-pointer field (spec.md §4.8, SPEC_FULL.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupId(pub(crate) u64);

/// Readiness observed for one side (send or receive) of a connection on the
/// *previous* poll iteration — the wait primitives explicitly feed back last
/// iteration's events before recomputing what to poll for next (spec.md
/// §4.7).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hup_or_err: bool,
}

/// What a side of a connection wants polled next (spec.md §4.6's table,
/// collapsed to the one interest each row ever sets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollWant {
    None,
    SocketReadable,
    SocketWritable,
    PipeReadable(RawFd),
    PipeWritable(RawFd),
}

pub struct Connection {
    link: Link,
    state: ConnState,
    /// Latched errno, 0 while healthy (spec.md §3, §7).
    err: i32,
    send_queue: VecDeque<Message>,
    sending: Option<Message>,
    recving: Option<Message>,
    recv: Option<Message>,
    acc: Option<Box<Connection>>,
    peer_addr: Option<SocketAddr>,
    pub(crate) group: Option<GroupId>,
    tag: Option<Box<dyn Any + Send>>,
    /// Lazily created so a connection that's never waited on standalone
    /// (e.g. one that only ever lives inside a `PollGroup`) pays nothing.
    private_poll: Option<(Poll, Events)>,
    send_registered: Option<(RawFd, Interest)>,
    recv_registered: Option<(RawFd, Interest)>,
}

const TOKEN_SEND: Token = Token(0);
const TOKEN_RECV: Token = Token(1);

impl Connection {
    pub(crate) fn new(state: ConnState, link: Link, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            link,
            state,
            err: 0,
            send_queue: VecDeque::new(),
            sending: None,
            recving: None,
            recv: None,
            acc: None,
            peer_addr,
            group: None,
            tag: None,
            private_poll: None,
            send_registered: None,
            recv_registered: None,
        }
    }

    /// Binds a listening connection (spec.md §6 `serve`).
    pub fn serve(addr: SocketAddr) -> Result<Self, MqError> {
        let link = Link::serve(addr)?;
        Ok(Self::new(ConnState::Server, link, None))
    }

    /// Initiates a nonblocking connect (spec.md §6 `connect`).
    pub fn connect(addr: SocketAddr) -> Result<Self, MqError> {
        let link = Link::connect(addr)?;
        Ok(Self::new(ConnState::InProgress, link, Some(addr)))
    }

    /// Takes the pending accepted child connection, if any (spec.md §6
    /// `accept`). Only meaningful while `state() == Server`.
    pub fn accept(&mut self) -> Option<Connection> {
        self.acc.take().map(|b| *b)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.link.fd()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Latched error code, 0 if healthy (spec.md §6 `geterror`).
    pub fn geterror(&self) -> i32 {
        self.err
    }

    pub fn get_tag<T: 'static>(&self) -> Option<&T> {
        self.tag.as_ref().and_then(|t| t.downcast_ref())
    }

    pub fn set_tag<T: 'static + Send>(&mut self, tag: T) {
        self.tag = Some(Box::new(tag));
    }

    pub(crate) fn has_pending_accept(&self) -> bool {
        self.acc.is_some()
    }

    pub(crate) fn has_completed_recv(&self) -> bool {
        self.recv.is_some()
    }

    fn latched_err(&self) -> Result<(), MqError> {
        if self.err != 0 { Err(MqError::Latched(self.err)) } else { Ok(()) }
    }

    /// Enqueues a whole in-memory buffer as a single `SINGLE` frame
    /// (spec.md §6 `send_buffer`).
    pub fn send_buffer(&mut self, buf: Vec<u8>) -> Result<(), MqError> {
        self.latched_err()?;
        self.send_queue.push_back(Message::for_send_buffer(buf));
        Ok(())
    }

    /// Enqueues a streaming send sourced from a pipe fd (spec.md §6
    /// `send_fd`). MQ adopts `fd`: sets it nonblocking and closes it when
    /// the message is disposed.
    pub fn send_fd(&mut self, fd: RawFd) -> Result<(), MqError> {
        self.latched_err()?;
        let msg = Message::for_send_fd(fd)?;
        self.send_queue.push_back(msg);
        Ok(())
    }

    /// Installs a caller-owned buffer as the sink for the next receive
    /// (spec.md §6 `store_buffer`). Short-circuits with the latched error on
    /// a failed connection (spec.md §7); panics (programmer error) if a
    /// receive is already pending.
    pub fn store_buffer(&mut self, mut buf: Vec<u8>) -> Result<(), MqError> {
        self.latched_err()?;
        assert!(self.recving.is_none(), "store_buffer called with a receive already pending");
        buf.clear();
        self.recving = Some(Message::for_store_buffer(buf));
        Ok(())
    }

    /// Installs a pipe fd as the sink for the next receive (spec.md §6
    /// `store_fd`). MQ adopts `fd` the same way `send_fd` does.
    /// Short-circuits with the latched error on a failed connection
    /// (spec.md §7).
    pub fn store_fd(&mut self, fd: RawFd) -> Result<(), MqError> {
        self.latched_err()?;
        assert!(self.recving.is_none(), "store_fd called with a receive already pending");
        self.recving = Some(Message::for_store_fd(fd)?);
        Ok(())
    }

    /// Takes the completed receive, if any (spec.md §6 `recv`).
    pub fn recv(&mut self) -> RecvOutcome {
        match self.recv.take() {
            Some(msg) => msg.into_delivered(),
            None => RecvOutcome::None,
        }
    }

    /// Forces the connection through error cleanup with `err=0`
    /// (spec.md §4.5 `close`). Consumes `self`; the `Link`, queue, and any
    /// in-flight messages are released by ordinary `Drop`.
    pub fn close(mut self) {
        debug!("mq: closing connection");
        self.release_all();
    }

    fn release_all(&mut self) {
        self.acc = None;
        self.sending = None;
        self.recving = None;
        self.recv = None;
        self.send_queue.clear();
    }

    /// Latches a fatal error and releases every owned resource before the
    /// connection becomes user-visibly `ERROR` (spec.md §5, §7). Unlike the
    /// C source's `mq_die` (which frees `recving`/`recv` with a raw `free`
    /// and leaks their buffers/fds, per the Open Question in spec.md §9),
    /// this always runs full `Message` disposal via ordinary `Drop`.
    fn die(&mut self, err: MqError) {
        let code = err.code();
        warn!(code, "mq: connection entering error state: {err}");
        self.state = ConnState::Error;
        self.err = code;
        self.release_all();
    }

    // ---- send state machine (ported from flush_send) ----

    fn flush_send(&mut self) -> Result<(), MqError> {
        loop {
            if self.sending.is_none() {
                self.sending = self.send_queue.pop_front();
            }
            let Some(snd) = self.sending.as_mut() else { return Ok(()) };

            if snd.buffering {
                if snd.hung_up {
                    snd.len = snd.buf_pos as u64;
                    snd.ty = snd.ty.with_end();
                }

                if snd.buf_pos < snd.len as usize {
                    let pipe_fd = snd.pipe_fd().expect("buffering implies Fd storage");
                    let (start, end) = (snd.buf_pos, snd.len as usize);
                    let chunk = snd.wire_buf_mut();
                    match pipe_read(pipe_fd, &mut chunk[start..end]) {
                        Ok(0) => {
                            snd.len = snd.buf_pos as u64;
                            continue;
                        }
                        Ok(n) => {
                            snd.buf_pos += n;
                            continue;
                        }
                        Err(e) if is_transient(&e) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    snd.buffering = false;
                    snd.buf_pos = 0;
                    snd.hdr_pos = 0;
                    if snd.len < CHUNK as u64 {
                        snd.ty = snd.ty.with_end();
                    }
                    encode_header(&mut snd.hdr, snd.ty, snd.len);
                    continue;
                }
            }

            if snd.hdr_pos < HEADER_LEN {
                let stream = self.link.as_stream_mut();
                match stream.write(&snd.hdr[snd.hdr_pos..]) {
                    Ok(0) => return Err(MqError::ConnectionReset),
                    Ok(n) => {
                        snd.hdr_pos += n;
                        continue;
                    }
                    Err(e) if is_transient(&e) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            } else if snd.buf_pos < snd.len as usize {
                let (start, end) = (snd.buf_pos, snd.len as usize);
                let stream = self.link.as_stream_mut();
                let payload = &snd.wire_buf()[start..end];
                match stream.write(payload) {
                    Ok(0) => return Err(MqError::ConnectionReset),
                    Ok(n) => {
                        snd.buf_pos += n;
                        continue;
                    }
                    Err(e) if is_transient(&e) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            } else if snd.ty.is_end() {
                self.sending = None;
                continue;
            } else {
                snd.buffering = true;
                snd.buf_pos = 0;
                snd.ty = FrameType::CONT;
                continue;
            }
        }
    }

    // ---- receive state machine (ported from flush_recv) ----

    fn flush_recv(&mut self) -> Result<(), MqError> {
        loop {
            if self.recv.is_some() {
                return Ok(());
            }
            let Some(rcv) = self.recving.as_mut() else {
                safe_panic!("mq: receive polled without a sink installed");
                return Ok(());
            };

            if !rcv.buffering {
                if rcv.hdr_pos < HEADER_LEN {
                    let stream = self.link.as_stream_mut();
                    match stream.read(&mut rcv.hdr[rcv.hdr_pos..]) {
                        Ok(0) => return Err(MqError::ConnectionReset),
                        Ok(n) => {
                            rcv.hdr_pos += n;
                            continue;
                        }
                        Err(e) if is_transient(&e) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                } else if !rcv.parsed_header {
                    let raw = parse_header(&rcv.hdr);
                    rcv.buf_pos = rcv.len as usize;
                    rcv.len = rcv.len.checked_add(raw.len).ok_or(MqError::BadFrame)?;
                    rcv.total_len =
                        rcv.total_len.checked_add(raw.len).ok_or(MqError::BadFrame)?;
                    let ty = validate_header(&raw, rcv.seen_initial)?;
                    rcv.ty = ty;
                    rcv.grow_to(rcv.len as usize)?;
                    rcv.parsed_header = true;
                    continue;
                } else if rcv.buf_pos < rcv.len as usize {
                    let (start, end) = (rcv.buf_pos, rcv.len as usize);
                    let stream = self.link.as_stream_mut();
                    let buf = rcv.wire_buf_mut();
                    match stream.read(&mut buf[start..end]) {
                        Ok(0) => return Err(MqError::ConnectionReset),
                        Ok(n) => {
                            rcv.buf_pos += n;
                            continue;
                        }
                        Err(e) if is_transient(&e) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    rcv.seen_initial = true;
                    rcv.buffering = true;
                    rcv.buf_pos = 0;
                    rcv.hdr_pos = 0;
                    rcv.parsed_header = false;
                    continue;
                }
            }

            if matches!(rcv.storage, Storage::Fd(_)) && rcv.buf_pos < rcv.len as usize {
                let (start, end) = (rcv.buf_pos, rcv.len as usize);
                let fd = rcv.pipe_fd().expect("Fd storage implies a pipe fd");
                let buf = rcv.wire_buf();
                match pipe_write(fd, &buf[start..end]) {
                    Ok(n) => {
                        rcv.buf_pos += n;
                        continue;
                    }
                    Err(e) if is_transient(&e) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            } else if matches!(rcv.storage, Storage::Fd(_)) {
                rcv.len = 0;
            }

            rcv.buffering = false;
            if rcv.ty.is_end() {
                self.recv = self.recving.take();
            }
        }
    }

    // ---- one turn: handle last iteration's events, recompute wants ----

    /// Replays `handle_revents` + implicit poll-group bookkeeping for one
    /// turn. Returns `true` iff a *new* fatal error was latched this call
    /// (matching `mq_wait`'s `handle_revents(...) == -1` check, spec.md
    /// §4.7).
    pub(crate) fn turn(&mut self, send_ev: Readiness, recv_ev: Readiness) -> bool {
        match self.state {
            ConnState::Error => false,
            ConnState::InProgress => {
                if send_ev.writable || send_ev.hup_or_err {
                    match self.link.take_socket_error() {
                        Ok(None) => self.state = ConnState::Connected,
                        Ok(Some(err)) => {
                            self.die(MqError::Io(err));
                            return true;
                        }
                        Err(err) => {
                            self.die(MqError::Io(err));
                            return true;
                        }
                    }
                }
                false
            }
            ConnState::Connected => {
                let mut send_ev = send_ev;
                if send_ev.hup_or_err {
                    if let Some(snd) = self.sending.as_mut().filter(|m| m.buffering) {
                        snd.hung_up = true;
                        send_ev.readable = true;
                    } else {
                        self.die(MqError::ConnectionReset);
                        return true;
                    }
                }
                if recv_ev.hup_or_err {
                    self.die(MqError::ConnectionReset);
                    return true;
                }

                if send_ev.readable || send_ev.writable {
                    if let Err(e) = self.flush_send() {
                        self.die(e);
                        return true;
                    }
                }
                if recv_ev.readable || recv_ev.writable {
                    if let Err(e) = self.flush_recv() {
                        self.die(e);
                        return true;
                    }
                }
                false
            }
            ConnState::Server => {
                if recv_ev.readable {
                    assert!(self.acc.is_none(), "server polled readable with a pending accept");
                    match self.link.accept() {
                        Ok(Some((link, addr))) => {
                            self.acc =
                                Some(Box::new(Connection::new(ConnState::Connected, link, Some(addr))));
                        }
                        Ok(None) => {}
                        Err(err) => {
                            self.die(MqError::Io(err));
                            return true;
                        }
                    }
                }
                false
            }
        }
    }

    /// Replays `poll_events`: which fd/interest each side wants polled next.
    pub(crate) fn poll_wants(&self) -> (PollWant, PollWant) {
        match self.state {
            ConnState::Error => (PollWant::None, PollWant::None),
            ConnState::InProgress => (PollWant::SocketWritable, PollWant::None),
            ConnState::Connected => {
                let send = match &self.sending {
                    Some(m) if m.buffering => {
                        if m.hung_up {
                            PollWant::None
                        } else {
                            PollWant::PipeReadable(m.pipe_fd().expect("buffering implies Fd"))
                        }
                    }
                    Some(_) => PollWant::SocketWritable,
                    None if !self.send_queue.is_empty() => PollWant::SocketWritable,
                    None => PollWant::None,
                };
                let recv = match &self.recving {
                    Some(m) if m.buffering => {
                        PollWant::PipeWritable(m.pipe_fd().expect("buffering implies Fd"))
                    }
                    _ if self.recv.is_none() => PollWant::SocketReadable,
                    _ => PollWant::None,
                };
                (send, recv)
            }
            ConnState::Server => {
                let recv = if self.acc.is_none() { PollWant::SocketReadable } else { PollWant::None };
                (PollWant::None, recv)
            }
        }
    }

    /// Single-connection wait (spec.md §4.7 `wait`). Drives the connection
    /// through turns until a receive completes, a child is acceptable, the
    /// deadline passes, or a fatal error is latched.
    pub fn wait(&mut self, deadline: Instant) -> Result<bool, MqError> {
        if self.private_poll.is_none() {
            let poll = Poll::new()?;
            self.private_poll = Some((poll, Events::with_capacity(4)));
        }

        let mut send_ev = Readiness::default();
        let mut recv_ev = Readiness::default();

        loop {
            if self.turn(send_ev, recv_ev) {
                return Err(MqError::Latched(self.err));
            }
            if self.has_completed_recv() || self.has_pending_accept() {
                return Ok(true);
            }

            let (send_want, recv_want) = self.poll_wants();
            self.register_wants(send_want, recv_want)?;

            let timeout = deadline.saturating_duration_since(Instant::now());
            let (poll, events) = self.private_poll.as_mut().unwrap();
            loop {
                match poll.poll(events, Some(timeout)) {
                    Ok(()) => break,
                    Err(e) if is_transient(&e) => {
                        if Instant::now() >= deadline {
                            return Ok(false);
                        }
                        continue;
                    }
                    Err(e) => return Err(MqError::Io(e)),
                }
            }

            if events.is_empty() {
                return Ok(false);
            }

            send_ev = Readiness::default();
            recv_ev = Readiness::default();
            for event in events.iter() {
                let readiness = Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    hup_or_err: event.is_error() || event.is_read_closed() || event.is_write_closed(),
                };
                if event.token() == TOKEN_SEND {
                    send_ev = readiness;
                } else if event.token() == TOKEN_RECV {
                    recv_ev = readiness;
                }
            }
        }
    }

    /// Registers/deregisters the private poll's two slots to match what
    /// `poll_wants` just computed, deregistering a slot entirely when its
    /// `PollWant` is `None` (mirrors `pfd[i].fd = -1`).
    fn register_wants(&mut self, send: PollWant, recv: PollWant) -> Result<(), MqError> {
        let socket_fd = self.link.fd();
        let registry = self.private_poll.as_ref().unwrap().0.registry();
        Self::apply_want(registry, TOKEN_SEND, send, socket_fd, &mut self.send_registered)?;
        Self::apply_want(registry, TOKEN_RECV, recv, socket_fd, &mut self.recv_registered)?;
        Ok(())
    }

    /// Brings one token's registration in line with `want`, diffing against
    /// what was registered last turn rather than blindly reregistering.
    fn apply_want(
        registry: &mio::Registry,
        token: Token,
        want: PollWant,
        socket_fd: RawFd,
        registered: &mut Option<(RawFd, Interest)>,
    ) -> Result<(), MqError> {
        let target = match want {
            PollWant::None => None,
            PollWant::SocketReadable => Some((socket_fd, Interest::READABLE)),
            PollWant::SocketWritable => Some((socket_fd, Interest::WRITABLE)),
            PollWant::PipeReadable(fd) => Some((fd, Interest::READABLE)),
            PollWant::PipeWritable(fd) => Some((fd, Interest::WRITABLE)),
        };

        if *registered == target {
            return Ok(());
        }
        if let Some((fd, _)) = *registered {
            let _ = registry.deregister(&mut SourceFd(&fd));
        }
        if let Some((fd, interest)) = target {
            registry.register(&mut SourceFd(&fd), token, interest)?;
        }
        *registered = target;
        Ok(())
    }
}
