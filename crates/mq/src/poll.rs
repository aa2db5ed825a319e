//! Poll groups: multiplexing many connections over one OS poll instance
//! (spec.md §4.8), ported from `mq_poll_create`/`mq_poll_add`/`mq_poll_rm`/
//! `update_poll_group`/`mq_poll_wait` in the C source.
//!
//! The C source's poll group holds non-owning pointers into connections the
//! caller still owns, with a back-pointer (`mq->poll_group`) used purely to
//! detect double-add. Rust has no safe equivalent of that aliasing, so here
//! the group *owns* its members (the same shape `flux-network`'s
//! `ConnectionManager` uses for its `Vec<(Token, ConnectionVariant)>`); a
//! caller gets a `Connection` back by removing it from the group first.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use mio::{Events, Interest, Poll, Token};
use tracing::debug;

use crate::{
    connection::{Connection, ConnState, GroupId, PollWant, Readiness},
    error::MqError,
};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// A handle identifying one connection within a [`PollGroup`]. Opaque and
/// never reused, so a stale token from a removed connection can never alias
/// a later one (spec.md §9, resolving the C source's raw-pointer identity).
///
/// Carries the minting group's id alongside its per-group index: every
/// group's index counter starts at 0, so without the group id a token from
/// one group would collide with an equally-numbered token from another
/// (spec.md §3 invariant 5 — group membership is per-connection-exclusive,
/// and a foreign token must never be mistaken for a local one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken {
    group: u64,
    idx: u64,
}

fn encode(idx: u64, side: u8) -> Token {
    Token(((idx as usize) << 1) | side as usize)
}

fn decode(token: Token) -> (u64, u8) {
    ((token.0 >> 1) as u64, (token.0 & 1) as u8)
}

#[derive(Default, Clone, Copy)]
struct Registration {
    send: Option<(std::os::fd::RawFd, Interest)>,
    recv: Option<(std::os::fd::RawFd, Interest)>,
}

pub struct PollGroup {
    id: GroupId,
    poll: Poll,
    events: Events,
    next_token: u64,
    /// Stable iteration order, independent of `conns`' hashing (spec.md §9
    /// poll-construction-ordering note).
    members: Vec<ConnToken>,
    conns: HashMap<ConnToken, Connection>,
    registrations: HashMap<ConnToken, Registration>,
    /// Readiness observed on the previous `poll_wait` call, replayed through
    /// `turn` at the top of the next one (same feedback shape as the
    /// single-connection `wait`).
    pending: HashMap<ConnToken, (Readiness, Readiness)>,
}

impl PollGroup {
    pub fn new() -> Result<Self, MqError> {
        let id = GroupId(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed));
        Ok(Self {
            id,
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            next_token: 0,
            members: Vec::new(),
            conns: HashMap::new(),
            registrations: HashMap::new(),
            pending: HashMap::new(),
        })
    }

    /// Adds `conn` to the group (spec.md §6 `poll_add`). Rejects a
    /// connection that already belongs to a group, distinguishing "this
    /// group" (`AlreadyMember`) from "a different group" (`AlreadyInOtherGroup`)
    /// purely from the stamped `group` field — no pointer comparison needed.
    pub fn add(&mut self, mut conn: Connection) -> Result<ConnToken, MqError> {
        if let Some(existing) = conn.group {
            return Err(if existing == self.id { MqError::AlreadyMember } else { MqError::AlreadyInOtherGroup });
        }
        let token = ConnToken { group: self.id.0, idx: self.next_token };
        self.next_token += 1;
        conn.group = Some(self.id);
        self.members.push(token);
        self.conns.insert(token, conn);
        self.registrations.insert(token, Registration::default());
        self.pending.insert(token, (Readiness::default(), Readiness::default()));
        Ok(token)
    }

    /// Removes and returns the connection for `token` (spec.md §6
    /// `poll_rm`), clearing its group stamp and deregistering any fds.
    pub fn remove(&mut self, token: ConnToken) -> Result<Connection, MqError> {
        let mut conn = self.conns.remove(&token).ok_or(MqError::NotMember)?;
        if let Some(reg) = self.registrations.remove(&token) {
            if let Some((fd, _)) = reg.send {
                let _ = self.poll.registry().deregister(&mut mio::unix::SourceFd(&fd));
            }
            if let Some((fd, _)) = reg.recv {
                let _ = self.poll.registry().deregister(&mut mio::unix::SourceFd(&fd));
            }
        }
        self.members.retain(|t| *t != token);
        self.pending.remove(&token);
        conn.group = None;
        Ok(conn)
    }

    pub fn get(&self, token: ConnToken) -> Option<&Connection> {
        self.conns.get(&token)
    }

    pub fn get_mut(&mut self, token: ConnToken) -> Option<&mut Connection> {
        self.conns.get_mut(&token)
    }

    /// Every member, in the order it was added (spec.md §9: iteration order
    /// must be stable even though membership is hash-keyed internally).
    pub fn members(&self) -> &[ConnToken] {
        &self.members
    }

    /// Members with a connection waiting to be taken via `accept()`.
    /// Computed live from current connection state, not cached — calling
    /// `accept()` is immediately reflected, no extra `poll_wait` needed.
    pub fn acceptable(&self) -> impl Iterator<Item = ConnToken> + '_ {
        self.members.iter().copied().filter(|t| self.conns.get(t).is_some_and(Connection::has_pending_accept))
    }

    /// Members with a completed receive waiting to be taken via `recv()`.
    pub fn readable(&self) -> impl Iterator<Item = ConnToken> + '_ {
        self.members.iter().copied().filter(|t| self.conns.get(t).is_some_and(Connection::has_completed_recv))
    }

    /// Members latched in the `ERROR` state.
    pub fn errored(&self) -> impl Iterator<Item = ConnToken> + '_ {
        self.members.iter().copied().filter(|t| self.conns.get(t).is_some_and(|c| c.state() == ConnState::Error))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Removes every member, clearing each one's group stamp, and hands them
    /// back to the caller to `close` or re-add elsewhere (spec.md §4.8:
    /// "deleting a group must not orphan or double-free connections"). A
    /// caller that drops the group without calling this first simply drops
    /// whatever members remain, along with their links and in-flight
    /// messages, the same as dropping any other owned collection.
    pub fn drain(&mut self) -> Vec<Connection> {
        let tokens = std::mem::take(&mut self.members);
        tokens.into_iter().filter_map(|t| self.remove(t).ok()).collect()
    }

    /// One round: replay last round's readiness through each member's
    /// `turn`, then block for at most `timeout` collecting the next round's
    /// readiness (spec.md §6 `poll_wait`). `acceptable`/`readable`/`errored`
    /// reflect whatever state that leaves each member in.
    ///
    /// Unlike [`Connection::wait`], this never loops internally waiting for
    /// a specific member to become ready — callers drive their own loop and
    /// inspect whichever sets are non-empty after each call, the same shape
    /// `mq_poll_wait` gives a caller managing many connections at once.
    pub fn poll_wait(&mut self, timeout: Option<Duration>) -> Result<(), MqError> {
        for &token in &self.members {
            let (send_ev, recv_ev) = self.pending.get(&token).copied().unwrap_or_default();
            let Some(conn) = self.conns.get_mut(&token) else { continue };
            conn.turn(send_ev, recv_ev);
        }

        // Snapshot the tokens first: `apply_registration` takes `&mut self`,
        // which would conflict with a live shared borrow of `self.members`
        // held across the whole loop otherwise.
        for token in self.members.clone() {
            let Some(conn) = self.conns.get(&token) else { continue };
            let (send_want, recv_want) = conn.poll_wants();
            self.apply_registration(token, send_want, recv_want)?;
        }

        // If handling last round's events already left something acceptable,
        // readable, or errored, report it immediately rather than blocking
        // for up to `timeout` on top (spec.md §4.7).
        let timeout =
            if self.acceptable().next().is_some() || self.readable().next().is_some() || self.errored().next().is_some()
            {
                Some(Duration::ZERO)
            } else {
                timeout
            };

        let mut next: HashMap<ConnToken, (Readiness, Readiness)> =
            self.members.iter().map(|t| (*t, (Readiness::default(), Readiness::default()))).collect();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {
                for event in self.events.iter() {
                    let (idx, side) = decode(event.token());
                    let token = ConnToken { group: self.id.0, idx };
                    let Some(entry) = next.get_mut(&token) else { continue };
                    let readiness = Readiness {
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                        hup_or_err: event.is_error() || event.is_read_closed() || event.is_write_closed(),
                    };
                    if side == 0 {
                        entry.0 = readiness;
                    } else {
                        entry.1 = readiness;
                    }
                }
            }
            // Interrupted or would-block: no readiness this round, next
            // `poll_wait` call tries again from a clean slate.
            Err(e) if crate::sys::is_transient(&e) => {}
            Err(e) => return Err(MqError::Io(e)),
        }

        self.pending = next;
        Ok(())
    }

    fn apply_registration(&mut self, token: ConnToken, send: PollWant, recv: PollWant) -> Result<(), MqError> {
        let socket_fd = self.conns.get(&token).expect("member present").fd();
        let reg = self.registrations.entry(token).or_default();
        Self::apply_want(&self.poll, encode(token.idx, 0), send, socket_fd, &mut reg.send)?;
        Self::apply_want(&self.poll, encode(token.idx, 1), recv, socket_fd, &mut reg.recv)?;
        Ok(())
    }

    fn apply_want(
        poll: &Poll,
        token: Token,
        want: PollWant,
        socket_fd: std::os::fd::RawFd,
        registered: &mut Option<(std::os::fd::RawFd, Interest)>,
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
        let registry = poll.registry();
        if let Some((fd, _)) = *registered {
            let _ = registry.deregister(&mut mio::unix::SourceFd(&fd));
        }
        if let Some((fd, interest)) = target {
            registry.register(&mut mio::unix::SourceFd(&fd), token, interest)?;
        }
        *registered = target;
        Ok(())
    }
}

impl Drop for PollGroup {
    fn drop(&mut self) {
        debug!(members = self.members.len(), "mq: dropping poll group");
        // Connections are owned, so ordinary `Drop` on `self.conns` already
        // releases their links/messages; we only need the group's own
        // bookkeeping to go with it, which happens implicitly.
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    #[test]
    fn add_rejects_a_connection_already_stamped_with_this_group() {
        let mut p = PollGroup::new().unwrap();
        let mut conn = Connection::serve(addr(65201)).unwrap();
        conn.group = Some(p.id);
        assert!(matches!(p.add(conn), Err(MqError::AlreadyMember)));
    }

    #[test]
    fn add_rejects_a_connection_stamped_with_a_different_group() {
        let mut p = PollGroup::new().unwrap();
        let q = PollGroup::new().unwrap();
        let mut conn = Connection::serve(addr(65202)).unwrap();
        conn.group = Some(q.id);
        assert!(matches!(p.add(conn), Err(MqError::AlreadyInOtherGroup)));
    }

    #[test]
    fn add_then_remove_clears_the_stamp_for_reuse_elsewhere() {
        let mut p = PollGroup::new().unwrap();
        let mut q = PollGroup::new().unwrap();
        let conn = Connection::serve(addr(65203)).unwrap();
        let tok = p.add(conn).unwrap();
        let conn = p.remove(tok).unwrap();
        assert!(conn.group.is_none());
        assert!(q.add(conn).is_ok());
    }
}
