//! A connection can belong to at most one poll group at a time: `remove`
//! is the only way to get it back, and it always clears the group stamp
//! so the connection is free to join elsewhere (spec.md §8 scenario 6,
//! invariant 7). The `AlreadyMember`/`AlreadyInOtherGroup` rejection itself
//! needs access to the `pub(crate)` group stamp to exercise honestly (you
//! can't hand the same live `Connection` to two groups through the owning
//! API), so that half of the scenario is covered by a unit test in
//! `poll.rs` instead.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use mq::{Connection, MqError, PollGroup};

#[test]
fn removing_from_one_group_frees_a_connection_to_join_another() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 65105));

    let mut p = PollGroup::new().unwrap();
    let mut q = PollGroup::new().unwrap();

    let conn = Connection::serve(addr).unwrap();
    let tok_in_p = p.add(conn).unwrap();
    assert_eq!(p.len(), 1);

    let conn = p.remove(tok_in_p).unwrap();
    assert_eq!(p.len(), 0);

    let tok_in_q = q.add(conn).unwrap();
    assert_eq!(q.len(), 1);
    assert!(q.get(tok_in_q).is_some());
}

#[test]
fn removing_the_same_token_twice_is_not_member() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 65106));
    let mut p = PollGroup::new().unwrap();
    let conn = Connection::serve(addr).unwrap();
    let tok = p.add(conn).unwrap();

    assert!(p.remove(tok).is_ok());
    assert!(matches!(p.remove(tok), Err(MqError::NotMember)));
}

#[test]
fn a_token_from_a_different_group_is_not_member() {
    let p_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 65107));
    let q_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 65108));

    let mut p = PollGroup::new().unwrap();
    let mut q = PollGroup::new().unwrap();

    let tok_in_p = p.add(Connection::serve(p_addr).unwrap()).unwrap();
    let _tok_in_q = q.add(Connection::serve(q_addr).unwrap()).unwrap();

    // `tok_in_p`'s numeric value may coincide with a token `q` issued, but
    // each group only recognizes tokens it minted itself.
    assert!(q.get(tok_in_p).is_none());
    assert!(matches!(q.remove(tok_in_p), Err(MqError::NotMember)));
    assert!(p.get(tok_in_p).is_some());
}
