//! A server sitting in a poll group reports nothing acceptable until a
//! client actually connects, and `accept` clears that signal (spec.md §8
//! scenario 2).

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::{Duration, Instant},
};

use mq::{Connection, PollGroup};

#[test]
fn accept_becomes_ready_only_after_a_connect() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 65101));

    let mut group = PollGroup::new().unwrap();
    let server = Connection::serve(addr).unwrap();
    let server_tok = group.add(server).unwrap();

    group.poll_wait(Some(Duration::from_secs(1))).unwrap();
    assert!(group.acceptable().next().is_none(), "nothing should be acceptable before any client connects");

    let _client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        std::net::TcpStream::connect(addr).unwrap()
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        group.poll_wait(Some(Duration::from_secs(1))).unwrap();
        if group.acceptable().any(|t| t == server_tok) {
            break;
        }
        assert!(Instant::now() < deadline, "server never became acceptable");
    }

    let accepted = group.get_mut(server_tok).unwrap().accept();
    assert!(accepted.is_some());
    assert!(group.acceptable().next().is_none(), "acceptable must clear once accept() drains it");
}
