//! A frame with a corrupted magic number kills the connection with
//! `BadFrame`/`EBADF` and delivers nothing (spec.md §8 scenario 4).

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream},
    thread,
    time::{Duration, Instant},
};

use mq::{Connection, PollGroup};

#[test]
fn corrupted_magic_is_rejected_without_delivering_a_payload() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 65103));

    let mut group = PollGroup::new().unwrap();
    let server = Connection::serve(addr).unwrap();
    let server_tok = group.add(server).unwrap();

    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let mut stream = TcpStream::connect(addr).unwrap();
        // A SINGLE-frame header with mangled magic ("XXmsg" instead of
        // "MQmsg"), reserved bytes zero, length zero.
        let mut frame = [0u8; 16];
        frame[0..5].copy_from_slice(b"XXmsg");
        frame[7] = 0b11; // SINGLE: START | END
        std::io::Write::write_all(&mut stream, &frame).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut accepted_tok = None;
    while accepted_tok.is_none() {
        group.poll_wait(Some(Duration::from_secs(1))).unwrap();
        if group.acceptable().any(|t| t == server_tok) {
            let conn = group.get_mut(server_tok).unwrap().accept().unwrap();
            accepted_tok = Some(group.add(conn).unwrap());
        }
        assert!(Instant::now() < deadline, "server never accepted the connection");
    }
    let accepted_tok = accepted_tok.unwrap();
    group.get_mut(accepted_tok).unwrap().store_buffer(Vec::new()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        group.poll_wait(Some(Duration::from_secs(1))).unwrap();
        if group.errored().any(|t| t == accepted_tok) {
            break;
        }
        assert!(!group.readable().any(|t| t == accepted_tok), "a bad-magic frame must never be delivered");
        assert!(Instant::now() < deadline, "connection never entered the error state");
    }

    assert_eq!(group.get(accepted_tok).unwrap().geterror(), libc::EBADF);
}
