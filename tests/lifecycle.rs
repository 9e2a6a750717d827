mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use common::{ClientEvent, SocketEvent, WAIT};
use parallel_tcp::{
    CONTROL_SEQUENCE, ClientOptions, Error, Identity, PacketType, PeerState, ServerOptions,
};

#[test]
fn disconnect_twice_reports_one_disconnection() {
    let (server, socket_events, port) = common::server();
    let (client, events) = common::connect(port, 3);
    common::wait_until("socket registered", || server.sockets().len() == 1);
    let guid = server.sockets()[0].guid();

    client.disconnect();
    client.disconnect();
    let mut disconnects = 0;
    while let Ok(event) = events.recv_timeout(Duration::from_millis(500)) {
        if event == ClientEvent::Disconnected {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);
    assert_eq!(client.state(), PeerState::Idle);
    assert_eq!(client.current_link_count(), 0);
    assert!(matches!(client.send(b"late"), Err(Error::NotConnected)));

    loop {
        match socket_events.recv_timeout(WAIT).unwrap() {
            SocketEvent::Disconnected(g) => {
                assert_eq!(g, guid);
                break;
            }
            _ => continue,
        }
    }
    common::wait_until("socket deregistered", || server.sockets().is_empty());
}

#[test]
fn connecting_twice_is_refused() {
    let (_server, _socket_events, port) = common::server();
    let (client, _events) = common::connect(port, 2);
    assert!(matches!(
        client.connect(ClientOptions::new("127.0.0.1", port)),
        Err(Error::AlreadyConnected)
    ));
}

#[test]
fn a_client_can_reconnect_with_a_new_identity() {
    let (server, _socket_events, port) = common::server();
    let (client, events) = common::connect(port, 2);
    let first = client.guid();
    client.send(b"one").unwrap();
    assert_eq!(common::received(&events, 1), vec![b"one".to_vec()]);
    client.disconnect();
    common::expect_disconnected(&events);

    client
        .connect(ClientOptions::new("127.0.0.1", port).with_link_count(2))
        .unwrap();
    common::expect_connected(&events);
    assert_ne!(client.guid(), first);
    client.send(b"two").unwrap();
    assert_eq!(common::received(&events, 1), vec![b"two".to_vec()]);
    common::wait_until("only the new socket", || {
        let sockets = server.sockets();
        sockets.len() == 1 && Some(sockets[0].guid()) == client.guid()
    });
}

#[test]
fn starting_twice_is_refused() {
    let (server, _socket_events, _port) = common::server();
    assert!(server.is_started());
    let again = server.start(
        ServerOptions::new("127.0.0.1", 0),
        std::sync::Arc::new(NoOne),
        None,
    );
    assert!(matches!(again, Err(Error::AlreadyStarted)));

    server.stop();
    assert!(!server.is_started());
    assert!(server.local_addr().is_none());
    server.stop();
}

struct NoOne;

impl parallel_tcp::ServerAcceptor for NoOne {
    fn on_accept(
        &self,
        _peer: Option<std::net::SocketAddr>,
        _identity: &parallel_tcp::Identity,
    ) -> Option<parallel_tcp::Admission> {
        None
    }
}

#[test]
fn rejected_clients_are_disconnected() {
    let server = parallel_tcp::ParallelServer::new();
    server
        .start(ServerOptions::new("127.0.0.1", 0), std::sync::Arc::new(NoOne), None)
        .unwrap();
    let port = server.local_addr().unwrap().port();

    let (client, events) = common::connect(port, 2);
    common::expect_disconnected(&events);
    assert_eq!(client.state(), PeerState::Idle);
    assert!(server.sockets().is_empty());
}

#[test]
fn the_link_cap_limits_links_per_socket() {
    let (server, _socket_events, port) =
        common::server_with(ServerOptions::new("127.0.0.1", 0), Some(2));
    let (client, events) = common::connect(port, 5);

    common::wait_until("surplus links dropped", || {
        client.current_link_count() == 2
            && server.sockets().first().is_some_and(|s| s.link_count() == 2)
    });
    for i in 0..20 {
        client.send(format!("msg-{i}").as_bytes()).unwrap();
    }
    let expected: Vec<Vec<u8>> = (0..20).map(|i| format!("msg-{i}").into_bytes()).collect();
    assert_eq!(common::received(&events, 20), expected);
    assert_eq!(server.sockets()[0].link_count(), 2);
}

#[test]
fn max_sockets_turns_away_extra_clients() {
    let (server, _socket_events, port) =
        common::server_with(ServerOptions::new("127.0.0.1", 0).with_max_sockets(1), None);
    let (first, first_events) = common::connect(port, 2);
    common::wait_until("first socket", || server.sockets().len() == 1);

    let (second, second_events) = common::connect(port, 2);
    common::expect_disconnected(&second_events);
    assert!(!second.is_connection_alive());

    assert_eq!(server.sockets().len(), 1);
    first.send(b"still here").unwrap();
    assert_eq!(common::received(&first_events, 1), vec![b"still here".to_vec()]);
}

#[test]
fn stopping_the_server_disconnects_everyone() {
    let (server, socket_events, port) = common::server();
    let (_a, a_events) = common::connect(port, 2);
    let (_b, b_events) = common::connect(port, 3);
    common::wait_until("two sockets", || server.sockets().len() == 2);

    server.stop();
    for events in [&a_events, &b_events] {
        common::expect_disconnected(events);
        // Every link drops on its own; the peer still hears it once.
        while let Ok(event) = events.recv_timeout(Duration::from_millis(300)) {
            assert_ne!(event, ClientEvent::Disconnected);
        }
    }
    let mut gone = 0;
    while gone < 2 {
        if let SocketEvent::Disconnected(_) = socket_events.recv_timeout(WAIT).unwrap() {
            gone += 1;
        }
    }
    assert!(server.sockets().is_empty());
}

#[test]
fn shutdown_all_clients_keeps_the_server_listening() {
    let (server, _socket_events, port) = common::server();
    let (client, events) = common::connect(port, 2);
    common::wait_until("socket", || server.sockets().len() == 1);

    server.shutdown_all_clients();
    common::expect_disconnected(&events);
    assert!(server.is_started());

    client
        .connect(ClientOptions::new("127.0.0.1", port).with_link_count(2))
        .unwrap();
    common::expect_connected(&events);
    client.send(b"back").unwrap();
    assert_eq!(common::received(&events, 1), vec![b"back".to_vec()]);
}

/// Answers the identity request of a fresh link, then hangs up.
fn introduce_and_hang_up(port: u16) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).unwrap();
    let mut request = vec![0u8; u32::from_le_bytes(len) as usize];
    stream.read_exact(&mut request).unwrap();
    assert_eq!(parallel_tcp::decode(&request).unwrap().1, PacketType::IdentityRequest);

    let identity = Identity::generate(1).encode().unwrap();
    let response = parallel_tcp::encode(CONTROL_SEQUENCE, PacketType::IdentityResponse, &identity);
    stream.write_all(&(response.len() as u32).to_le_bytes()).unwrap();
    stream.write_all(&response).unwrap();
}

#[test]
fn links_dropped_right_after_the_handshake_leave_no_socket_behind() {
    let (server, _socket_events, port) =
        common::server_with(ServerOptions::new("127.0.0.1", 0).with_max_sockets(4), None);
    for _ in 0..100 {
        introduce_and_hang_up(port);
    }
    common::wait_until("every socket deregistered", || server.sockets().is_empty());

    let (client, events) = common::connect(port, 2);
    client.send(b"room for me").unwrap();
    assert_eq!(common::received(&events, 1), vec![b"room for me".to_vec()]);
}
