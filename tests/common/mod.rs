#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parallel_tcp::{
    Admission, ClientHandler, ClientOptions, ConnectStatus, Identity, Packet, ParallelClient,
    ParallelServer, ParallelSocket, RoomHandler, ServerAcceptor, ServerOptions, SocketHandler,
};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq)]
pub enum ClientEvent {
    Connected(ConnectStatus),
    Received(Vec<u8>),
    Disconnected,
}

pub struct Recorder(Mutex<Sender<ClientEvent>>);

impl Recorder {
    fn record(&self, event: ClientEvent) {
        let _ = self.0.lock().unwrap().send(event);
    }
}

impl ClientHandler for Recorder {
    fn on_connected(&self, _client: &ParallelClient, status: ConnectStatus) {
        self.record(ClientEvent::Connected(status));
    }

    fn on_received(&self, _client: &ParallelClient, packet: Packet) {
        self.record(ClientEvent::Received(packet.clone_payload()));
    }

    fn on_disconnected(&self, _client: &ParallelClient) {
        self.record(ClientEvent::Disconnected);
    }
}

pub fn client() -> (ParallelClient, Receiver<ClientEvent>) {
    let (tx, rx) = channel();
    let client = ParallelClient::new(Arc::new(Recorder(Mutex::new(tx)))).unwrap();
    (client, rx)
}

pub fn connect(port: u16, links: usize) -> (ParallelClient, Receiver<ClientEvent>) {
    let (client, events) = client();
    client
        .connect(ClientOptions::new("127.0.0.1", port).with_link_count(links))
        .unwrap();
    expect_connected(&events);
    (client, events)
}

pub fn expect_connected(events: &Receiver<ClientEvent>) {
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Connected(ConnectStatus::Success)
    );
}

/// Waits for `n` payloads, skipping other events.
pub fn received(events: &Receiver<ClientEvent>, n: usize) -> Vec<Vec<u8>> {
    let mut got = Vec::new();
    while got.len() < n {
        if let ClientEvent::Received(payload) = events.recv_timeout(WAIT).unwrap() {
            got.push(payload);
        }
    }
    got
}

pub fn expect_disconnected(events: &Receiver<ClientEvent>) {
    loop {
        if events.recv_timeout(WAIT).unwrap() == ClientEvent::Disconnected {
            return;
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum SocketEvent {
    New(Uuid),
    Received(Uuid, Vec<u8>),
    Disconnected(Uuid),
}

/// Echoes everything back and records what happened.
pub struct Echo(Mutex<Sender<SocketEvent>>);

impl Echo {
    fn record(&self, event: SocketEvent) {
        let _ = self.0.lock().unwrap().send(event);
    }
}

impl SocketHandler for Echo {
    fn on_new_connection(&self, socket: &ParallelSocket) {
        self.record(SocketEvent::New(socket.guid()));
    }

    fn on_received(&self, socket: &ParallelSocket, packet: Packet) {
        let _ = socket.send(packet.payload());
        self.record(SocketEvent::Received(socket.guid(), packet.clone_payload()));
    }

    fn on_disconnected(&self, socket: &ParallelSocket) {
        self.record(SocketEvent::Disconnected(socket.guid()));
    }
}

pub struct AcceptAll {
    echo: Arc<Echo>,
    link_cap: Option<usize>,
}

impl ServerAcceptor for AcceptAll {
    fn on_accept(&self, _peer: Option<SocketAddr>, _identity: &Identity) -> Option<Admission> {
        let admission = Admission::new(self.echo.clone());
        Some(match self.link_cap {
            Some(cap) => admission.with_link_cap(cap),
            None => admission,
        })
    }
}

fn start(
    server: ParallelServer,
    options: ServerOptions,
    link_cap: Option<usize>,
) -> (ParallelServer, Receiver<SocketEvent>, u16) {
    let (tx, rx) = channel();
    let acceptor = AcceptAll {
        echo: Arc::new(Echo(Mutex::new(tx))),
        link_cap,
    };
    server.start(options, Arc::new(acceptor), None).unwrap();
    let port = server.local_addr().unwrap().port();
    (server, rx, port)
}

pub fn server_with(
    options: ServerOptions,
    link_cap: Option<usize>,
) -> (ParallelServer, Receiver<SocketEvent>, u16) {
    start(ParallelServer::new(), options, link_cap)
}

pub fn server_with_rooms(
    rooms: Arc<dyn RoomHandler>,
) -> (ParallelServer, Receiver<SocketEvent>, u16) {
    let server = ParallelServer::new();
    server.set_room_handler(rooms);
    start(server, ServerOptions::new("127.0.0.1", 0), None)
}

pub fn server() -> (ParallelServer, Receiver<SocketEvent>, u16) {
    server_with(ServerOptions::new("127.0.0.1", 0), None)
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
