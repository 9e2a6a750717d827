//! Physical links: one TCP connection each, N of them per logical peer.
//!
//! The multiplexing core only sees the [`Link`] trait. Every link reports what
//! happens on it to a [`LinkHandler`], which can be swapped while the link is
//! running (the server hands a link from its identity dispatcher to the
//! logical socket the link turns out to belong to).
//!
//! [`TcpLink`] frames every packet with a `u32` little-endian length prefix:
//!
//! ```text
//! [len: u32 LE][packet frame: len bytes]
//! ```

use std::fmt;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::conf::MAX_FRAME_LEN;
use crate::error::{Error, Result, SendStatus};
use crate::lock;
use crate::packet::{HEADER_LEN, Packet};

/// Identity key of a physical link, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

impl LinkId {
    /// Allocates a fresh id.
    pub fn next() -> LinkId {
        LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw value.
    pub fn from_raw(raw: u64) -> LinkId {
        LinkId(raw)
    }

    /// The raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Receives the events of a link. Called from the link's own I/O threads.
pub trait LinkHandler: Send + Sync {
    /// A packet arrived.
    fn on_received(&self, link: LinkId, packet: Packet);
    /// A send handed to [`Link::send`] completed.
    fn on_sent(&self, link: LinkId, packet: Packet, status: SendStatus);
    /// The link is gone. Reported once.
    fn on_disconnected(&self, link: LinkId);
}

/// One bidirectional connection.
pub trait Link: Send + Sync {
    /// Identity key.
    fn id(&self) -> LinkId;
    /// Routes further events to `handler`. The first call starts I/O.
    fn set_handler(&self, handler: Arc<dyn LinkHandler>);
    /// Queues `packet`; completion is reported through `on_sent`.
    fn send(&self, packet: Packet);
    /// Closes the link; `on_disconnected` follows once I/O has stopped.
    fn disconnect(&self);
    /// Whether the link is still usable.
    fn is_alive(&self) -> bool;
    /// Remote address, when known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Shared handle to a link.
pub type LinkRef = Arc<dyn Link>;

struct Shared {
    id: LinkId,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    alive: AtomicBool,
    closed: AtomicBool,
    started: AtomicBool,
    handler: Mutex<Option<Arc<dyn LinkHandler>>>,
    outbound: Mutex<Option<Sender<Packet>>>,
    queued: Mutex<Option<Receiver<Packet>>>,
}

impl Shared {
    fn handler(&self) -> Option<Arc<dyn LinkHandler>> {
        lock(&self.handler).clone()
    }

    fn report_sent(&self, packet: Packet, status: SendStatus) {
        if let Some(handler) = self.handler() {
            handler.on_sent(self.id, packet, status);
        }
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        lock(&self.outbound).take();
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("{} closed", self.id);
            if let Some(handler) = self.handler() {
                handler.on_disconnected(self.id);
            }
        }
    }
}

/// A link over one `TcpStream`, with a reader and a writer thread.
pub struct TcpLink {
    shared: Arc<Shared>,
}

impl TcpLink {
    /// Wraps an already connected stream. I/O starts with the first handler.
    pub fn from_stream(stream: TcpStream) -> Result<Arc<TcpLink>> {
        stream.set_nonblocking(false)?;
        let peer_addr = stream.peer_addr().ok();
        let (tx, rx) = channel();
        let id = LinkId::next();
        log::debug!("{id} established with {peer_addr:?}");
        Ok(Arc::new(TcpLink {
            shared: Arc::new(Shared {
                id,
                stream,
                peer_addr,
                alive: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                started: AtomicBool::new(false),
                handler: Mutex::new(None),
                outbound: Mutex::new(Some(tx)),
                queued: Mutex::new(Some(rx)),
            }),
        }))
    }

    /// Opens a connection to the first reachable address of `addresses`.
    pub fn connect(
        addresses: &[SocketAddr],
        timeout: Option<Duration>,
        no_delay: bool,
    ) -> Result<Arc<TcpLink>> {
        let stream = match timeout {
            None => TcpStream::connect(addresses)?,
            Some(timeout) => {
                let mut last_err = None;
                let mut connected = None;
                for addr in addresses {
                    match TcpStream::connect_timeout(addr, timeout) {
                        Ok(s) => {
                            connected = Some(s);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                match (connected, last_err) {
                    (Some(s), _) => s,
                    (None, Some(e)) => return Err(e.into()),
                    (None, None) => return Err(Error::InvalidOptions("no address to connect to")),
                }
            }
        };
        stream.set_nodelay(no_delay)?;
        TcpLink::from_stream(stream)
    }

    fn start(&self) {
        let id = self.shared.id;
        let Some(queued) = lock(&self.shared.queued).take() else {
            return;
        };
        let reader = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("ptcp-rx-{}", id.get()))
            .spawn(move || read_loop(reader));
        if let Err(e) = spawned {
            log::warn!("{id}: cannot spawn reader: {e}");
            self.shared.close();
            return;
        }
        let writer = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("ptcp-tx-{}", id.get()))
            .spawn(move || write_loop(writer, queued));
        if let Err(e) = spawned {
            log::warn!("{id}: cannot spawn writer: {e}");
            self.shared.close();
        }
    }
}

impl Link for TcpLink {
    fn id(&self) -> LinkId {
        self.shared.id
    }

    fn set_handler(&self, handler: Arc<dyn LinkHandler>) {
        *lock(&self.shared.handler) = Some(handler);
        if !self.shared.started.swap(true, Ordering::SeqCst) {
            self.start();
        }
    }

    fn send(&self, packet: Packet) {
        let sender = lock(&self.shared.outbound).clone();
        match sender {
            Some(tx) if self.is_alive() => {
                if let Err(returned) = tx.send(packet) {
                    self.shared.report_sent(returned.0, SendStatus::FailNotConnected);
                }
            }
            _ => self.shared.report_sent(packet, SendStatus::FailNotConnected),
        }
    }

    fn disconnect(&self) {
        log::debug!("Disconnecting {}", self.shared.id);
        self.shared.alive.store(false, Ordering::SeqCst);
        let _ = self.shared.stream.shutdown(Shutdown::Both);
        if !self.shared.started.load(Ordering::SeqCst) {
            self.shared.close();
        }
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }
}

fn read_frame(reader: &mut impl Read) -> Result<Vec<u8>> {
    let mut len_bs = [0u8; 4];
    reader.read_exact(&mut len_bs)?;
    let len = u32::from_le_bytes(len_bs) as usize;
    if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
        return Err(Error::MalformedPacket(format!("frame length {len} out of range")));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    Ok(frame)
}

fn write_frame(writer: &mut impl Write, frame: &[u8]) -> std::io::Result<()> {
    let len_bs = (frame.len() as u32).to_le_bytes();
    writer.write_all(&len_bs)?;
    writer.write_all(frame)?;
    writer.flush()
}

fn read_loop(shared: Arc<Shared>) {
    let id = shared.id;
    let mut reader = BufReader::new(&shared.stream);
    loop {
        let packet = read_frame(&mut reader).and_then(Packet::from_frame);
        match packet {
            Ok(packet) => {
                if let Some(handler) = shared.handler() {
                    handler.on_received(id, packet);
                }
            }
            Err(Error::MalformedPacket(msg)) => {
                log::warn!("{id}: protocol violation ({msg}), dropping link");
                break;
            }
            Err(e) => {
                if shared.alive.load(Ordering::SeqCst) {
                    log::debug!("{id}: read failed: {e}");
                }
                break;
            }
        }
    }
    shared.close();
}

fn write_loop(shared: Arc<Shared>, queued: Receiver<Packet>) {
    let id = shared.id;
    let mut writer = BufWriter::new(&shared.stream);
    for packet in queued {
        let status = if !shared.alive.load(Ordering::SeqCst) {
            SendStatus::FailNotConnected
        } else if packet.frame().len() > MAX_FRAME_LEN {
            SendStatus::FailInvalidPacket
        } else {
            match write_frame(&mut writer, packet.frame()) {
                Ok(()) => SendStatus::Success,
                Err(e) => {
                    log::debug!("{id}: write failed: {e}");
                    shared.alive.store(false, Ordering::SeqCst);
                    let _ = shared.stream.shutdown(Shutdown::Both);
                    SendStatus::FailSocketError
                }
            }
        };
        shared.report_sent(packet, status);
    }
    log::debug!("{id}: writer finished");
}


#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::mpsc::RecvTimeoutError;

    use super::*;
    use crate::packet::PacketType;

    enum Seen {
        Received(Packet),
        Sent(i64, SendStatus),
        Closed,
    }

    struct Recorder(Mutex<Sender<Seen>>);

    impl LinkHandler for Recorder {
        fn on_received(&self, _link: LinkId, packet: Packet) {
            let _ = lock(&self.0).send(Seen::Received(packet));
        }
        fn on_sent(&self, _link: LinkId, packet: Packet, status: SendStatus) {
            let _ = lock(&self.0).send(Seen::Sent(packet.sequence(), status));
        }
        fn on_disconnected(&self, _link: LinkId) {
            let _ = lock(&self.0).send(Seen::Closed);
        }
    }

    fn recorder() -> (Arc<Recorder>, Receiver<Seen>) {
        let (tx, rx) = channel();
        (Arc::new(Recorder(Mutex::new(tx))), rx)
    }

    fn pair() -> (Arc<TcpLink>, Arc<TcpLink>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpLink::connect(&[addr], Some(Duration::from_secs(5)), true).unwrap();
        let (stream, _) = listener.accept().unwrap();
        (client, TcpLink::from_stream(stream).unwrap())
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn frames_survive_a_round_trip_over_tcp() {
        let (a, b) = pair();
        let (ha, rxa) = recorder();
        let (hb, rxb) = recorder();
        a.set_handler(ha);
        b.set_handler(hb);

        a.send(Packet::data(4, b"hello"));
        match rxa.recv_timeout(WAIT).unwrap() {
            Seen::Sent(seq, status) => assert_eq!((seq, status), (4, SendStatus::Success)),
            _ => panic!("expected a send completion"),
        }
        match rxb.recv_timeout(WAIT).unwrap() {
            Seen::Received(p) => {
                assert_eq!(p.kind(), PacketType::Data);
                assert_eq!(p.sequence(), 4);
                assert_eq!(p.payload(), b"hello");
            }
            _ => panic!("expected a packet"),
        }
    }

    #[test]
    fn disconnect_is_reported_once_on_both_ends() {
        let (a, b) = pair();
        let (ha, rxa) = recorder();
        let (hb, rxb) = recorder();
        a.set_handler(ha);
        b.set_handler(hb);

        a.disconnect();
        a.disconnect();
        assert!(matches!(rxa.recv_timeout(WAIT).unwrap(), Seen::Closed));
        assert!(matches!(rxb.recv_timeout(WAIT).unwrap(), Seen::Closed));
        assert!(!a.is_alive());
        assert!(matches!(
            rxa.recv_timeout(Duration::from_millis(200)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn sending_on_a_dead_link_fails_without_blocking() {
        let (a, _b) = pair();
        let (ha, rxa) = recorder();
        a.set_handler(ha);
        a.disconnect();
        a.send(Packet::data(1, b"late"));
        let mut saw_failure = false;
        while let Ok(seen) = rxa.recv_timeout(WAIT) {
            if let Seen::Sent(1, status) = seen {
                assert_eq!(status, SendStatus::FailNotConnected);
                saw_failure = true;
                break;
            }
        }
        assert!(saw_failure);
    }

    #[test]
    fn garbage_length_drops_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut raw = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let link = TcpLink::from_stream(stream).unwrap();
        let (h, rx) = recorder();
        link.set_handler(h);

        raw.write_all(&3u32.to_le_bytes()).unwrap();
        raw.write_all(&[1, 2, 3]).unwrap();
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Seen::Closed));
    }

    #[test]
    fn read_frame_checks_bounds() {
        let mut short = &[2u8, 0, 0, 0, 9, 9][..];
        assert!(matches!(read_frame(&mut short), Err(Error::MalformedPacket(_))));
        let frame = crate::packet::encode(0, PacketType::Ready, b"");
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        assert_eq!(read_frame(&mut &buf[..]).unwrap(), frame);
    }
}
