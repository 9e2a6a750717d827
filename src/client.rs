//! The connecting side: one logical connection opened as N links.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use uuid::Uuid;

use crate::conf::ClientOptions;
use crate::dispatch::EventDispatcher;
use crate::error::{ConnectStatus, Error, Result, SendStatus};
use crate::link::{LinkRef, TcpLink};
use crate::lock;
use crate::packet::{Identity, Packet};
use crate::reassembler::ReceiveMode;
use crate::session::{EventSink, Flavor, PeerState, Session, SessionEvent};

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// Application callbacks of a [`ParallelClient`].
///
/// Called in order on the client's own event thread, never on a link thread.
pub trait ClientHandler: Send + Sync {
    /// The connect started by [`ParallelClient::connect`] finished: `Success`
    /// as soon as the first link is up, `FailSocketError` if none came up.
    fn on_connected(&self, client: &ParallelClient, status: ConnectStatus);
    /// A data packet arrived.
    fn on_received(&self, client: &ParallelClient, packet: Packet);
    /// A send completed. Failed sends are retried on another link.
    fn on_sent(&self, _client: &ParallelClient, _status: SendStatus, _packet: Packet) {}
    /// The last link went away.
    fn on_disconnected(&self, _client: &ParallelClient) {}
}

struct ClientInner {
    name: String,
    session: Session,
    handler: Arc<dyn ClientHandler>,
    options: Mutex<ClientOptions>,
    identity: Mutex<Option<Identity>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.session.shutdown();
    }
}

/// A logical connection to a [`ParallelServer`](crate::ParallelServer)
/// spread over several TCP links.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use parallel_tcp::{ClientHandler, ClientOptions, ConnectStatus, Packet, ParallelClient};
///
/// struct Printer;
///
/// impl ClientHandler for Printer {
///     fn on_connected(&self, client: &ParallelClient, status: ConnectStatus) {
///         if status == ConnectStatus::Success {
///             let _ = client.send(b"hello");
///         }
///     }
///
///     fn on_received(&self, _client: &ParallelClient, packet: Packet) {
///         println!("{}", String::from_utf8_lossy(packet.payload()));
///     }
/// }
///
/// let client = ParallelClient::new(Arc::new(Printer))?;
/// client.connect(ClientOptions::new("127.0.0.1", 8080).with_link_count(4))?;
/// # Ok::<(), parallel_tcp::Error>(())
/// ```
#[derive(Clone)]
pub struct ParallelClient {
    inner: Arc<ClientInner>,
}

impl ParallelClient {
    /// Creates an idle client reporting to `handler`.
    pub fn new(handler: Arc<dyn ClientHandler>) -> Result<ParallelClient> {
        let name = format!("ptcp-client-{}", NEXT_CLIENT.fetch_add(1, Ordering::Relaxed));
        let events = EventDispatcher::spawn(format!("{name}-events"))?;
        let me: Arc<OnceLock<Weak<ClientInner>>> = Arc::new(OnceLock::new());
        let sink = client_sink(Arc::clone(&me), events);
        let session = Session::spawn(name.clone(), Flavor::Client, ReceiveMode::default(), sink)?;
        let inner = Arc::new(ClientInner {
            name,
            session,
            handler,
            options: Mutex::new(ClientOptions::default()),
            identity: Mutex::new(None),
        });
        let _ = me.set(Arc::downgrade(&inner));
        Ok(ParallelClient { inner })
    }

    /// Starts opening `options.link_count` links to the server.
    ///
    /// Returns once the attempts are under way; the outcome is reported
    /// through [`ClientHandler::on_connected`].
    pub fn connect(&self, options: ClientOptions) -> Result<()> {
        options.validate()?;
        if self.inner.session.state() != PeerState::Idle {
            return Err(Error::AlreadyConnected);
        }
        let link_count = i32::try_from(options.link_count)
            .map_err(|_| Error::InvalidOptions("link count does not fit the identity"))?;
        let addresses: Vec<SocketAddr> =
            (options.host.as_str(), options.port).to_socket_addrs()?.collect();
        if addresses.is_empty() {
            return Err(Error::InvalidOptions("host resolves to no address"));
        }

        let identity = Identity::generate(link_count);
        let epoch = self
            .inner
            .session
            .begin(identity, options.link_count, options.receive_mode)?;
        *lock(&self.inner.identity) = Some(identity);
        *lock(&self.inner.options) = options.clone();
        log::debug!(
            "{}: connecting to {}:{} over {} links as {}",
            self.inner.name,
            options.host,
            options.port,
            options.link_count,
            identity.guid
        );

        let addresses = Arc::new(addresses);
        for n in 0..options.link_count {
            let session = self.inner.session.clone();
            let addresses = Arc::clone(&addresses);
            let (timeout, no_delay) = (options.connect_timeout, options.no_delay);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-connect-{n}", self.inner.name))
                .spawn(move || open_link(session, epoch, &addresses, timeout, no_delay));
            if let Err(e) = spawned {
                log::warn!("{}: cannot spawn connect attempt: {e}", self.inner.name);
                self.inner.session.attempt_failed(epoch);
            }
        }
        Ok(())
    }

    /// Closes every link. `on_disconnected` follows once the last one is
    /// gone. Does nothing when not connected.
    pub fn disconnect(&self) {
        self.inner.session.disconnect();
    }

    /// Sends `data` as the next packet of the connection.
    ///
    /// Payloads over [`MAX_PAYLOAD_LEN`](crate::MAX_PAYLOAD_LEN) are refused
    /// with [`Error::PayloadTooLarge`].
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.inner.session.send(data)
    }

    /// Whether at least one link is up.
    pub fn is_connection_alive(&self) -> bool {
        self.inner.session.state() == PeerState::Connected
    }

    /// Lifecycle state.
    pub fn state(&self) -> PeerState {
        self.inner.session.state()
    }

    /// GUID of the current, or last, connection.
    pub fn guid(&self) -> Option<Uuid> {
        lock(&self.inner.identity).map(|identity| identity.guid)
    }

    /// Options of the current, or last, connection.
    pub fn options(&self) -> ClientOptions {
        lock(&self.inner.options).clone()
    }

    /// Server host.
    pub fn host(&self) -> String {
        lock(&self.inner.options).host.clone()
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        lock(&self.inner.options).port
    }

    /// Number of links asked for.
    pub fn link_count(&self) -> usize {
        lock(&self.inner.options).link_count
    }

    /// Number of links up right now.
    pub fn current_link_count(&self) -> usize {
        self.inner.session.link_count()
    }

    /// How inbound packets are delivered.
    pub fn receive_mode(&self) -> ReceiveMode {
        lock(&self.inner.options).receive_mode
    }

    /// Per link connect timeout.
    pub fn connect_timeout(&self) -> Option<Duration> {
        lock(&self.inner.options).connect_timeout
    }
}

fn open_link(
    session: Session,
    epoch: u64,
    addresses: &[SocketAddr],
    timeout: Option<Duration>,
    no_delay: bool,
) {
    match TcpLink::connect(addresses, timeout, no_delay) {
        Ok(link) => {
            let link: LinkRef = link;
            if let Err(link) = session.attach(link, epoch) {
                link.disconnect();
            }
        }
        Err(e) => {
            log::debug!("Connect attempt failed: {e}");
            session.attempt_failed(epoch);
        }
    }
}

fn client_sink(me: Arc<OnceLock<Weak<ClientInner>>>, events: EventDispatcher) -> EventSink {
    Box::new(move |event| {
        let Some(inner) = me.get().and_then(Weak::upgrade) else {
            return;
        };
        let client = ParallelClient { inner };
        events.post(move || {
            let handler = Arc::clone(&client.inner.handler);
            match event {
                SessionEvent::Connected(status) => handler.on_connected(&client, status),
                SessionEvent::Received(packet) => handler.on_received(&client, packet),
                SessionEvent::Sent(status, packet) => handler.on_sent(&client, status, packet),
                SessionEvent::Disconnected => handler.on_disconnected(&client),
            }
        });
    })
}
