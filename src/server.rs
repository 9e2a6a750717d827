//! The listening side: accepts raw links, learns who they belong to and
//! groups them into [`ParallelSocket`]s.
//!
//! Every accepted connection is asked for its identity first. The answer
//! carries the GUID of the logical client; a known GUID adds the link to the
//! existing socket, an unknown one goes through the [`ServerAcceptor`] and,
//! if admitted, becomes a new socket.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use polling::{Event, Events, Poller};
use uuid::Uuid;

use crate::conf::ServerOptions;
use crate::dispatch::EventDispatcher;
use crate::error::{Error, Result, SendStatus, StartStatus};
use crate::link::{LinkHandler, LinkId, LinkRef, TcpLink};
use crate::lock;
use crate::packet::{Identity, Packet, PacketType};
use crate::room::{Change, Room, RoomHandler, Rooms};
use crate::socket::{ParallelSocket, SocketHandler};

const LISTENER: usize = 0;

/// How a new logical client is admitted.
pub struct Admission {
    /// Receives the events of the new socket.
    pub handler: Arc<dyn SocketHandler>,
    /// Most links the socket may hold; overrides [`ServerOptions::link_cap`].
    pub link_cap: Option<usize>,
}

impl Admission {
    /// Admits with `handler` and the server's link cap.
    pub fn new(handler: Arc<dyn SocketHandler>) -> Admission {
        Admission {
            handler,
            link_cap: None,
        }
    }

    /// Caps the socket at `link_cap` links.
    pub fn with_link_cap(mut self, link_cap: usize) -> Admission {
        self.link_cap = Some(link_cap);
        self
    }
}

/// Decides whether a client presenting a new GUID becomes a socket.
pub trait ServerAcceptor: Send + Sync {
    /// Called once per new GUID, on a link thread. `None` rejects the link.
    fn on_accept(&self, peer_addr: Option<SocketAddr>, identity: &Identity) -> Option<Admission>;
}

/// Server lifecycle callbacks, called on the server's event thread.
pub trait ServerHandler: Send + Sync {
    /// Outcome of [`ParallelServer::start`].
    fn on_started(&self, _status: StartStatus) {}
    /// A new socket was registered. Its `on_new_connection` follows on the
    /// socket's own thread.
    fn on_accepted(&self, _socket: &ParallelSocket) {}
    /// [`ParallelServer::stop`] completed.
    fn on_stopped(&self) {}
}

pub(crate) struct ServerShared {
    me: Weak<ServerShared>,
    options: ServerOptions,
    acceptor: Arc<dyn ServerAcceptor>,
    handler: Option<Arc<dyn ServerHandler>>,
    room_handler: Option<Arc<dyn RoomHandler>>,
    events: EventDispatcher,
    pending: Mutex<HashMap<LinkId, LinkRef>>,
    sockets: Mutex<HashMap<Uuid, ParallelSocket>>,
    rooms: Mutex<Rooms>,
    admission: Mutex<()>,
}

impl ServerShared {
    fn welcome(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(self.options.no_delay)?;
        let link: LinkRef = TcpLink::from_stream(stream)?;
        let Some(me) = self.me.upgrade() else {
            link.disconnect();
            return Ok(());
        };
        lock(&self.pending).insert(link.id(), Arc::clone(&link));
        link.set_handler(me);
        link.send(Packet::control(PacketType::IdentityRequest));
        Ok(())
    }

    fn resolve(&self, link: LinkRef, identity: Identity) {
        let _serial = lock(&self.admission);
        let known = lock(&self.sockets).get(&identity.guid).cloned();
        let link = match known {
            Some(socket) => match socket.add_link(link) {
                Ok(()) => return,
                // Torn down while this link was in flight; start over.
                Err(link) => {
                    self.forget(&socket);
                    link
                }
            },
            None => link,
        };

        if let Some(max) = self.options.max_sockets {
            if lock(&self.sockets).len() >= max {
                log::debug!("Rejecting {}: already {max} sockets", identity.guid);
                link.disconnect();
                return;
            }
        }
        let Some(admission) = self.acceptor.on_accept(link.peer_addr(), &identity) else {
            log::debug!("Acceptor rejected {}", identity.guid);
            link.disconnect();
            return;
        };
        let spawned = ParallelSocket::spawn(
            self.me.clone(),
            identity,
            link.peer_addr(),
            admission.handler,
            self.options.receive_mode,
            admission.link_cap.or(self.options.link_cap),
        );
        let socket = match spawned {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("Cannot start socket for {}: {e}", identity.guid);
                link.disconnect();
                return;
            }
        };
        lock(&self.sockets).insert(identity.guid, socket.clone());
        log::debug!(
            "New socket {} from {:?}, {} links announced",
            identity.guid,
            link.peer_addr(),
            identity.link_count
        );
        if let Err(link) = socket.add_link(link) {
            link.disconnect();
            socket.abandon();
            self.forget(&socket);
            return;
        }
        if let Some(handler) = &self.handler {
            let handler = Arc::clone(handler);
            self.events.post(move || handler.on_accepted(&socket));
        }
    }

    pub(crate) fn forget(&self, socket: &ParallelSocket) {
        let guid = socket.guid();
        {
            let mut sockets = lock(&self.sockets);
            if sockets.get(&guid).is_some_and(|s| s.same_as(socket)) {
                sockets.remove(&guid);
            }
        }
        let left = lock(&self.rooms).leave_all(&guid);
        if left.is_empty() {
            return;
        }
        log::debug!("{guid} left {} rooms", left.len());
        if let Some(rooms) = &self.room_handler {
            let rooms = Arc::clone(rooms);
            self.events.post(move || {
                for (name, socket) in &left {
                    rooms.on_leave(name, socket);
                }
            });
        }
    }

    fn sockets(&self) -> Vec<ParallelSocket> {
        lock(&self.sockets).values().cloned().collect()
    }

    pub(crate) fn broadcast(&self, data: &[u8], exclude: Option<Uuid>) -> usize {
        self.sockets()
            .into_iter()
            .filter(|socket| Some(socket.guid()) != exclude)
            .filter(|socket| socket.send(data).is_ok())
            .count()
    }

    pub(crate) fn join(&self, room: &str, socket: &ParallelSocket) {
        let change = lock(&self.rooms).join(room, socket);
        if change == Change::None {
            return;
        }
        log::debug!("{} joined {room}", socket.guid());
        if let Some(rooms) = &self.room_handler {
            let rooms = Arc::clone(rooms);
            let (room, socket) = (room.to_string(), socket.clone());
            self.events.post(move || {
                if change == Change::Room {
                    rooms.on_created(&room);
                }
                rooms.on_join(&room, &socket);
            });
        }
    }

    pub(crate) fn leave(&self, room: &str, socket: &ParallelSocket) {
        let (change, left) = lock(&self.rooms).leave(room, &socket.guid());
        let Some(left) = left else {
            return;
        };
        log::debug!("{} left {room} ({change:?})", left.guid());
        if let Some(rooms) = &self.room_handler {
            let rooms = Arc::clone(rooms);
            let room = room.to_string();
            self.events.post(move || rooms.on_leave(&room, &left));
        }
    }

    pub(crate) fn broadcast_to_room(&self, room: &str, data: &[u8]) -> usize {
        let members = match lock(&self.rooms).get(room) {
            Some(room) => room.members(),
            None => return 0,
        };
        let sent = members.iter().filter(|s| s.send(data).is_ok()).count();
        if let Some(rooms) = &self.room_handler {
            let rooms = Arc::clone(rooms);
            let (room, data) = (room.to_string(), data.to_vec());
            self.events.post(move || rooms.on_broadcast(&room, &data));
        }
        sent
    }

    pub(crate) fn rooms_of(&self, guid: &Uuid) -> Vec<String> {
        lock(&self.rooms).names_of(guid)
    }
}

impl LinkHandler for ServerShared {
    fn on_received(&self, id: LinkId, packet: Packet) {
        let Some(link) = lock(&self.pending).remove(&id) else {
            return;
        };
        if packet.kind() != PacketType::IdentityResponse {
            log::warn!("{id} sent {:?} before identifying, dropping it", packet.kind());
            link.disconnect();
            return;
        }
        match packet.identity() {
            Ok(identity) => self.resolve(link, identity),
            Err(e) => {
                log::warn!("{id}: {e}");
                link.disconnect();
            }
        }
    }

    fn on_sent(&self, id: LinkId, _packet: Packet, status: SendStatus) {
        if status != SendStatus::Success {
            log::debug!("{id}: identity request not delivered: {status:?}");
        }
    }

    fn on_disconnected(&self, id: LinkId) {
        if lock(&self.pending).remove(&id).is_some() {
            log::debug!("{id} closed before identifying");
        }
    }
}

struct Running {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    poller: Arc<Poller>,
    stopping: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

/// Accepts logical clients made of several TCP links.
///
/// ```rust,no_run
/// use std::net::SocketAddr;
/// use std::sync::Arc;
/// use parallel_tcp::{
///     Admission, Identity, Packet, ParallelServer, ParallelSocket, ServerAcceptor,
///     ServerOptions, SocketHandler,
/// };
///
/// struct Echo;
///
/// impl SocketHandler for Echo {
///     fn on_received(&self, socket: &ParallelSocket, packet: Packet) {
///         let _ = socket.send(packet.payload());
///     }
/// }
///
/// struct Everyone;
///
/// impl ServerAcceptor for Everyone {
///     fn on_accept(&self, _peer: Option<SocketAddr>, _identity: &Identity) -> Option<Admission> {
///         Some(Admission::new(Arc::new(Echo)))
///     }
/// }
///
/// let server = ParallelServer::new();
/// server.start(ServerOptions::new("0.0.0.0", 8080), Arc::new(Everyone), None)?;
/// # Ok::<(), parallel_tcp::Error>(())
/// ```
#[derive(Default)]
pub struct ParallelServer {
    running: Mutex<Option<Running>>,
    room_handler: Mutex<Option<Arc<dyn RoomHandler>>>,
}

impl ParallelServer {
    /// Creates a stopped server.
    pub fn new() -> ParallelServer {
        ParallelServer::default()
    }

    /// Sets who hears about rooms. Takes effect on the next `start`.
    pub fn set_room_handler(&self, handler: Arc<dyn RoomHandler>) {
        *lock(&self.room_handler) = Some(handler);
    }

    /// Binds and starts accepting links.
    pub fn start(
        &self,
        options: ServerOptions,
        acceptor: Arc<dyn ServerAcceptor>,
        handler: Option<Arc<dyn ServerHandler>>,
    ) -> Result<()> {
        options.validate()?;
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let events = EventDispatcher::spawn("ptcp-server-events".to_string())?;
        let listener = match bind(&options) {
            Ok(listener) => listener,
            Err(e) => {
                log::warn!("Cannot listen on {}:{}: {e}", options.host, options.port);
                if let Some(handler) = handler {
                    events.post(move || handler.on_started(StartStatus::FailSocketError));
                }
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        let poller = Arc::new(Poller::new()?);
        // SAFETY: the listener is removed from the poller before it is dropped.
        unsafe { poller.add(&listener, Event::readable(LISTENER))? };

        let room_handler = lock(&self.room_handler).clone();
        let shared = Arc::new_cyclic(|me| ServerShared {
            me: me.clone(),
            options,
            acceptor,
            handler,
            room_handler,
            events,
            pending: Mutex::new(HashMap::new()),
            sockets: Mutex::new(HashMap::new()),
            rooms: Mutex::new(Rooms::default()),
            admission: Mutex::new(()),
        });
        let stopping = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let (shared, poller, stopping) =
                (Arc::clone(&shared), Arc::clone(&poller), Arc::clone(&stopping));
            std::thread::Builder::new()
                .name("ptcp-accept".to_string())
                .spawn(move || accept_loop(shared, listener, poller, stopping))?
        };
        log::debug!("Listening on {local_addr}");
        if let Some(handler) = &shared.handler {
            let handler = Arc::clone(handler);
            shared.events.post(move || handler.on_started(StartStatus::Success));
        }
        *running = Some(Running {
            shared,
            local_addr,
            poller,
            stopping,
            acceptor: Some(accept_thread),
        });
        Ok(())
    }

    /// Stops accepting and disconnects every client. Does nothing when not
    /// started.
    pub fn stop(&self) {
        let Some(mut running) = lock(&self.running).take() else {
            return;
        };
        running.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = running.poller.notify() {
            log::warn!("Cannot wake the acceptor: {e}");
        }
        if let Some(thread) = running.acceptor.take() {
            let _ = thread.join();
        }
        let shared = &running.shared;
        let pending: Vec<LinkRef> = lock(&shared.pending).drain().map(|(_, l)| l).collect();
        for link in pending {
            link.disconnect();
        }
        for socket in shared.sockets() {
            socket.disconnect();
        }
        log::debug!("Stopped listening on {}", running.local_addr);
        if let Some(handler) = &shared.handler {
            let handler = Arc::clone(handler);
            shared.events.post(move || handler.on_stopped());
        }
    }

    /// Whether the server is accepting links.
    pub fn is_started(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().map(|r| r.local_addr)
    }

    fn shared(&self) -> Option<Arc<ServerShared>> {
        lock(&self.running).as_ref().map(|r| Arc::clone(&r.shared))
    }

    /// Registered sockets, in no particular order.
    pub fn sockets(&self) -> Vec<ParallelSocket> {
        self.shared().map(|s| s.sockets()).unwrap_or_default()
    }

    /// The socket registered under `guid`.
    pub fn socket(&self, guid: &Uuid) -> Option<ParallelSocket> {
        let shared = self.shared()?;
        let socket = lock(&shared.sockets).get(guid).cloned();
        socket
    }

    /// Sends `data` to every socket but `exclude`. Returns how many sockets
    /// it was queued for.
    pub fn broadcast(&self, data: &[u8], exclude: Option<Uuid>) -> usize {
        self.shared().map_or(0, |s| s.broadcast(data, exclude))
    }

    /// Disconnects every socket; the server keeps accepting.
    pub fn shutdown_all_clients(&self) {
        for socket in self.sockets() {
            socket.disconnect();
        }
    }

    /// Adds `socket` to `room`; see [`ParallelSocket::join`].
    pub fn join(&self, room: &str, socket: &ParallelSocket) -> Result<()> {
        socket.join(room)
    }

    /// Removes `socket` from `room`.
    pub fn leave(&self, room: &str, socket: &ParallelSocket) -> Result<()> {
        socket.leave(room)
    }

    /// Sends `data` to every member of `room`.
    pub fn broadcast_to_room(&self, room: &str, data: &[u8]) -> usize {
        self.shared().map_or(0, |s| s.broadcast_to_room(room, data))
    }

    /// Snapshot of `room`, if it has members.
    pub fn room(&self, name: &str) -> Option<Room> {
        let shared = self.shared()?;
        let room = lock(&shared.rooms).get(name).cloned();
        room
    }

    /// Names of every room, sorted.
    pub fn room_names(&self) -> Vec<String> {
        self.shared()
            .map(|s| lock(&s.rooms).names())
            .unwrap_or_default()
    }
}

impl Drop for ParallelServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(options: &ServerOptions) -> Result<TcpListener> {
    let listener = TcpListener::bind((options.host.as_str(), options.port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    poller: Arc<Poller>,
    stopping: Arc<AtomicBool>,
) {
    let mut events = Events::new();
    while !stopping.load(Ordering::SeqCst) {
        events.clear();
        if let Err(e) = poller.wait(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            log::warn!("Acceptor cannot wait: {e}");
            break;
        }
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        for event in events.iter() {
            if event.key == LISTENER {
                accept_ready(&shared, &listener);
            }
        }
        if let Err(e) = poller.modify(&listener, Event::readable(LISTENER)) {
            log::warn!("Acceptor cannot re-arm: {e}");
            break;
        }
    }
    let _ = poller.delete(&listener);
    log::debug!("Acceptor finished");
}

fn accept_ready(shared: &ServerShared, listener: &TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::debug!("Accepted connection from: {addr}");
                if let Err(e) = shared.welcome(stream) {
                    log::warn!("Cannot set up link from {addr}: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("Accept failed: {e}");
                return;
            }
        }
    }
}
