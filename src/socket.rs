//! The server's view of one connected client.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use uuid::Uuid;

use crate::dispatch::EventDispatcher;
use crate::error::{ConnectStatus, Error, Result, SendStatus};
use crate::link::LinkRef;
use crate::packet::{Identity, Packet};
use crate::reassembler::ReceiveMode;
use crate::server::ServerShared;
use crate::session::{EventSink, Flavor, PeerState, Session, SessionEvent};

/// Application callbacks of one [`ParallelSocket`].
///
/// Called in order on the socket's own event thread.
pub trait SocketHandler: Send + Sync {
    /// The first link of the socket is up and READY was sent on it.
    fn on_new_connection(&self, _socket: &ParallelSocket) {}
    /// A data packet arrived.
    fn on_received(&self, socket: &ParallelSocket, packet: Packet);
    /// A send completed. Failed sends are retried on another link.
    fn on_sent(&self, _socket: &ParallelSocket, _status: SendStatus, _packet: Packet) {}
    /// The last link went away; the socket is no longer registered.
    fn on_disconnected(&self, _socket: &ParallelSocket) {}
}

struct SocketInner {
    identity: Identity,
    peer_addr: Option<SocketAddr>,
    session: Session,
    server: Weak<ServerShared>,
    handler: Arc<dyn SocketHandler>,
}

/// A logical client as seen by a [`ParallelServer`](crate::ParallelServer):
/// every link that presented the same GUID.
///
/// A socket lives as long as its links do, whether or not the application
/// keeps a handle to it. Cloning is cheap; clones refer to the same socket.
#[derive(Clone)]
pub struct ParallelSocket {
    inner: Arc<SocketInner>,
}

impl ParallelSocket {
    pub(crate) fn spawn(
        server: Weak<ServerShared>,
        identity: Identity,
        peer_addr: Option<SocketAddr>,
        handler: Arc<dyn SocketHandler>,
        mode: ReceiveMode,
        link_cap: Option<usize>,
    ) -> Result<ParallelSocket> {
        let name = format!("ptcp-socket-{}", identity.guid.simple());
        let events = EventDispatcher::spawn(format!("{name}-events"))?;
        let me: Arc<OnceLock<ParallelSocket>> = Arc::new(OnceLock::new());
        let sink = socket_sink(Arc::clone(&me), events);
        let session = Session::spawn(name, Flavor::Server { link_cap }, mode, sink)?;
        let socket = ParallelSocket {
            inner: Arc::new(SocketInner {
                identity,
                peer_addr,
                session,
                server,
                handler,
            }),
        };
        let _ = me.set(socket.clone());
        Ok(socket)
    }

    /// Stops a socket that never got a link.
    pub(crate) fn abandon(&self) {
        self.inner.session.shutdown();
    }

    /// Hands a link that presented this socket's GUID to the socket. Gives
    /// the link back when the socket is already torn down.
    pub(crate) fn add_link(&self, link: LinkRef) -> std::result::Result<(), LinkRef> {
        let session = &self.inner.session;
        session.attach(link, session.epoch())
    }

    /// GUID the client presented.
    pub fn guid(&self) -> Uuid {
        self.inner.identity.guid
    }

    /// Number of links the client said it would open.
    pub fn declared_link_count(&self) -> usize {
        usize::try_from(self.inner.identity.link_count).unwrap_or(0)
    }

    /// Number of links up right now.
    pub fn link_count(&self) -> usize {
        self.inner.session.link_count()
    }

    /// Address of the link that introduced the client.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Lifecycle state.
    pub fn state(&self) -> PeerState {
        self.inner.session.state()
    }

    /// Whether at least one link is up.
    pub fn is_connection_alive(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Sends `data` to this client.
    ///
    /// Payloads over [`MAX_PAYLOAD_LEN`](crate::MAX_PAYLOAD_LEN) are refused
    /// with [`Error::PayloadTooLarge`].
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.inner.session.send(data)
    }

    /// Closes every link of this client.
    pub fn disconnect(&self) {
        self.inner.session.disconnect();
    }

    /// Sends `data` to every other socket of the server. Returns how many
    /// sockets it was queued for.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        match self.inner.server.upgrade() {
            Some(server) => server.broadcast(data, Some(self.guid())),
            None => 0,
        }
    }

    /// Joins `room`, creating it if needed.
    pub fn join(&self, room: &str) -> Result<()> {
        let server = self.server()?;
        server.join(room, self);
        Ok(())
    }

    /// Leaves `room`; the room goes away with its last member.
    pub fn leave(&self, room: &str) -> Result<()> {
        let server = self.server()?;
        server.leave(room, self);
        Ok(())
    }

    /// Sends `data` to every member of `room`, this socket included if it
    /// is one.
    pub fn broadcast_to_room(&self, room: &str, data: &[u8]) -> Result<usize> {
        Ok(self.server()?.broadcast_to_room(room, data))
    }

    /// Rooms this socket is a member of.
    pub fn rooms(&self) -> Vec<String> {
        match self.inner.server.upgrade() {
            Some(server) => server.rooms_of(&self.guid()),
            None => Vec::new(),
        }
    }

    /// Whether both handles refer to the same socket.
    pub fn same_as(&self, other: &ParallelSocket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn server(&self) -> Result<Arc<ServerShared>> {
        if self.state() == PeerState::Idle {
            return Err(Error::NotConnected);
        }
        self.inner.server.upgrade().ok_or(Error::NotConnected)
    }

    /// Drops the socket from the server map and from every room.
    fn detach(&self) {
        if let Some(server) = self.inner.server.upgrade() {
            server.forget(self);
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(handler: Arc<dyn SocketHandler>) -> ParallelSocket {
        ParallelSocket::spawn(
            Weak::new(),
            Identity::generate(1),
            None,
            handler,
            ReceiveMode::Sequential,
            None,
        )
        .unwrap()
    }
}

impl std::fmt::Debug for ParallelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelSocket")
            .field("guid", &self.guid())
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

fn socket_sink(me: Arc<OnceLock<ParallelSocket>>, events: EventDispatcher) -> EventSink {
    Box::new(move |event| {
        let Some(socket) = me.get().cloned() else {
            return;
        };
        // A server session ends with `Disconnected`, or with a connect
        // failure when its first link died before it could be attached.
        if matches!(
            event,
            SessionEvent::Disconnected | SessionEvent::Connected(ConnectStatus::FailSocketError)
        ) {
            socket.detach();
        }
        events.post(move || {
            let handler = Arc::clone(&socket.inner.handler);
            match event {
                SessionEvent::Connected(ConnectStatus::Success) => {
                    handler.on_new_connection(&socket)
                }
                SessionEvent::Connected(_) => {}
                SessionEvent::Received(packet) => handler.on_received(&socket, packet),
                SessionEvent::Sent(status, packet) => handler.on_sent(&socket, status, packet),
                SessionEvent::Disconnected => handler.on_disconnected(&socket),
            }
        });
    })
}
