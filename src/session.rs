//! The engine behind every logical peer.
//!
//! Each peer runs one actor thread that owns its links, its
//! [`SendScheduler`] and its [`Reassembler`]. Links, the application and the
//! connect attempts only post [`Command`]s; the actor applies them one at a
//! time and blocks on its channel when there is nothing to do.
//!
//! The actor reports what the application must hear about through an
//! [`EventSink`], called on the actor thread. Sinks forward to an
//! `EventDispatcher` so handlers never run here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

use crate::conf::MAX_PAYLOAD_LEN;
use crate::error::{ConnectStatus, Error, Result, SendStatus};
use crate::link::{LinkHandler, LinkId, LinkRef};
use crate::lock;
use crate::packet::{Identity, Packet, PacketType, next_sequence};
use crate::reassembler::{ReceiveMode, Reassembler};
use crate::scheduler::{Completion, SendScheduler};

/// Lifecycle of a logical peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No links and no attempts in progress.
    Idle,
    /// Links are being opened or matched; none is up yet.
    Connecting,
    /// At least one link is up.
    Connected,
    /// `disconnect` was requested; waiting for the last link to go.
    Disconnecting,
}

/// Which side of the protocol a session speaks.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Flavor {
    /// Answers identity requests, waits for READY on every link.
    Client,
    /// Sends READY on every attached link, accepts DATA only.
    Server { link_cap: Option<usize> },
}

/// Something the application hears about.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Connected(ConnectStatus),
    Received(Packet),
    Sent(SendStatus, Packet),
    Disconnected,
}

pub(crate) type EventSink = Box<dyn FnMut(SessionEvent) + Send>;

pub(crate) enum Command {
    Begin {
        identity: Identity,
        attempts: usize,
        epoch: u64,
        mode: ReceiveMode,
    },
    Attach(LinkRef, u64),
    AttemptFailed(u64),
    Send(Vec<u8>),
    Received(LinkId, Packet),
    Sent(LinkId, Packet, SendStatus),
    Closed(LinkId),
    Disconnect,
    Shutdown,
}

struct Shared {
    state: Mutex<PeerState>,
    epoch: AtomicU64,
    link_count: AtomicUsize,
}

/// Handle to a running session actor.
#[derive(Clone)]
pub(crate) struct Session {
    tx: Sender<Command>,
    shared: Arc<Shared>,
}

struct SessionLinks {
    tx: Sender<Command>,
}

impl LinkHandler for SessionLinks {
    fn on_received(&self, link: LinkId, packet: Packet) {
        let _ = self.tx.send(Command::Received(link, packet));
    }

    fn on_sent(&self, link: LinkId, packet: Packet, status: SendStatus) {
        let _ = self.tx.send(Command::Sent(link, packet, status));
    }

    fn on_disconnected(&self, link: LinkId) {
        let _ = self.tx.send(Command::Closed(link));
    }
}

impl Session {
    /// Starts the actor thread.
    ///
    /// Client sessions start `Idle` and wait for [`Session::begin`]; server
    /// sessions start `Connecting` and live for one epoch only.
    pub(crate) fn spawn(
        name: String,
        flavor: Flavor,
        mode: ReceiveMode,
        sink: EventSink,
    ) -> Result<Session> {
        let (tx, rx) = channel();
        let initial = match flavor {
            Flavor::Client => PeerState::Idle,
            Flavor::Server { .. } => PeerState::Connecting,
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(initial),
            epoch: AtomicU64::new(0),
            link_count: AtomicUsize::new(0),
        });
        let actor = Actor {
            name: name.clone(),
            flavor,
            identity: None,
            links: HashMap::new(),
            scheduler: SendScheduler::new(),
            reassembler: Reassembler::new(mode),
            next_sequence: 0,
            epoch: 0,
            attempts_pending: 0,
            active: matches!(flavor, Flavor::Server { .. }),
            connected: false,
            closing: false,
            finished: false,
            shared: Arc::clone(&shared),
            sink,
            handler: Arc::new(SessionLinks { tx: tx.clone() }),
        };
        std::thread::Builder::new()
            .name(name)
            .spawn(move || actor.run(rx))?;
        Ok(Session { tx, shared })
    }

    /// Opens a client connection epoch with `attempts` links to come.
    /// Returns the epoch the attempts must be tagged with.
    pub(crate) fn begin(
        &self,
        identity: Identity,
        attempts: usize,
        mode: ReceiveMode,
    ) -> Result<u64> {
        let mut state = lock(&self.shared.state);
        if *state != PeerState::Idle {
            return Err(Error::AlreadyConnected);
        }
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx
            .send(Command::Begin {
                identity,
                attempts,
                epoch,
                mode,
            })
            .map_err(|_| Error::NotConnected)?;
        *state = PeerState::Connecting;
        Ok(epoch)
    }

    /// Current epoch.
    pub(crate) fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Hands a connected link to the session. Gives the link back when the
    /// session has already shut down.
    pub(crate) fn attach(&self, link: LinkRef, epoch: u64) -> std::result::Result<(), LinkRef> {
        let state = lock(&self.shared.state);
        if *state == PeerState::Idle {
            return Err(link);
        }
        match self.tx.send(Command::Attach(link, epoch)) {
            Ok(()) => Ok(()),
            Err(returned) => match returned.0 {
                Command::Attach(link, _) => Err(link),
                _ => Ok(()),
            },
        }
    }

    /// Reports a connect attempt of `epoch` that produced no link.
    pub(crate) fn attempt_failed(&self, epoch: u64) {
        let _ = self.tx.send(Command::AttemptFailed(epoch));
    }

    /// Queues `payload` as the next data packet.
    ///
    /// A payload that cannot fit in a frame is refused here, before it takes
    /// a sequence number the receiver would wait on forever.
    pub(crate) fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        let frame = Packet::unsequenced_data(payload);
        let state = lock(&self.shared.state);
        match *state {
            PeerState::Connecting | PeerState::Connected => self
                .tx
                .send(Command::Send(frame))
                .map_err(|_| Error::NotConnected),
            PeerState::Idle | PeerState::Disconnecting => Err(Error::NotConnected),
        }
    }

    /// Requests every link to close. No-op unless connecting or connected.
    pub(crate) fn disconnect(&self) {
        let mut state = lock(&self.shared.state);
        if matches!(*state, PeerState::Connecting | PeerState::Connected) {
            *state = PeerState::Disconnecting;
            let _ = self.tx.send(Command::Disconnect);
        }
    }

    /// Stops the actor, closing whatever links remain.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub(crate) fn state(&self) -> PeerState {
        *lock(&self.shared.state)
    }

    pub(crate) fn link_count(&self) -> usize {
        self.shared.link_count.load(Ordering::SeqCst)
    }
}

struct Actor {
    name: String,
    flavor: Flavor,
    identity: Option<Identity>,
    links: HashMap<LinkId, LinkRef>,
    scheduler: SendScheduler,
    reassembler: Reassembler,
    next_sequence: i64,
    epoch: u64,
    attempts_pending: usize,
    active: bool,
    connected: bool,
    closing: bool,
    finished: bool,
    shared: Arc<Shared>,
    sink: EventSink,
    handler: Arc<dyn LinkHandler>,
}

impl Actor {
    fn run(mut self, rx: Receiver<Command>) {
        log::debug!("{} started", self.name);
        while let Ok(command) = rx.recv() {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
            self.pump();
            if self.finished {
                break;
            }
        }
        // Nothing can be posted any more once the state reads Idle; refuse
        // what slipped in before that.
        for command in rx.try_iter() {
            if let Command::Attach(link, _) = command {
                link.disconnect();
            }
        }
        for link in self.links.values() {
            link.disconnect();
        }
        log::debug!("{} stopped", self.name);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Begin {
                identity,
                attempts,
                epoch,
                mode,
            } => {
                self.identity = Some(identity);
                self.reassembler = Reassembler::new(mode);
                self.epoch = epoch;
                self.attempts_pending = attempts;
                self.active = true;
                self.connected = false;
                self.closing = false;
                log::debug!("{}: opening {attempts} links as {}", self.name, identity.guid);
            }
            Command::Attach(link, epoch) => self.attach(link, epoch),
            Command::AttemptFailed(epoch) => {
                if epoch == self.epoch && self.active {
                    self.attempts_pending = self.attempts_pending.saturating_sub(1);
                    self.settle();
                }
            }
            Command::Send(frame) => {
                if !self.active {
                    log::debug!("{}: dropping send outside of a connection", self.name);
                    return;
                }
                let sequence = self.next_sequence;
                self.next_sequence = next_sequence(sequence);
                self.scheduler.enqueue(Packet::sequenced(frame, sequence));
            }
            Command::Received(link, packet) => self.received(link, packet),
            Command::Sent(link, packet, status) => self.sent(link, packet, status),
            Command::Closed(link) => self.closed(link),
            Command::Disconnect => {
                self.closing = true;
                for link in self.links.values() {
                    link.disconnect();
                }
                self.settle();
            }
            Command::Shutdown => {}
        }
    }

    fn attach(&mut self, link: LinkRef, epoch: u64) {
        let id = link.id();
        if epoch != self.epoch || !self.active {
            log::debug!("{}: {id} belongs to a finished attempt", self.name);
            link.disconnect();
            return;
        }
        self.attempts_pending = self.attempts_pending.saturating_sub(1);
        if self.closing {
            link.disconnect();
            self.settle();
            return;
        }
        if let Flavor::Server {
            link_cap: Some(cap),
        } = self.flavor
        {
            if self.links.len() >= cap {
                log::debug!("{}: {id} rejected, already {cap} links", self.name);
                link.disconnect();
                return;
            }
        }

        link.set_handler(Arc::clone(&self.handler));
        if !link.is_alive() {
            log::debug!("{}: {id} closed before it was attached", self.name);
            self.settle();
            return;
        }
        if let Flavor::Server { .. } = self.flavor {
            link.send(Packet::control(PacketType::Ready));
            self.scheduler.link_ready(id);
        }
        self.links.insert(id, link);
        self.shared.link_count.store(self.links.len(), Ordering::SeqCst);
        log::debug!("{}: {id} attached, {} links", self.name, self.links.len());

        if !self.connected {
            self.connected = true;
            {
                let mut state = lock(&self.shared.state);
                if *state == PeerState::Connecting {
                    *state = PeerState::Connected;
                }
            }
            (self.sink)(SessionEvent::Connected(ConnectStatus::Success));
        }
    }

    fn received(&mut self, id: LinkId, packet: Packet) {
        let Some(link) = self.links.get(&id) else {
            return;
        };
        match (self.flavor, packet.kind()) {
            (_, PacketType::Data) => {
                for ready in self.reassembler.push(packet) {
                    (self.sink)(SessionEvent::Received(ready));
                }
            }
            (Flavor::Client, PacketType::IdentityRequest) => {
                let response = self
                    .identity
                    .as_ref()
                    .ok_or(Error::NotConnected)
                    .and_then(Packet::identity_response);
                match response {
                    Ok(response) => link.send(response),
                    Err(e) => {
                        log::warn!("{}: cannot answer identity request: {e}", self.name);
                        link.disconnect();
                    }
                }
            }
            (Flavor::Client, PacketType::Ready) => {
                if !self.scheduler.link_ready(id) {
                    log::debug!("{}: duplicate READY on {id}", self.name);
                }
            }
            (_, kind) => {
                log::warn!("{}: unexpected {kind:?} on {id}, dropping link", self.name);
                link.disconnect();
            }
        }
    }

    fn sent(&mut self, id: LinkId, packet: Packet, status: SendStatus) {
        if !packet.is_data() {
            if status != SendStatus::Success {
                log::debug!("{}: control packet failed on {id}: {status:?}", self.name);
            }
            return;
        }
        match self.scheduler.on_send_complete(id, packet.sequence(), status) {
            Completion::Stale => {}
            Completion::Retry => {
                log::debug!(
                    "{}: packet {} failed on {id} ({status:?}), will retry",
                    self.name,
                    packet.sequence()
                );
                (self.sink)(SessionEvent::Sent(status, packet));
            }
            Completion::Done => (self.sink)(SessionEvent::Sent(status, packet)),
        }
    }

    fn closed(&mut self, id: LinkId) {
        if self.links.remove(&id).is_none() {
            return;
        }
        let requeued = self.scheduler.link_lost(id);
        self.shared.link_count.store(self.links.len(), Ordering::SeqCst);
        log::debug!(
            "{}: {id} gone, {requeued} packets requeued, {} links left",
            self.name,
            self.links.len()
        );
        self.settle();
    }

    /// Ends the epoch once no link is up and none is still on its way.
    fn settle(&mut self) {
        if !self.active || !self.links.is_empty() || self.attempts_pending > 0 {
            return;
        }
        if self.connected {
            self.teardown();
        } else {
            log::debug!("{}: no link could be established", self.name);
            self.reset();
            (self.sink)(SessionEvent::Connected(ConnectStatus::FailSocketError));
        }
    }

    fn teardown(&mut self) {
        log::debug!(
            "{}: last link gone, discarding {} queued and {} retried packets",
            self.name,
            self.scheduler.pending_len(),
            self.scheduler.retry_len()
        );
        self.reset();
        (self.sink)(SessionEvent::Disconnected);
    }

    fn reset(&mut self) {
        self.scheduler.clear();
        self.reassembler.reset();
        self.next_sequence = 0;
        self.connected = false;
        self.closing = false;
        self.active = false;
        self.shared.link_count.store(0, Ordering::SeqCst);
        *lock(&self.shared.state) = PeerState::Idle;
        if let Flavor::Server { .. } = self.flavor {
            self.finished = true;
        }
    }

    fn pump(&mut self) {
        while let Some((id, packet)) = self.scheduler.next_assignment() {
            match self.links.get(&id) {
                Some(link) => link.send(packet),
                None => {
                    self.scheduler.link_lost(id);
                }
            }
        }
    }
}
