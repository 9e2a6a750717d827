//! # Parallel TCP - one logical connection over many TCP links
//!
//! Parallel TCP opens N independent TCP connections ("links") between a
//! client and a server and presents them to the application as a single
//! logical connection. Messages are spread over whichever links are free, so
//! the aggregate throughput is not bounded by one stream's window, and a
//! message caught on a link that fails is sent again on another one.
//!
//! ## Key Features
//!
//! - **Link matching**: every link of a client presents the same GUID, so the
//!   server groups them into one [`ParallelSocket`] no matter in which order
//!   they arrive
//! - **Idle-link scheduling**: each link carries one message at a time; the
//!   next message goes to the first link that finished its previous send
//! - **Retries**: messages whose send failed are resent, ahead of new ones, on
//!   the next idle link
//! - **Ordered delivery**: in [`ReceiveMode::Sequential`] messages reach the
//!   application in the order they were sent, whatever link they came on
//! - **Rooms and broadcast**: servers can address every client, or named
//!   groups of them
//!
//! ## Protocol
//!
//! Every packet is `[sequence: i64][type: i32][payload]`, little-endian, and
//! every link prefixes each packet with its `u32` length. A new link is asked
//! for its identity, answers with its GUID and the number of links its
//! client opens, and is released for data once the server sends READY:
//!
//! ```text
//! server                       client
//!   | ---- IDENTITY_REQUEST ---> |
//!   | <--- IDENTITY_RESPONSE --- |   guid, link count
//!   | ---- READY --------------> |
//!   | <--- DATA ---------------> |
//! ```
//!
//! ## Basic Usage
//!
//! ### Server Side
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use parallel_tcp::{
//!     Admission, Identity, Packet, ParallelServer, ParallelSocket, ServerAcceptor,
//!     ServerOptions, SocketHandler,
//! };
//!
//! struct Echo;
//!
//! impl SocketHandler for Echo {
//!     fn on_received(&self, socket: &ParallelSocket, packet: Packet) {
//!         let _ = socket.send(packet.payload());
//!     }
//! }
//!
//! struct AcceptAll;
//!
//! impl ServerAcceptor for AcceptAll {
//!     fn on_accept(&self, _peer: Option<SocketAddr>, _id: &Identity) -> Option<Admission> {
//!         Some(Admission::new(Arc::new(Echo)))
//!     }
//! }
//!
//! let server = ParallelServer::new();
//! server.start(ServerOptions::new("127.0.0.1", 8080), Arc::new(AcceptAll), None)?;
//! # Ok::<(), parallel_tcp::Error>(())
//! ```
//!
//! ### Client Side
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parallel_tcp::{ClientHandler, ClientOptions, ConnectStatus, Packet, ParallelClient};
//!
//! struct Hello;
//!
//! impl ClientHandler for Hello {
//!     fn on_connected(&self, client: &ParallelClient, status: ConnectStatus) {
//!         if status == ConnectStatus::Success {
//!             let _ = client.send(b"hello");
//!         }
//!     }
//!
//!     fn on_received(&self, _client: &ParallelClient, packet: Packet) {
//!         println!("echo: {}", String::from_utf8_lossy(packet.payload()));
//!     }
//! }
//!
//! let client = ParallelClient::new(Arc::new(Hello))?;
//! client.connect(ClientOptions::new("127.0.0.1", 8080).with_link_count(4))?;
//! # Ok::<(), parallel_tcp::Error>(())
//! ```
//!
//! ## Threads
//!
//! Each logical peer runs one thread that owns its links' state, plus one
//! thread on which its handler is called; each link has a reader and a
//! writer thread. Handlers may block without stalling link I/O, but a slow
//! handler does delay the following events of the same peer.
//!
//! ## Performance Considerations
//!
//! - More links help when a single stream is window or congestion bound;
//!   on a fast local network a handful is usually enough
//! - Every message is a packet; batching small writes into larger messages
//!   reduces per-packet overhead

#![warn(missing_docs)]

use std::sync::{Mutex, MutexGuard, PoisonError};

mod client;
mod conf;
mod dispatch;
mod error;
mod link;
mod packet;
mod reassembler;
mod room;
mod scheduler;
mod server;
mod session;
mod socket;

pub use client::{ClientHandler, ParallelClient};
pub use conf::*;
pub use error::{ConnectStatus, Error, Result, SendStatus, StartStatus};
pub use link::{Link, LinkHandler, LinkId, LinkRef, TcpLink};
pub use packet::{
    CONTROL_SEQUENCE, HEADER_LEN, IDENTITY_LEN, Identity, Packet, PacketType, decode, encode,
    next_sequence,
};
pub use reassembler::{ReceiveMode, Reassembler};
pub use room::{Room, RoomHandler};
pub use scheduler::{Completion, SendScheduler};
pub use server::{Admission, ParallelServer, ServerAcceptor, ServerHandler};
pub use session::PeerState;
pub use socket::{ParallelSocket, SocketHandler};

/// Locks `mutex`, taking over the guard of a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
