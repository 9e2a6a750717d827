use clap::Parser;
use parallel_tcp::{
    Admission, Identity, Packet, ParallelServer, ParallelSocket, ReceiveMode, ServerAcceptor,
    ServerHandler, ServerOptions, SocketHandler, StartStatus,
};
use std::{net::SocketAddr, sync::Arc};
use tracing_subscriber::filter::EnvFilter;

struct Echo;

impl SocketHandler for Echo {
    fn on_new_connection(&self, socket: &ParallelSocket) {
        println!("{} connected with {} links", socket.guid(), socket.link_count());
        let _ = socket.join("hello");
    }

    fn on_received(&self, socket: &ParallelSocket, packet: Packet) {
        println!(
            "[{}] #{}: {}",
            socket.guid(),
            packet.sequence(),
            String::from_utf8_lossy(packet.payload())
        );
        let _ = socket.send(packet.payload());
    }

    fn on_disconnected(&self, socket: &ParallelSocket) {
        println!("{} disconnected", socket.guid());
    }
}

struct AcceptAll;

impl ServerAcceptor for AcceptAll {
    fn on_accept(&self, peer_addr: Option<SocketAddr>, identity: &Identity) -> Option<Admission> {
        println!(
            "Accepting {} from {peer_addr:?}, {} links announced",
            identity.guid, identity.link_count
        );
        Some(Admission::new(Arc::new(Echo)))
    }
}

struct Lifecycle;

impl ServerHandler for Lifecycle {
    fn on_started(&self, status: StartStatus) {
        println!("Server started: {status:?}");
    }
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> parallel_tcp::Result<()> {
    // Initialize log bridge to capture log crate messages - MUST be first!
    tracing_log::LogTracer::init().expect("Failed to set logger");

    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    println!("Starting echo server on {}:{}", args.host, args.port);
    let server = ParallelServer::new();
    server.start(
        ServerOptions::new(args.host, args.port).with_receive_mode(ReceiveMode::Sequential),
        Arc::new(AcceptAll),
        Some(Arc::new(Lifecycle)),
    )?;
    loop {
        std::thread::park();
    }
}

/// A simple echo server over parallel TCP.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// The port to listen on
    #[arg(short, long, default_value = "7890")]
    port: u16,
}
