use clap::Parser;
use parallel_tcp::{ClientHandler, ClientOptions, ConnectStatus, Packet, ParallelClient};
use std::{
    sync::{Arc, Mutex, mpsc::{Sender, channel}},
    time::Duration,
};
use tracing_subscriber::filter::EnvFilter;

struct Printer(Mutex<Sender<Option<ConnectStatus>>>);

impl ClientHandler for Printer {
    fn on_connected(&self, _client: &ParallelClient, status: ConnectStatus) {
        if let Ok(tx) = self.0.lock() {
            let _ = tx.send(Some(status));
        }
    }

    fn on_received(&self, _client: &ParallelClient, packet: Packet) {
        println!("Echo #{}: {}", packet.sequence(), String::from_utf8_lossy(packet.payload()));
    }

    fn on_disconnected(&self, _client: &ParallelClient) {
        if let Ok(tx) = self.0.lock() {
            let _ = tx.send(None);
        }
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
    let (tx, rx) = channel();
    let client = ParallelClient::new(Arc::new(Printer(Mutex::new(tx))))?;
    client.connect(ClientOptions::new(args.host.clone(), args.port).with_link_count(args.links))?;

    if rx.recv() != Ok(Some(ConnectStatus::Success)) {
        println!("Could not connect to {}:{}", args.host, args.port);
        return Ok(());
    }
    println!(
        "Connected to {}:{} as {:?} with {} links",
        args.host,
        args.port,
        client.guid(),
        client.current_link_count()
    );

    for i in 0..args.count {
        client.send(format!("msg-{i}").as_bytes())?;
        std::thread::sleep(Duration::from_millis(args.period));
    }
    std::thread::sleep(Duration::from_millis(500));
    client.disconnect();
    let _ = rx.recv_timeout(Duration::from_secs(5));
    Ok(())
}

/// A simple client sending numbered messages to the echo server.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// The server port
    #[arg(short, long, default_value = "7890")]
    port: u16,
    /// The number of links to open
    #[arg(short, long, default_value = "3")]
    links: usize,
    /// The number of messages to send
    #[arg(short, long, default_value = "10")]
    count: usize,
    /// Pause between messages in milli-sec
    #[arg(long, default_value = "100")]
    period: u64,
}
