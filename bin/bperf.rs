use clap::Parser;
use parallel_tcp::{
    Admission, ClientHandler, ClientOptions, ConnectStatus, Identity, Packet, ParallelClient,
    ParallelServer, ParallelSocket, ReceiveMode, SendStatus, ServerAcceptor, ServerOptions,
    SocketHandler,
};
use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        mpsc::{Sender, channel},
    },
    time::{Duration, Instant},
};
use tracing_subscriber::filter::EnvFilter;

enum Progress {
    Connected(ConnectStatus),
    Credit,
    Closed,
}

struct Writer(Mutex<Sender<Progress>>);

impl Writer {
    fn notify(&self, progress: Progress) {
        if let Ok(tx) = self.0.lock() {
            let _ = tx.send(progress);
        }
    }
}

impl ClientHandler for Writer {
    fn on_connected(&self, _client: &ParallelClient, status: ConnectStatus) {
        self.notify(Progress::Connected(status));
    }

    fn on_received(&self, _client: &ParallelClient, _packet: Packet) {}

    fn on_sent(&self, _client: &ParallelClient, status: SendStatus, _packet: Packet) {
        // Failed packets are retried by the library and complete again later.
        if status == SendStatus::Success || status == SendStatus::FailInvalidPacket {
            self.notify(Progress::Credit);
        }
    }

    fn on_disconnected(&self, _client: &ParallelClient) {
        self.notify(Progress::Closed);
    }
}

fn run_client_mode(args: Args) {
    let (tx, rx) = channel();
    let client = ParallelClient::new(Arc::new(Writer(Mutex::new(tx)))).unwrap();
    let (host, port) = split_addr(&args.addr);
    let options = ClientOptions::new(host, port)
        .with_link_count(args.links)
        .with_receive_mode(ReceiveMode::Burst);
    client.connect(options).unwrap();

    match rx.recv() {
        Ok(Progress::Connected(ConnectStatus::Success)) => {
            println!("Connected successfully to {} over {} links", args.addr, args.links)
        }
        _ => {
            println!("Failed to connect to {}", args.addr);
            return;
        }
    }

    let buf = vec![42u8; args.size];
    // Two packets per link keep every link busy without an unbounded queue.
    let mut credits = 2 * args.links;
    loop {
        while credits > 0 {
            if let Err(e) = client.send(&buf) {
                println!("Send failed: {e}");
                return;
            }
            credits -= 1;
        }
        match rx.recv() {
            Ok(Progress::Credit) => credits += 1,
            Ok(Progress::Connected(_)) => {}
            Ok(Progress::Closed) | Err(_) => {
                println!("Connection closed by remote peer");
                return;
            }
        }
    }
}

struct Meter {
    id: usize,
    period: Duration,
    window: Mutex<(Instant, usize)>,
}

impl SocketHandler for Meter {
    fn on_new_connection(&self, socket: &ParallelSocket) {
        println!(
            "[{}]: {} connected from {:?}, {} links announced",
            self.id,
            socket.guid(),
            socket.peer_addr(),
            socket.declared_link_count()
        );
    }

    fn on_received(&self, socket: &ParallelSocket, packet: Packet) {
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        let (start, total_recv) = &mut *window;
        *total_recv += packet.payload_len();
        let delta = start.elapsed();
        if delta >= self.period {
            let throughput =
                ((*total_recv * 8) as f32 / delta.as_secs_f32()) / (10u64.pow(6) as f32);
            println!("[{}]: {throughput} Mbps over {} links", self.id, socket.link_count());
            *start = Instant::now();
            *total_recv = 0;
        }
    }

    fn on_disconnected(&self, _socket: &ParallelSocket) {
        println!("[{}]: Socket closed by remote party...", self.id);
    }
}

struct Meters {
    next: Mutex<usize>,
    period: Duration,
}

impl ServerAcceptor for Meters {
    fn on_accept(&self, peer_addr: Option<SocketAddr>, _identity: &Identity) -> Option<Admission> {
        let mut next = self.next.lock().ok()?;
        let id = *next;
        *next += 1;
        println!("Accepted connection from: {peer_addr:?}");
        Some(Admission::new(Arc::new(Meter {
            id,
            period: self.period,
            window: Mutex::new((Instant::now(), 0)),
        })))
    }
}

fn run_server_mode(args: Args) {
    let (host, port) = split_addr(&args.addr);
    let server = ParallelServer::new();
    let acceptor = Meters {
        next: Mutex::new(0),
        period: Duration::from_secs(args.period),
    };
    server
        .start(
            ServerOptions::new(host, port).with_receive_mode(ReceiveMode::Burst),
            Arc::new(acceptor),
            None,
        )
        .unwrap();
    println!("Listening on {:?}", server.local_addr());
    loop {
        std::thread::park();
    }
}

fn split_addr(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().expect("Invalid port")),
        None => panic!("Expected <ip:port>, got {addr}"),
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

fn main() {
    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    if args.client {
        run_client_mode(args);
    } else {
        run_server_mode(args);
    }
}

/// The throughput benchmark for parallel TCP; `--links 1` gives the single
/// stream baseline.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Set the client mode for the application
    #[arg(short, long)]
    client: bool,
    /// The address <ip:port> to listen or connect, depending on the mode.
    #[arg(short, long)]
    addr: String,
    /// The message size
    #[arg(short, long)]
    size: usize,
    /// The number of links the client opens
    #[arg(short, long, default_value = "4")]
    links: usize,
    /// The sampling period in seconds
    #[arg(short, long, default_value = "1")]
    period: u64,
}
