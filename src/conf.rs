//! Defaults and option structs for clients and servers.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::packet::HEADER_LEN;
use crate::reassembler::ReceiveMode;

/// Host used when none is given.
pub const DEFAULT_HOSTNAME: &str = "localhost";
/// Port used when none is given.
pub const DEFAULT_PORT: u16 = 8080;
/// Number of links a client opens when none is given.
pub const DEFAULT_LINK_COUNT: usize = 20;
/// Largest frame a link accepts, header included.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
/// Largest payload `send` accepts.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// Options for `ParallelClient::connect`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Number of links to open.
    pub link_count: usize,
    /// How inbound data packets are handed to the application.
    pub receive_mode: ReceiveMode,
    /// Per link connect timeout; `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Sets `TCP_NODELAY` on every link.
    pub no_delay: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            host: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            link_count: DEFAULT_LINK_COUNT,
            receive_mode: ReceiveMode::Sequential,
            connect_timeout: None,
            no_delay: true,
        }
    }
}

impl ClientOptions {
    /// Options for `host:port` with every other field defaulted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientOptions {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets the number of links to open.
    pub fn with_link_count(mut self, link_count: usize) -> Self {
        self.link_count = link_count;
        self
    }

    /// Sets the receive mode.
    pub fn with_receive_mode(mut self, receive_mode: ReceiveMode) -> Self {
        self.receive_mode = receive_mode;
        self
    }

    /// Sets the per link connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets `TCP_NODELAY` on links.
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Rejects options no connection could be made with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidOptions("host must not be empty"));
        }
        if self.link_count == 0 {
            return Err(Error::InvalidOptions("link_count must be at least 1"));
        }
        if self.link_count > i32::MAX as usize {
            return Err(Error::InvalidOptions("link_count does not fit the identity handshake"));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidOptions("connect_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Options for `ParallelServer::start`.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind, `0.0.0.0` by default.
    pub host: String,
    /// Port to bind; 0 lets the OS pick one.
    pub port: u16,
    /// How inbound data packets are handed to the application.
    pub receive_mode: ReceiveMode,
    /// Maximum number of logical sockets; `None` is unbounded.
    pub max_sockets: Option<usize>,
    /// Maximum number of links per logical socket; `None` is unbounded.
    pub link_cap: Option<usize>,
    /// Sets `TCP_NODELAY` on every accepted link.
    pub no_delay: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            receive_mode: ReceiveMode::Sequential,
            max_sockets: None,
            link_cap: None,
            no_delay: true,
        }
    }
}

impl ServerOptions {
    /// Options binding `host:port` with every other field defaulted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerOptions {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets the receive mode.
    pub fn with_receive_mode(mut self, receive_mode: ReceiveMode) -> Self {
        self.receive_mode = receive_mode;
        self
    }

    /// Caps the number of logical sockets.
    pub fn with_max_sockets(mut self, max_sockets: usize) -> Self {
        self.max_sockets = Some(max_sockets);
        self
    }

    /// Caps the number of links per logical socket.
    pub fn with_link_cap(mut self, link_cap: usize) -> Self {
        self.link_cap = Some(link_cap);
        self
    }

    /// Sets `TCP_NODELAY` on links.
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Rejects options no listener could be started with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidOptions("host must not be empty"));
        }
        if self.link_cap == Some(0) {
            return Err(Error::InvalidOptions("link_cap must be at least 1"));
        }
        if self.max_sockets == Some(0) {
            return Err(Error::InvalidOptions("max_sockets must be at least 1"));
        }
        Ok(())
    }
}
