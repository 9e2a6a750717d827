use std::fmt;
use std::io;

/// Errors returned synchronously by the parallel socket API.
///
/// Failures of individual links never show up here; they are turned into
/// status codes and delivered through the handler callbacks.
#[derive(Debug)]
pub enum Error {
    /// A frame was shorter than the packet header or carried an unknown type.
    MalformedPacket(String),
    /// `connect` was called on a client that is not idle.
    AlreadyConnected,
    /// `start` was called on a server that is already listening.
    AlreadyStarted,
    /// The peer has no live connection epoch to send on.
    NotConnected,
    /// The options handed to `connect` or `start` cannot be used.
    InvalidOptions(&'static str),
    /// The payload does not fit in one frame; nothing was queued.
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Largest payload a frame can carry.
        max: usize,
    },
    /// An I/O error from the underlying sockets.
    Io(io::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedPacket(msg) => write!(f, "malformed packet: {msg}"),
            Error::AlreadyConnected => write!(f, "client is already connected"),
            Error::AlreadyStarted => write!(f, "server is already started"),
            Error::NotConnected => write!(f, "not connected"),
            Error::InvalidOptions(msg) => write!(f, "invalid options: {msg}"),
            Error::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds the {max} byte limit")
            }
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Outcome of a logical `connect`, delivered through `on_connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// At least one link is up.
    Success,
    /// Every link attempt failed, or the attempt was cancelled by `disconnect`.
    FailSocketError,
}

/// Completion status of a single packet send on one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The frame was fully written to the link.
    Success,
    /// The link was already down when the frame reached it.
    FailNotConnected,
    /// The frame could not be sent and must not be retried.
    FailInvalidPacket,
    /// The write failed; the link is presumed dead.
    FailSocketError,
}

impl SendStatus {
    /// Whether the link that reported this status can take another packet.
    pub fn keeps_link(self) -> bool {
        matches!(self, SendStatus::Success | SendStatus::FailInvalidPacket)
    }

    /// Whether a packet that completed with this status must be sent again.
    pub fn is_retryable(self) -> bool {
        !self.keeps_link()
    }
}

/// Outcome of `ParallelServer::start`, delivered through `on_started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// The listener is bound and accepting.
    Success,
    /// Binding or registering the listener failed.
    FailSocketError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_status_retry_classes() {
        assert!(SendStatus::Success.keeps_link());
        assert!(SendStatus::FailInvalidPacket.keeps_link());
        assert!(!SendStatus::FailInvalidPacket.is_retryable());
        assert!(SendStatus::FailSocketError.is_retryable());
        assert!(SendStatus::FailNotConnected.is_retryable());
    }

    #[test]
    fn io_errors_keep_their_source() {
        let e: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(std::error::Error::source(&e).is_some());
        assert!(e.to_string().contains("gone"));
    }
}
