// Error types for network operations

use crate::drivers::ChipError;
use alloc::string::String;
use isonet_config::ConfigError;
use thiserror::Error;

/// Network-related errors
///
/// Every condition here is recoverable and reported as a value. Write
/// failures carry the number of bytes that reached the chip before the
/// failure so callers never have to decode a count from an error code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("No free socket")]
    NoFreeSocket,

    #[error("Interface not ready")]
    NotReady,

    #[error("Socket not bound")]
    NotBound,

    #[error("Socket open failed: {0}")]
    SocketOpen(ChipError),

    #[error("Connect failed")]
    ConnectFailed,

    #[error("Write timed out after {sent} bytes")]
    WriteTimeout { sent: usize },

    #[error("Write aborted after {sent} bytes: {error}")]
    PartialWrite { sent: usize, error: ChipError },

    #[error("Receive failed: {0}")]
    Receive(ChipError),

    #[error("Send failed: {0}")]
    Send(ChipError),

    #[error("Chip initialization failed: {0}")]
    ChipInit(ChipError),

    #[error("DNS error: {0}")]
    DnsFailure(String),

    #[error("DNS timeout")]
    DnsTimeout,

    #[error("DNS malformed response: {0}")]
    DnsMalformedResponse(String),

    #[error("DNS name not found")]
    DnsNameNotFound,

    #[error("DNS server failure")]
    DnsServerFailure,

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl embedded_io::Error for NetError {
    fn kind(&self) -> embedded_io::ErrorKind {
        use embedded_io::ErrorKind;
        match self {
            NetError::NotReady | NetError::NotBound => ErrorKind::NotConnected,
            NetError::ConnectFailed => ErrorKind::ConnectionRefused,
            NetError::WriteTimeout { .. } | NetError::DnsTimeout => ErrorKind::TimedOut,
            NetError::DnsMalformedResponse(_) => ErrorKind::InvalidData,
            _ => ErrorKind::Other,
        }
    }
}
