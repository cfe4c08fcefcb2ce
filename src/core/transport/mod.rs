//! Transport layer for communication links
//!
//! Supports:
//! - Raw TCP connections (terminal servers, Ethernet field controllers)
//! - Serial ports (RS-232, RS-485 multi-drop lines)
//!
//! A transport is exclusively owned by one link worker. Reads are always
//! bounded by a timeout so the worker never blocks indefinitely.

mod serial;
mod tcp;

pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialParity, SerialTransport};
pub use tcp::{TcpConfig, TcpTransport};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    /// Raw TCP connection
    Tcp(TcpConfig),
    /// Serial port connection
    Serial(SerialConfig),
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// Raw TCP
    Tcp,
    /// Serial port
    Serial,
    /// Scripted virtual device
    Simulated,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Serial => write!(f, "Serial"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Nothing received before the deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Disconnected
    #[error("Disconnected")]
    Disconnected,
}

impl TransportError {
    /// Check if the error leaves the connection unusable
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout(_))
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Packets sent
    pub packets_sent: u64,
    /// Packets received
    pub packets_received: u64,
    /// Errors count
    pub errors: u64,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// Transport trait for all connection types
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportTrait: Send + Sync {
    /// Connect to the target
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Disconnect from the target
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Send data
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Receive whatever arrives first, waiting at most `timeout`.
    ///
    /// Returns [`TransportError::Timeout`] when nothing arrived in time.
    async fn receive(&mut self, timeout: Duration) -> Result<Bytes, TransportError>;

    /// Discard any buffered input
    async fn drain(&mut self) -> Result<(), TransportError> {
        loop {
            match self.receive(Duration::from_millis(1)).await {
                Ok(bytes) if !bytes.is_empty() => continue,
                Ok(_) | Err(TransportError::Timeout(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Get transport type
    fn transport_type(&self) -> TransportType;

    /// Get connection info string
    fn connection_info(&self) -> String;

    /// Get statistics
    fn stats(&self) -> TransportStats;
}

/// Create a transport instance from configuration
pub fn create_transport(config: Transport) -> Result<Box<dyn TransportTrait>, TransportError> {
    match config {
        Transport::Tcp(cfg) => Ok(Box::new(TcpTransport::new(cfg))),
        Transport::Serial(cfg) => Ok(Box::new(SerialTransport::new(cfg)?)),
    }
}
