//! TCP transport implementation

use super::{TransportError, TransportStats, TransportTrait, TransportType};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn default_connect_timeout() -> u64 {
    10
}

/// TCP connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub timeout_secs: u64,
}

impl TcpConfig {
    /// Create a new TCP configuration
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout_secs: default_connect_timeout(),
        }
    }

    /// Set timeout
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new("localhost", 8001)
    }
}

/// TCP transport
pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            stream: None,
            stats: TransportStats::default(),
            connected_at: None,
        }
    }
}

#[async_trait]
impl TransportTrait for TcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let limit = Duration::from_secs(self.config.timeout_secs);

        let stream = tokio::time::timeout(limit, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(limit))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;

        // Field controllers answer short lines; don't let Nagle hold them
        stream.set_nodelay(true).map_err(TransportError::IoError)?;

        self.stream = Some(stream);
        self.connected_at = Some(Instant::now());
        self.stats = TransportStats::default();

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
        }
        self.connected_at = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Disconnected)?;

        if let Err(e) = stream.write_all(data).await {
            self.stats.errors += 1;
            return Err(TransportError::IoError(e));
        }
        stream.flush().await.map_err(TransportError::IoError)?;

        self.stats.bytes_sent += data.len() as u64;
        self.stats.packets_sent += 1;

        Ok(data.len())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Disconnected)?;

        let mut buffer = vec![0u8; 4096];

        match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Ok(0)) => {
                self.stream = None;
                Err(TransportError::Disconnected)
            }
            Ok(Ok(n)) => {
                buffer.truncate(n);
                self.stats.bytes_received += n as u64;
                self.stats.packets_received += 1;
                Ok(Bytes::from(buffer))
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                Err(TransportError::IoError(e))
            }
        }
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn connection_info(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        if let Some(connected_at) = self.connected_at {
            stats.uptime_secs = connected_at.elapsed().as_secs();
        }
        stats
    }
}
