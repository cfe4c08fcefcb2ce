//! Serial port transport implementation

use super::{TransportError, TransportStats, TransportTrait, TransportType};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            _ => Err(()),
        }
    }
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits (1, 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: SerialParity,
    /// Flow control
    #[serde(default)]
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Short line settings string, e.g. `9600 8N1`
    pub fn line_settings(&self) -> String {
        format!(
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits
        )
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyS0", 9600)
    }
}

/// Serial port transport
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<SerialStream>,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

impl SerialTransport {
    /// Create a new serial transport
    pub fn new(config: SerialConfig) -> Result<Self, TransportError> {
        if !(5..=8).contains(&config.data_bits) {
            return Err(TransportError::InvalidConfiguration(format!(
                "data bits {}",
                config.data_bits
            )));
        }
        Ok(Self {
            config,
            port: None,
            stats: TransportStats::default(),
            connected_at: None,
        })
    }
}

#[async_trait]
impl TransportTrait for SerialTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let data_bits = match self.config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match self.config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match self.config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let port = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => {
                    TransportError::PortNotFound(self.config.port.clone())
                }
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(self.config.port.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        self.port = Some(port);
        self.connected_at = Some(Instant::now());
        self.stats = TransportStats::default();

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.port = None;
        self.connected_at = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Disconnected)?;

        port.write_all(data).await.map_err(TransportError::IoError)?;
        port.flush().await.map_err(TransportError::IoError)?;

        self.stats.bytes_sent += data.len() as u64;
        self.stats.packets_sent += 1;

        Ok(data.len())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Disconnected)?;

        let mut buffer = vec![0u8; 4096];

        match tokio::time::timeout(timeout, port.read(&mut buffer)).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Ok(0)) => Err(TransportError::Disconnected),
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
        TransportType::Serial
    }

    fn connection_info(&self) -> String {
        format!(
            "{} @ {} ({})",
            self.config.port,
            self.config.line_settings(),
            match self.config.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
                SerialFlowControl::Software => "SW FC",
            }
        )
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        if let Some(connected_at) = self.connected_at {
            stats.uptime_secs = connected_at.elapsed().as_secs();
        }
        stats
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_settings() {
        let cfg = SerialConfig::new("/dev/ttyUSB0", 9600).parity(SerialParity::Even);
        assert_eq!(cfg.line_settings(), "9600 8E1");
    }

    #[test]
    fn test_parity_from_str() {
        assert_eq!("o".parse::<SerialParity>(), Ok(SerialParity::Odd));
        assert!("mark".parse::<SerialParity>().is_err());
    }

    #[test]
    fn test_rejects_bad_data_bits() {
        let cfg = SerialConfig::new("/dev/ttyUSB0", 9600).data_bits(9);
        assert!(SerialTransport::new(cfg).is_err());
    }
}
