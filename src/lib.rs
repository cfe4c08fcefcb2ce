//! # Fieldpoll Core Library
//!
//! Communication core for roadside field devices:
//! - One worker task per communication link, owning its transport
//! - Prioritized, multi-step device transactions with bounded retries
//! - Text-line ramp meter protocol with message id correlation
//! - Multi-drop binary PTZ camera protocol with folded XOR checksums
//! - HTTP document exchange for SOAP cameras and alert feeds
//!
//! ## Example
//!
//! ```rust,no_run
//! use fieldpoll_core::config::AppConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let dispatcher = config.start(256)?;
//!
//!     let completion = dispatcher.set_release_rate("M35W01", 900)?;
//!     println!("{:?}", completion.wait().await.state);
//!
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::core::comm::{
    CommEvent, CommError, Completion, Device, DeviceKind, DeviceUpdate, Dispatcher,
    OperationResult, OperationState, PriorityClass,
};
pub use crate::core::transport::{Transport, TransportError, TransportTrait};
