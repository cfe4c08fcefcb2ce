//! Field device protocols
//!
//! - Text-line ramp meter protocol with message ids (`natch`)
//! - Multi-drop binary PTZ camera frames (`cohu`)
//! - HTTP document exchange for SOAP cameras and alert feeds (`http`)
//! - Checksums and framing helpers shared by the drivers

pub mod checksum;
pub mod cohu;
pub mod framing;
pub mod http;
pub mod natch;

pub use checksum::{calculate as calc_checksum, ChecksumType};
pub use cohu::CohuStep;
pub use http::{HttpRequest, HttpStep, LastFetch};
pub use natch::NatchStep;
