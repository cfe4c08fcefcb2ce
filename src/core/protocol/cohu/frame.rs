//! Multi-drop binary frames
//!
//! `[0xF8][drop][payload...][checksum]` with a 2 or 3 byte payload. The
//! checksum is the folded XOR of the drop address and the payload.

use super::quantize::{self, Motion};
use crate::core::comm::CommError;
use crate::core::protocol::checksum::folded_xor;
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Frame header byte
pub const HEADER: u8 = 0xF8;

/// Shortest valid frame
pub const MIN_FRAME: usize = 5;
/// Longest valid frame
pub const MAX_FRAME: usize = 6;

/// Validated multi-drop address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DropAddress(u8);

impl DropAddress {
    /// Lowest valid address
    pub const MIN: u16 = 1;
    /// Highest valid address
    pub const MAX: u16 = 223;

    /// Validate an address
    pub fn new(drop: u16) -> Result<Self, CommError> {
        if (Self::MIN..=Self::MAX).contains(&drop) {
            Ok(Self(drop as u8))
        } else {
            Err(CommError::config(format!(
                "drop address {} outside {}..={}",
                drop,
                Self::MIN,
                Self::MAX
            )))
        }
    }

    /// Raw address byte
    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DropAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Camera command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Pan left at a speed byte
    PanLeft(u8),
    /// Pan right at a speed byte
    PanRight(u8),
    /// Stop panning
    PanStop,
    /// Tilt up at a speed byte
    TiltUp(u8),
    /// Tilt down at a speed byte
    TiltDown(u8),
    /// Stop tilting
    TiltStop,
    /// Zoom in at a speed byte
    ZoomIn(u8),
    /// Zoom out at a speed byte
    ZoomOut(u8),
    /// Stop zooming
    ZoomStop,
    /// Move to a stored preset
    RecallPreset(u8),
    /// Store the current position as a preset
    StorePreset(u8),
}

impl Command {
    /// Pan command for a value in `[-1, 1]`
    pub fn pan(value: f32) -> Self {
        match quantize::pan_tilt(value) {
            Motion::Stop => Self::PanStop,
            Motion::Negative(speed) => Self::PanLeft(speed),
            Motion::Positive(speed) => Self::PanRight(speed),
        }
    }

    /// Tilt command for a value in `[-1, 1]`
    pub fn tilt(value: f32) -> Self {
        match quantize::pan_tilt(value) {
            Motion::Stop => Self::TiltStop,
            Motion::Negative(speed) => Self::TiltDown(speed),
            Motion::Positive(speed) => Self::TiltUp(speed),
        }
    }

    /// Zoom command for a value in `[-1, 1]`
    pub fn zoom(value: f32) -> Self {
        match quantize::zoom(value) {
            Motion::Stop => Self::ZoomStop,
            Motion::Negative(speed) => Self::ZoomOut(speed),
            Motion::Positive(speed) => Self::ZoomIn(speed),
        }
    }

    /// Payload bytes
    pub fn payload(&self) -> Vec<u8> {
        match *self {
            Self::PanLeft(speed) => vec![b'l', speed],
            Self::PanRight(speed) => vec![b'r', speed],
            Self::PanStop => vec![b'P', b'S'],
            Self::TiltUp(speed) => vec![b'u', speed],
            Self::TiltDown(speed) => vec![b'd', speed],
            Self::TiltStop => vec![b'T', b'S'],
            Self::ZoomIn(speed) => vec![b'c', b'I', speed],
            Self::ZoomOut(speed) => vec![b'c', b'O', speed],
            Self::ZoomStop => vec![b'Z', b'S'],
            Self::RecallPreset(preset) => vec![b'H', quantize::preset_byte(u16::from(preset))],
            Self::StorePreset(preset) => vec![b'h', quantize::preset_byte(u16::from(preset))],
        }
    }

    /// Get name of command
    pub fn name(&self) -> &'static str {
        match self {
            Self::PanLeft(_) => "PAN LEFT",
            Self::PanRight(_) => "PAN RIGHT",
            Self::PanStop => "PAN STOP",
            Self::TiltUp(_) => "TILT UP",
            Self::TiltDown(_) => "TILT DOWN",
            Self::TiltStop => "TILT STOP",
            Self::ZoomIn(_) => "ZOOM IN",
            Self::ZoomOut(_) => "ZOOM OUT",
            Self::ZoomStop => "ZOOM STOP",
            Self::RecallPreset(_) => "RECALL PRESET",
            Self::StorePreset(_) => "STORE PRESET",
        }
    }
}

/// Checksum over the drop address and payload
pub fn checksum(drop: DropAddress, payload: &[u8]) -> u8 {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(drop.value());
    data.extend_from_slice(payload);
    folded_xor(&data)
}

/// Append a complete frame to `buf`
pub fn encode(drop: DropAddress, command: &Command, buf: &mut BytesMut) {
    let payload = command.payload();
    buf.put_u8(HEADER);
    buf.put_u8(drop.value());
    buf.put_slice(&payload);
    buf.put_u8(checksum(drop, &payload));
}

/// A frame that passed verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Drop address
    pub drop: DropAddress,
    /// Payload bytes
    pub payload: &'a [u8],
}

/// Check header, length, drop range and checksum of a frame
pub fn verify_frame(frame: &[u8]) -> Result<Frame<'_>, CommError> {
    if !(MIN_FRAME..=MAX_FRAME).contains(&frame.len()) {
        return Err(CommError::protocol(format!("frame length {}", frame.len())));
    }
    if frame[0] != HEADER {
        return Err(CommError::protocol(format!("frame header {:02X}", frame[0])));
    }
    let drop = DropAddress::new(u16::from(frame[1]))
        .map_err(|_| CommError::protocol(format!("drop address {}", frame[1])))?;
    let payload = &frame[2..frame.len() - 1];
    let sent = frame[frame.len() - 1];
    let expected = checksum(drop, payload);
    if sent != expected {
        return Err(CommError::Checksum(format!(
            "{:02X} != {:02X}",
            sent, expected
        )));
    }
    Ok(Frame { drop, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comm::ErrorClass;

    #[test]
    fn test_drop_range() {
        assert!(DropAddress::new(0).is_err());
        assert!(DropAddress::new(224).is_err());
        assert_eq!(DropAddress::new(223).unwrap().value(), 223);
        assert_eq!(
            DropAddress::new(0).unwrap_err().class(),
            ErrorClass::Configuration
        );
    }

    #[test]
    fn test_encode_pan_stop() {
        let drop = DropAddress::new(5).unwrap();
        let mut buf = BytesMut::new();
        encode(drop, &Command::PanStop, &mut buf);
        assert_eq!(&buf[..], &[0xF8, 0x05, b'P', b'S', 0x86]);
    }

    #[test]
    fn test_zoom_frame_is_six_bytes() {
        let drop = DropAddress::new(1).unwrap();
        let mut buf = BytesMut::new();
        encode(drop, &Command::zoom(1.0), &mut buf);
        assert_eq!(buf.len(), 6);
        assert_eq!(&buf[2..5], &[b'c', b'I', 0x32]);
        verify_frame(&buf).unwrap();
    }

    #[test]
    fn test_checksum_high_bit_for_all_drops() {
        for d in DropAddress::MIN..=DropAddress::MAX {
            let drop = DropAddress::new(d).unwrap();
            let mut buf = BytesMut::new();
            encode(drop, &Command::pan(-0.6), &mut buf);
            let c = buf[buf.len() - 1];
            assert!((0x80..=0x8F).contains(&c));
            assert_eq!(verify_frame(&buf).unwrap().drop, drop);
        }
    }

    #[test]
    fn test_verify_rejects_bad_checksum() {
        let err = verify_frame(&[0xF8, 0x05, b'P', b'S', 0x87]).unwrap_err();
        assert!(matches!(err, CommError::Checksum(_)));
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert!(verify_frame(&[0xF7, 0x05, b'P', b'S', 0x86]).is_err());
        assert!(verify_frame(&[0xF8, 0x00, b'P', b'S', 0x80 | (b'P' ^ b'S') & 0x0F]).is_err());
    }
}
