//! Text-line message codec
//!
//! Every message is one line: `CODE,ID[,field...]\n`. Requests use the
//! upper-case code, replies the lower-case one, and the id echoes the
//! request. A query carries only the key fields; a store and every reply
//! carry all of them.

use crate::core::comm::{CommError, DeviceUpdate, MessageId};
use crate::core::protocol::framing;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamp pattern on the wire
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Request direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read the current value
    Query,
    /// Write a new value
    Store,
}

impl Access {
    /// Get name of access mode
    pub fn name(&self) -> &'static str {
        match self {
            Self::Query => "QUERY",
            Self::Store => "STORE",
        }
    }
}

/// Parse an integer field, `None` if malformed
pub fn parse_num<T: std::str::FromStr>(field: &str) -> Option<T> {
    field.trim().parse().ok()
}

/// Parse a boolean field (`1`/`0`), `None` if malformed
pub fn parse_bool(field: &str) -> Option<bool> {
    match field.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

/// Parse a timestamp field, epoch zero if malformed
pub fn parse_time(field: &str) -> DateTime<Utc> {
    let field = field.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(field) {
        return t.with_timezone(&Utc);
    }
    NaiveDateTime::parse_from_str(field, TIME_FORMAT)
        .map(|t| t.and_utc())
        .unwrap_or_default()
}

/// Format a timestamp field
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// A received line split into code, id and fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine<'a> {
    /// Message code, case preserved
    pub code: &'a str,
    /// Message id field, unparsed
    pub id: &'a str,
    /// Remaining fields
    pub fields: Vec<&'a str>,
}

impl<'a> RawLine<'a> {
    /// Split a line; `None` if it lacks a code or id
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut parts = line.trim().split(',');
        let code = parts.next().filter(|c| !c.is_empty())?;
        let id = parts.next()?;
        Some(Self {
            code,
            id,
            fields: parts.collect(),
        })
    }

    /// Check if the line was originated by the device rather than
    /// answering one of our requests
    pub fn is_device_originated(&self) -> bool {
        self.code.chars().all(|c| c.is_ascii_uppercase())
    }

    /// Parse the id field
    pub fn message_id(&self) -> Option<MessageId> {
        self.id.parse().ok()
    }
}

/// One request/response unit
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    /// Controller clock
    Clock {
        /// Clock value
        time: Option<DateTime<Utc>>,
    },
    /// Firmware version (query only)
    Firmware {
        /// Version string
        version: Option<String>,
    },
    /// Detector slot to input pin mapping
    DetectorConfig {
        /// Detector slot
        slot: u8,
        /// Input pin
        pin: Option<u8>,
    },
    /// Meter output configuration
    MeterConfig {
        /// Meter number
        meter: u8,
        /// Red output pin
        red_pin: Option<u8>,
        /// Beacon output pin (0 for none)
        beacon_pin: Option<u8>,
        /// Maximum release rate
        max_rate: Option<u32>,
    },
    /// Meter release rate
    MeterStatus {
        /// Meter number
        meter: u8,
        /// Release rate (vehicles per hour)
        rate: Option<u32>,
    },
    /// Output pin state
    PinStatus {
        /// Output pin
        pin: u8,
        /// Pin energized
        on: Option<bool>,
    },
    /// Watchdog reset
    Watchdog,
}

impl Property {
    /// Upper-case request code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Clock { .. } => "CS",
            Self::Firmware { .. } => "FV",
            Self::DetectorConfig { .. } => "DC",
            Self::MeterConfig { .. } => "MC",
            Self::MeterStatus { .. } => "MS",
            Self::PinStatus { .. } => "PS",
            Self::Watchdog => "WD",
        }
    }

    /// Lower-case reply code
    pub fn reply_code(&self) -> String {
        self.code().to_ascii_lowercase()
    }

    /// Key fields, sent with a query
    fn key_fields(&self) -> Vec<String> {
        match self {
            Self::Clock { .. } | Self::Firmware { .. } | Self::Watchdog => Vec::new(),
            Self::DetectorConfig { slot, .. } => vec![slot.to_string()],
            Self::MeterConfig { meter, .. } | Self::MeterStatus { meter, .. } => {
                vec![meter.to_string()]
            }
            Self::PinStatus { pin, .. } => vec![pin.to_string()],
        }
    }

    /// All fields, sent with a store
    fn all_fields(&self) -> Vec<String> {
        match self {
            Self::Clock { time } => vec![time.as_ref().map(format_time).unwrap_or_default()],
            Self::Firmware { version } => vec![opt(version)],
            Self::DetectorConfig { slot, pin } => vec![slot.to_string(), opt(pin)],
            Self::MeterConfig {
                meter,
                red_pin,
                beacon_pin,
                max_rate,
            } => vec![
                meter.to_string(),
                opt(red_pin),
                opt(beacon_pin),
                opt(max_rate),
            ],
            Self::MeterStatus { meter, rate } => vec![meter.to_string(), opt(rate)],
            Self::PinStatus { pin, on } => vec![
                pin.to_string(),
                on.map(|b| if b { "1" } else { "0" }.to_string())
                    .unwrap_or_default(),
            ],
            Self::Watchdog => Vec::new(),
        }
    }

    /// Number of fields after code and id in a reply
    pub fn arity(&self) -> usize {
        match self {
            Self::Clock { .. } | Self::Firmware { .. } => 1,
            Self::DetectorConfig { .. } | Self::MeterStatus { .. } | Self::PinStatus { .. } => 2,
            Self::MeterConfig { .. } => 4,
            Self::Watchdog => 0,
        }
    }

    /// Encode a request line
    pub fn encode(&self, access: Access, id: MessageId, buf: &mut BytesMut) {
        let fields = match access {
            Access::Query => self.key_fields(),
            Access::Store => self.all_fields(),
        };
        let head = [self.code().to_string(), id.to_string()];
        framing::encode_line(buf, head.into_iter().chain(fields));
    }

    /// Decode reply fields (after code and id).
    ///
    /// A key mismatch means the reply belongs to another request and is
    /// reported as not received. Malformed value fields degrade to `None`.
    pub fn decode(&mut self, access: Access, fields: &[&str]) -> Result<(), CommError> {
        if fields.len() != self.arity() {
            return Err(CommError::protocol(format!(
                "{}: expected {} fields, got {}",
                self.reply_code(),
                self.arity(),
                fields.len()
            )));
        }
        match self {
            Self::Clock { time } => {
                if access == Access::Query {
                    *time = Some(parse_time(fields[0]));
                }
            }
            Self::Firmware { version } => {
                *version = Some(fields[0].trim().to_string());
            }
            Self::DetectorConfig { slot, pin } => {
                expect_key("slot", *slot, fields[0])?;
                let got = parse_num::<u8>(fields[1]);
                match access {
                    Access::Query => *pin = got,
                    Access::Store => {
                        if got != *pin {
                            return Err(CommError::not_received(format!(
                                "pin {} != {}",
                                fields[1],
                                opt(pin)
                            )));
                        }
                    }
                }
            }
            Self::MeterConfig {
                meter,
                red_pin,
                beacon_pin,
                max_rate,
            } => {
                expect_key("meter", *meter, fields[0])?;
                if access == Access::Query {
                    *red_pin = parse_num(fields[1]);
                    *beacon_pin = parse_num(fields[2]);
                    *max_rate = parse_num(fields[3]);
                }
            }
            Self::MeterStatus { meter, rate } => {
                expect_key("meter", *meter, fields[0])?;
                if access == Access::Query {
                    *rate = parse_num(fields[1]);
                }
            }
            Self::PinStatus { pin, on } => {
                expect_key("pin", *pin, fields[0])?;
                if access == Access::Query {
                    *on = parse_bool(fields[1]);
                }
            }
            Self::Watchdog => {}
        }
        Ok(())
    }

    /// Device updates carried by a decoded property
    pub fn updates(&self) -> Vec<DeviceUpdate> {
        match self {
            Self::Clock { time } => time.map(DeviceUpdate::Clock).into_iter().collect(),
            Self::Firmware { version } => version
                .clone()
                .map(DeviceUpdate::Firmware)
                .into_iter()
                .collect(),
            Self::DetectorConfig { slot, pin } => pin
                .map(|pin| DeviceUpdate::DetectorPin { slot: *slot, pin })
                .into_iter()
                .collect(),
            Self::MeterConfig { red_pin, .. } => red_pin
                .map(|red_pin| DeviceUpdate::MeterConfigured { red_pin })
                .into_iter()
                .collect(),
            Self::MeterStatus { rate, .. } => {
                rate.map(DeviceUpdate::ReleaseRate).into_iter().collect()
            }
            Self::PinStatus { on, .. } => on.map(DeviceUpdate::Beacon).into_iter().collect(),
            Self::Watchdog => Vec::new(),
        }
    }
}

fn expect_key<T>(name: &str, want: T, field: &str) -> Result<(), CommError>
where
    T: std::str::FromStr + PartialEq + std::fmt::Display,
{
    match parse_num::<T>(field) {
        Some(got) if got == want => Ok(()),
        _ => Err(CommError::not_received(format!(
            "{} {} != {}",
            name, field, want
        ))),
    }
}

/// Vehicle detection event sent by the controller
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorStatus {
    /// Sender-assigned message id
    pub id: MessageId,
    /// Decoded event
    pub event: crate::core::comm::VehicleEvent,
}

impl DetectorStatus {
    /// Device-originated code
    pub const CODE: &'static str = "DS";

    /// Fields after code and id
    pub const ARITY: usize = 6;

    /// Decode a `DS` line
    pub fn parse(line: &RawLine<'_>) -> Result<Self, CommError> {
        if line.code != Self::CODE {
            return Err(CommError::protocol(format!("unexpected code {}", line.code)));
        }
        let id = line
            .message_id()
            .ok_or_else(|| CommError::protocol(format!("bad id {}", line.id)))?;
        if line.fields.len() != Self::ARITY {
            return Err(CommError::protocol(format!(
                "ds: expected {} fields, got {}",
                Self::ARITY,
                line.fields.len()
            )));
        }
        let f = &line.fields;
        let slot = parse_num(f[0]).ok_or_else(|| CommError::protocol("ds: bad slot"))?;
        Ok(Self {
            id,
            event: crate::core::comm::VehicleEvent {
                slot,
                duration_ms: parse_num(f[1]),
                headway_ms: parse_num(f[2]),
                time: parse_time(f[3]),
                speed: parse_num(f[4]),
                length: parse_num(f[5]),
            },
        })
    }

    /// Encode the acknowledgement for a received event
    pub fn encode_ack(id: MessageId, buf: &mut BytesMut) {
        framing::encode_line(buf, ["ds".to_string(), id.to_string()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn encoded(p: &Property, access: Access, id: u16) -> String {
        let mut buf = BytesMut::new();
        p.encode(access, MessageId(id), &mut buf);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_query_sends_key_fields_only() {
        let p = Property::MeterStatus {
            meter: 1,
            rate: None,
        };
        assert_eq!(encoded(&p, Access::Query, 0x1F), "MS,001F,1\n");
        let p = Property::Watchdog;
        assert_eq!(encoded(&p, Access::Query, 2), "WD,0002\n");
    }

    #[test]
    fn test_store_sends_all_fields() {
        let p = Property::MeterConfig {
            meter: 0,
            red_pin: Some(3),
            beacon_pin: Some(0),
            max_rate: Some(1714),
        };
        assert_eq!(encoded(&p, Access::Store, 10), "MC,000A,0,3,0,1714\n");

        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let p = Property::Clock { time: Some(t) };
        assert_eq!(encoded(&p, Access::Store, 1), "CS,0001,2024-05-01T12:30:00Z\n");
    }

    #[test]
    fn test_field_count_is_protocol_error() {
        let mut p = Property::MeterStatus {
            meter: 0,
            rate: None,
        };
        let err = p.decode(Access::Query, &["0"]).unwrap_err();
        assert_eq!(err.class(), crate::core::comm::ErrorClass::Protocol);
    }

    #[test]
    fn test_bad_number_is_sentinel() {
        let mut p = Property::MeterStatus {
            meter: 0,
            rate: None,
        };
        p.decode(Access::Query, &["0", "lots"]).unwrap();
        assert_eq!(p, Property::MeterStatus { meter: 0, rate: None });
        assert!(p.updates().is_empty());
    }

    #[test]
    fn test_key_mismatch_is_not_received() {
        let mut p = Property::DetectorConfig {
            slot: 4,
            pin: Some(43),
        };
        let err = p.decode(Access::Store, &["5", "43"]).unwrap_err();
        assert!(matches!(err, CommError::NotReceived(_)));
        let err = p.decode(Access::Store, &["4", "44"]).unwrap_err();
        assert!(matches!(err, CommError::NotReceived(_)));
        p.decode(Access::Store, &["4", "43"]).unwrap();
    }

    #[test]
    fn test_time_parsing() {
        let t = parse_time("2024-05-01T12:30:00Z");
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
        assert_eq!(parse_time("yesterday").timestamp(), 0);
    }

    #[test]
    fn test_raw_line() {
        let line = RawLine::parse("ms,0001,0,2000").unwrap();
        assert_eq!(line.code, "ms");
        assert_eq!(line.message_id(), Some(MessageId(1)));
        assert_eq!(line.fields, vec!["0", "2000"]);
        assert!(!line.is_device_originated());
        assert!(RawLine::parse("DS,0002,1,2,3,t,5,6").unwrap().is_device_originated());
        assert!(RawLine::parse("ms").is_none());
    }

    #[test]
    fn test_detector_status() {
        let raw = RawLine::parse("DS,00A0,3,180,2200,2024-05-01T12:30:00Z,x,21").unwrap();
        let ds = DetectorStatus::parse(&raw).unwrap();
        assert_eq!(ds.id, MessageId(0xA0));
        assert_eq!(ds.event.slot, 3);
        assert_eq!(ds.event.speed, None);
        assert_eq!(ds.event.length, Some(21));

        let mut buf = BytesMut::new();
        DetectorStatus::encode_ack(ds.id, &mut buf);
        assert_eq!(&buf[..], b"ds,00A0\n");
    }
}
