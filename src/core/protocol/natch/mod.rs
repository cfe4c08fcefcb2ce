//! Text-line ramp meter protocol
//!
//! Transactions are chains of [`Exchange`]s (one request, one reply) plus a
//! background [`Listener`] for detector events the controller sends on its
//! own.

mod listener;
pub mod message;

pub use listener::Listener;
pub use message::{Access, DetectorStatus, Property, RawLine};

use crate::core::comm::{
    CommError, MessageId, MeterSettings, RecvStatus, Step, StepContext, StepKind, StepOutcome,
    DETECTOR_SLOTS,
};
use crate::core::protocol::framing;
use bytes::BytesMut;
use chrono::Utc;
use std::sync::Arc;

/// One request and its reply
#[derive(Debug, Clone)]
pub struct Exchange {
    property: Property,
    access: Access,
    id: Option<MessageId>,
    done: bool,
}

impl Exchange {
    /// Read a property
    pub fn query(property: Property) -> Self {
        Self {
            property,
            access: Access::Query,
            id: None,
            done: false,
        }
    }

    /// Write a property
    pub fn store(property: Property) -> Self {
        Self {
            property,
            access: Access::Store,
            id: None,
            done: false,
        }
    }

    /// Property being exchanged
    pub fn property(&self) -> &Property {
        &self.property
    }

    /// Check if the reply was accepted
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Id of the outstanding request
    pub fn message_id(&self) -> Option<MessageId> {
        self.id
    }

    fn describe(&self) -> String {
        format!("{} {}", self.access.name(), self.property.code())
    }

    /// Encode the request with a fresh message id
    pub fn poll(&mut self, ctx: &mut StepContext<'_>, tx: &mut BytesMut) {
        let id = ctx.next_message_id();
        self.id = Some(id);
        self.done = false;
        self.property.encode(self.access, id, tx);
    }

    /// Look for the reply among buffered lines
    pub fn recv(
        &mut self,
        ctx: &mut StepContext<'_>,
        rx: &mut BytesMut,
    ) -> Result<RecvStatus, CommError> {
        while let Some(bytes) = framing::take_line(rx) {
            let text = String::from_utf8_lossy(&bytes);
            let Some(line) = RawLine::parse(&text) else {
                if text.trim().is_empty() {
                    continue;
                }
                return Err(CommError::protocol(format!("malformed line: {}", text)));
            };
            if line.is_device_originated() {
                let mut stashed = BytesMut::from(&bytes[..]);
                stashed.extend_from_slice(b"\n");
                ctx.stash_unsolicited(stashed.freeze());
                continue;
            }
            if line.code != self.property.reply_code() {
                return Err(CommError::protocol(format!(
                    "unexpected code {} (wanted {})",
                    line.code,
                    self.property.reply_code()
                )));
            }
            if line.message_id() != self.id {
                return Err(CommError::not_received(format!(
                    "message id {} != {}",
                    line.id,
                    self.id.map(|id| id.to_string()).unwrap_or_default()
                )));
            }
            self.property.decode(self.access, &line.fields)?;
            for update in self.property.updates() {
                ctx.notify(update);
            }
            self.done = true;
            return Ok(RecvStatus::Complete);
        }
        Ok(RecvStatus::Incomplete)
    }
}

/// Stage of the settings push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsStage {
    /// Set controller clock
    Clock,
    /// Configure one detector slot
    Detector(u8),
    /// Configure meter outputs
    MeterConfig,
    /// Reset the watchdog
    Watchdog,
}

/// Stage of a status query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStage {
    /// Check meter configuration
    Config,
    /// Read release rate
    Rate,
    /// Read beacon output
    Beacon,
}

/// Step of a text-line transaction
#[derive(Debug)]
pub enum NatchStep {
    /// Push clock, detector table, meter config and watchdog reset
    Settings {
        /// Current stage
        stage: SettingsStage,
        /// Current exchange
        exchange: Exchange,
        /// Cabinet settings
        settings: Arc<MeterSettings>,
    },
    /// Configure detector slots 0..32
    Detectors {
        /// Current exchange
        exchange: Exchange,
        /// Cabinet settings
        settings: Arc<MeterSettings>,
    },
    /// Query meter config, release rate and beacon
    Status {
        /// Current stage
        stage: StatusStage,
        /// Current exchange
        exchange: Exchange,
        /// Cabinet settings
        settings: Arc<MeterSettings>,
    },
    /// A single exchange
    Single(Exchange),
    /// Background detector event listener
    Listen(Listener),
}

impl NatchStep {
    /// Settings push, starting with the clock
    pub fn send_settings(settings: Arc<MeterSettings>) -> Self {
        Self::Settings {
            stage: SettingsStage::Clock,
            exchange: settings_exchange(SettingsStage::Clock, &settings),
            settings,
        }
    }

    /// Detector table push
    pub fn configure_detectors(settings: Arc<MeterSettings>) -> Self {
        Self::Detectors {
            exchange: detector_exchange(0, &settings),
            settings,
        }
    }

    /// Status query
    pub fn query_status(settings: Arc<MeterSettings>) -> Self {
        Self::Status {
            stage: StatusStage::Config,
            exchange: status_exchange(StatusStage::Config, &settings),
            settings,
        }
    }

    /// Store a release rate
    pub fn set_release_rate(meter: u8, rate: u32) -> Self {
        Self::Single(Exchange::store(Property::MeterStatus {
            meter,
            rate: Some(rate),
        }))
    }

    /// Store the beacon output state
    pub fn set_flashing(beacon_pin: u8, on: bool) -> Self {
        Self::Single(Exchange::store(Property::PinStatus {
            pin: beacon_pin,
            on: Some(on),
        }))
    }

    /// Query firmware version
    pub fn query_firmware() -> Self {
        Self::Single(Exchange::query(Property::Firmware { version: None }))
    }

    /// Detector event listener
    pub fn listen(capacity: usize) -> Self {
        Self::Listen(Listener::new(capacity))
    }

    /// Current exchange, if this step has one
    pub fn exchange(&self) -> Option<&Exchange> {
        match self {
            Self::Settings { exchange, .. }
            | Self::Detectors { exchange, .. }
            | Self::Status { exchange, .. }
            | Self::Single(exchange) => Some(exchange),
            Self::Listen(_) => None,
        }
    }

    fn exchange_mut(&mut self) -> Option<&mut Exchange> {
        match self {
            Self::Settings { exchange, .. }
            | Self::Detectors { exchange, .. }
            | Self::Status { exchange, .. }
            | Self::Single(exchange) => Some(exchange),
            Self::Listen(_) => None,
        }
    }
}

fn settings_exchange(stage: SettingsStage, settings: &MeterSettings) -> Exchange {
    match stage {
        SettingsStage::Clock => Exchange::store(Property::Clock {
            time: Some(Utc::now()),
        }),
        SettingsStage::Detector(slot) => detector_exchange(slot, settings),
        SettingsStage::MeterConfig => Exchange::store(Property::MeterConfig {
            meter: settings.meter,
            red_pin: Some(settings.red_pin),
            beacon_pin: Some(settings.beacon_pin.unwrap_or(0)),
            max_rate: Some(settings.max_rate),
        }),
        SettingsStage::Watchdog => Exchange::store(Property::Watchdog),
    }
}

fn detector_exchange(slot: u8, settings: &MeterSettings) -> Exchange {
    Exchange::store(Property::DetectorConfig {
        slot,
        pin: Some(settings.detector_pin(slot)),
    })
}

fn status_exchange(stage: StatusStage, settings: &MeterSettings) -> Exchange {
    match stage {
        StatusStage::Config => Exchange::query(Property::MeterConfig {
            meter: settings.meter,
            red_pin: None,
            beacon_pin: None,
            max_rate: None,
        }),
        StatusStage::Rate => Exchange::query(Property::MeterStatus {
            meter: settings.meter,
            rate: None,
        }),
        StatusStage::Beacon => Exchange::query(Property::PinStatus {
            pin: settings.beacon_pin.unwrap_or(0),
            on: None,
        }),
    }
}

impl Step for NatchStep {
    fn kind(&self) -> StepKind {
        match self {
            Self::Listen(_) => StepKind::Listen,
            _ => StepKind::Poll,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Settings { stage, exchange, .. } => match stage {
                SettingsStage::Detector(slot) => format!("SEND SETTINGS: DC {}", slot),
                _ => format!("SEND SETTINGS: {}", exchange.property().code()),
            },
            Self::Detectors { exchange, .. } => match exchange.property() {
                Property::DetectorConfig { slot, .. } => format!("CONFIGURE DETECTOR {}", slot),
                _ => "CONFIGURE DETECTORS".to_string(),
            },
            Self::Status { exchange, .. } => format!("QUERY STATUS: {}", exchange.property().code()),
            Self::Single(exchange) => exchange.describe(),
            Self::Listen(_) => "LISTEN DS".to_string(),
        }
    }

    fn poll(&mut self, ctx: &mut StepContext<'_>, tx: &mut BytesMut) -> Result<(), CommError> {
        match self {
            Self::Listen(listener) => {
                listener.poll(tx);
                Ok(())
            }
            _ => {
                if let Some(exchange) = self.exchange_mut() {
                    exchange.poll(ctx, tx);
                }
                Ok(())
            }
        }
    }

    fn recv(
        &mut self,
        ctx: &mut StepContext<'_>,
        rx: &mut BytesMut,
    ) -> Result<RecvStatus, CommError> {
        match self {
            Self::Listen(listener) => listener.recv(ctx, rx),
            _ => match self.exchange_mut() {
                Some(exchange) => exchange.recv(ctx, rx),
                None => Ok(RecvStatus::Complete),
            },
        }
    }

    fn next(self) -> StepOutcome<Self> {
        if let Some(exchange) = self.exchange() {
            if !exchange.is_done() {
                return StepOutcome::Continue(self);
            }
        }
        match self {
            Self::Settings {
                stage, settings, ..
            } => {
                let stage = match stage {
                    SettingsStage::Clock => SettingsStage::Detector(0),
                    SettingsStage::Detector(slot) if slot + 1 < DETECTOR_SLOTS => {
                        SettingsStage::Detector(slot + 1)
                    }
                    SettingsStage::Detector(_) => SettingsStage::MeterConfig,
                    SettingsStage::MeterConfig => SettingsStage::Watchdog,
                    SettingsStage::Watchdog => return StepOutcome::Done,
                };
                StepOutcome::Advance(Self::Settings {
                    stage,
                    exchange: settings_exchange(stage, &settings),
                    settings,
                })
            }
            Self::Detectors { exchange, settings } => match exchange.property() {
                Property::DetectorConfig { slot, .. } if slot + 1 < DETECTOR_SLOTS => {
                    StepOutcome::Advance(Self::Detectors {
                        exchange: detector_exchange(slot + 1, &settings),
                        settings,
                    })
                }
                _ => StepOutcome::Done,
            },
            Self::Status {
                stage,
                exchange,
                settings,
            } => {
                let stage = match (stage, exchange.property()) {
                    (
                        StatusStage::Config,
                        Property::MeterConfig {
                            red_pin: Some(0), ..
                        },
                    ) => {
                        // controller lost its configuration
                        return StepOutcome::Advance(Self::send_settings(settings));
                    }
                    (StatusStage::Config, _) => StatusStage::Rate,
                    (StatusStage::Rate, _) if settings.beacon_pin.is_some() => {
                        StatusStage::Beacon
                    }
                    _ => return StepOutcome::Done,
                };
                StepOutcome::Advance(Self::Status {
                    stage,
                    exchange: status_exchange(stage, &settings),
                    settings,
                })
            }
            Self::Single(_) => StepOutcome::Done,
            Self::Listen(listener) => StepOutcome::Continue(Self::Listen(listener)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comm::{Device, DeviceKind, DeviceUpdate, MessageIdCounter};
    use bytes::Bytes;
    use std::collections::VecDeque;

    fn settings() -> Arc<MeterSettings> {
        Arc::new(MeterSettings {
            meter: 0,
            red_pin: 3,
            beacon_pin: Some(7),
            max_rate: 1714,
            detector_pins: (39..47).collect(),
        })
    }

    struct Harness {
        device: Device,
        ids: MessageIdCounter,
        stash: VecDeque<Bytes>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                device: Device::new("M1", "natch1", DeviceKind::RampMeter((*settings()).clone())),
                ids: MessageIdCounter::starting_at(1),
                stash: VecDeque::new(),
            }
        }

        fn poll(&mut self, step: &mut NatchStep) -> String {
            let mut ctx = StepContext::new(&self.device, &mut self.ids, &mut self.stash);
            let mut tx = BytesMut::new();
            step.poll(&mut ctx, &mut tx).unwrap();
            String::from_utf8(tx.to_vec()).unwrap()
        }

        fn recv(
            &mut self,
            step: &mut NatchStep,
            reply: &str,
        ) -> (Result<RecvStatus, CommError>, Vec<DeviceUpdate>) {
            let mut ctx = StepContext::new(&self.device, &mut self.ids, &mut self.stash);
            let mut rx = BytesMut::from(reply.as_bytes());
            let status = step.recv(&mut ctx, &mut rx);
            (status, ctx.take_updates())
        }
    }

    #[test]
    fn test_set_release_rate() {
        let mut h = Harness::new();
        let mut step = NatchStep::set_release_rate(0, 2000);
        assert_eq!(h.poll(&mut step), "MS,0001,0,2000\n");
        let (status, updates) = h.recv(&mut step, "ms,0001,0,2000\n");
        assert_eq!(status.unwrap(), RecvStatus::Complete);
        assert_eq!(updates, vec![DeviceUpdate::ReleaseRate(2000)]);
        assert!(matches!(step.next(), StepOutcome::Done));
    }

    #[test]
    fn test_wrong_id_is_not_received() {
        let mut h = Harness::new();
        let mut step = NatchStep::set_release_rate(0, 2000);
        h.poll(&mut step);
        let (status, _) = h.recv(&mut step, "ms,0000,0,2000\n");
        assert!(matches!(status, Err(CommError::NotReceived(_))));
        assert!(matches!(step.next(), StepOutcome::Continue(_)));
    }

    #[test]
    fn test_retry_uses_new_id() {
        let mut h = Harness::new();
        let mut step = NatchStep::query_firmware();
        assert_eq!(h.poll(&mut step), "FV,0001\n");
        assert_eq!(h.poll(&mut step), "FV,0002\n");
    }

    #[test]
    fn test_unsolicited_lines_are_stashed() {
        let mut h = Harness::new();
        let mut step = NatchStep::query_firmware();
        h.poll(&mut step);
        let (status, updates) = h.recv(
            &mut step,
            "DS,0100,0,100,2000,2024-05-01T00:00:00Z,30,18\nfv,0001,1.42\n",
        );
        assert_eq!(status.unwrap(), RecvStatus::Complete);
        assert_eq!(updates, vec![DeviceUpdate::Firmware("1.42".into())]);
        assert_eq!(h.stash.len(), 1);
    }

    #[test]
    fn test_wrong_code_is_protocol_error() {
        let mut h = Harness::new();
        let mut step = NatchStep::query_firmware();
        h.poll(&mut step);
        let (status, _) = h.recv(&mut step, "ms,0001,0,2000\n");
        assert!(matches!(status, Err(CommError::Protocol(_))));
    }

    #[test]
    fn test_partial_line_is_incomplete() {
        let mut h = Harness::new();
        let mut step = NatchStep::query_firmware();
        h.poll(&mut step);
        let (status, _) = h.recv(&mut step, "fv,0001,1.");
        assert_eq!(status.unwrap(), RecvStatus::Incomplete);
    }

    #[test]
    fn test_settings_chain() {
        let mut h = Harness::new();
        let mut step = NatchStep::send_settings(settings());
        let mut codes = Vec::new();
        loop {
            let request = h.poll(&mut step);
            let raw = RawLine::parse(request.trim()).unwrap();
            codes.push(raw.code.to_string());
            let mut reply = vec![raw.code.to_ascii_lowercase(), raw.id.to_string()];
            reply.extend(raw.fields.iter().map(|f| f.to_string()));
            let (status, _) = h.recv(&mut step, &format!("{}\n", reply.join(",")));
            assert_eq!(status.unwrap(), RecvStatus::Complete);
            match step.next() {
                StepOutcome::Advance(s) => step = s,
                StepOutcome::Done => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(codes.len(), 1 + 32 + 1 + 1);
        assert_eq!(codes[0], "CS");
        assert!(codes[1..33].iter().all(|c| c == "DC"));
        assert_eq!(codes[33], "MC");
        assert_eq!(codes[34], "WD");
    }

    #[test]
    fn test_status_redirects_to_settings() {
        let mut h = Harness::new();
        let mut step = NatchStep::query_status(settings());
        assert_eq!(h.poll(&mut step), "MC,0001,0\n");
        let (status, _) = h.recv(&mut step, "mc,0001,0,0,0,0\n");
        status.unwrap();
        match step.next() {
            StepOutcome::Advance(NatchStep::Settings { stage, .. }) => {
                assert_eq!(stage, SettingsStage::Clock)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_status_queries_beacon() {
        let mut h = Harness::new();
        let mut step = NatchStep::query_status(settings());
        h.poll(&mut step);
        h.recv(&mut step, "mc,0001,0,3,7,1714\n").0.unwrap();
        let StepOutcome::Advance(mut step) = step.next() else {
            panic!("expected rate query");
        };
        assert_eq!(h.poll(&mut step), "MS,0002,0\n");
        h.recv(&mut step, "ms,0002,0,900\n").0.unwrap();
        let StepOutcome::Advance(mut step) = step.next() else {
            panic!("expected beacon query");
        };
        assert_eq!(h.poll(&mut step), "PS,0003,7\n");
        let (_, updates) = h.recv(&mut step, "ps,0003,7,1\n");
        assert_eq!(updates, vec![DeviceUpdate::Beacon(true)]);
        assert!(matches!(step.next(), StepOutcome::Done));
    }
}
