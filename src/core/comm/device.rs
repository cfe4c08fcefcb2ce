//! Device handles, state snapshots and collaborator notifications

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Number of detector slots in a text-line controller
pub const DETECTOR_SLOTS: u8 = 32;

/// Device kind with its protocol-relevant settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    /// Ramp meter cabinet on a text-line link
    RampMeter(MeterSettings),
    /// PTZ camera on a multi-drop binary link
    Camera {
        /// Multi-drop address
        drop: u16,
    },
    /// SOAP camera endpoint
    OnvifCamera {
        /// HTTP host header
        host: String,
        /// Service path
        path: String,
    },
    /// Pull-based alert feed
    AlertFeed {
        /// HTTP host header
        host: String,
        /// Feed path
        path: String,
    },
}

impl DeviceKind {
    /// Get name of device kind
    pub fn name(&self) -> &'static str {
        match self {
            Self::RampMeter(_) => "ramp meter",
            Self::Camera { .. } => "camera",
            Self::OnvifCamera { .. } => "onvif camera",
            Self::AlertFeed { .. } => "alert feed",
        }
    }
}

fn default_max_rate() -> u32 {
    1714
}

/// Cabinet settings for a ramp meter controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterSettings {
    /// Meter number within the cabinet
    #[serde(default)]
    pub meter: u8,
    /// Output pin driving the red indication (0 means unassigned)
    pub red_pin: u8,
    /// Output pin for the advance warning beacon
    #[serde(default)]
    pub beacon_pin: Option<u8>,
    /// Maximum release rate (vehicles per hour)
    #[serde(default = "default_max_rate")]
    pub max_rate: u32,
    /// Input pin per detector slot; missing slots are unassigned
    #[serde(default)]
    pub detector_pins: Vec<u8>,
}

impl MeterSettings {
    /// Input pin for a detector slot (0 when unassigned)
    pub fn detector_pin(&self, slot: u8) -> u8 {
        self.detector_pins.get(usize::from(slot)).copied().unwrap_or(0)
    }
}

/// One vehicle passing a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleEvent {
    /// Detector slot
    pub slot: u8,
    /// Occupied duration (ms)
    pub duration_ms: Option<u32>,
    /// Headway since previous vehicle (ms)
    pub headway_ms: Option<u32>,
    /// Controller timestamp (epoch zero if unparsable)
    pub time: DateTime<Utc>,
    /// Speed (mph)
    pub speed: Option<u32>,
    /// Vehicle length (ft)
    pub length: Option<u32>,
}

/// Typed update decoded from a device response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceUpdate {
    /// Release rate (vehicles per hour)
    ReleaseRate(u32),
    /// Beacon flashing on/off
    Beacon(bool),
    /// Firmware version string
    Firmware(String),
    /// Controller clock
    Clock(DateTime<Utc>),
    /// Detector slot input pin
    DetectorPin {
        /// Detector slot
        slot: u8,
        /// Input pin
        pin: u8,
    },
    /// Meter timing configured in the cabinet
    MeterConfigured {
        /// Red output pin reported by the controller
        red_pin: u8,
    },
    /// Vehicle detection event
    Vehicle(VehicleEvent),
    /// Camera preset recalled or stored
    Preset(u8),
    /// Document body from an HTTP exchange
    Document(String),
}

/// Last known state of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    /// Release rate (vehicles per hour)
    pub release_rate: Option<u32>,
    /// Beacon flashing
    pub beacon: Option<bool>,
    /// Firmware version
    pub firmware: Option<String>,
    /// Controller clock as last read or set
    pub clock: Option<DateTime<Utc>>,
    /// Red output pin reported by the controller
    pub red_pin: Option<u8>,
    /// Detector pin map as acknowledged by the controller
    pub detector_pins: BTreeMap<u8, u8>,
    /// Most recent vehicle event
    pub last_vehicle: Option<VehicleEvent>,
    /// Number of vehicle events received
    pub vehicle_count: u64,
    /// Last camera preset
    pub preset: Option<u8>,
    /// Last document received
    pub last_document: Option<String>,
    /// Communication failures recorded against the device
    pub comm_failures: u64,
    /// Time of the last successful exchange
    pub last_success: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// Apply an update
    pub fn apply(&mut self, update: &DeviceUpdate) {
        match update {
            DeviceUpdate::ReleaseRate(rate) => self.release_rate = Some(*rate),
            DeviceUpdate::Beacon(on) => self.beacon = Some(*on),
            DeviceUpdate::Firmware(version) => self.firmware = Some(version.clone()),
            DeviceUpdate::Clock(time) => self.clock = Some(*time),
            DeviceUpdate::DetectorPin { slot, pin } => {
                self.detector_pins.insert(*slot, *pin);
            }
            DeviceUpdate::MeterConfigured { red_pin } => self.red_pin = Some(*red_pin),
            DeviceUpdate::Vehicle(event) => {
                self.vehicle_count += 1;
                self.last_vehicle = Some(event.clone());
            }
            DeviceUpdate::Preset(preset) => self.preset = Some(*preset),
            DeviceUpdate::Document(body) => self.last_document = Some(body.clone()),
        }
    }
}

/// A field device attached to one communication link
#[derive(Debug)]
pub struct Device {
    name: String,
    link: String,
    kind: DeviceKind,
    state: RwLock<DeviceState>,
    status: RwLock<String>,
    fault: RwLock<Option<String>>,
    removed: AtomicBool,
}

impl Device {
    /// Create a new device
    pub fn new(name: &str, link: &str, kind: DeviceKind) -> Self {
        Self {
            name: name.to_string(),
            link: link.to_string(),
            kind,
            state: RwLock::new(DeviceState::default()),
            status: RwLock::new(String::new()),
            fault: RwLock::new(None),
            removed: AtomicBool::new(false),
        }
    }

    /// Get device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the link the device is attached to
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Get device kind
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// Meter settings, if this is a ramp meter
    pub fn meter_settings(&self) -> Option<&MeterSettings> {
        match &self.kind {
            DeviceKind::RampMeter(settings) => Some(settings),
            _ => None,
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> DeviceState {
        self.state.read().clone()
    }

    /// Apply a decoded update
    pub fn apply(&self, update: &DeviceUpdate) {
        self.state.write().apply(update);
    }

    /// Record a successful exchange
    pub fn record_success(&self) {
        self.state.write().last_success = Some(Utc::now());
        *self.fault.write() = None;
    }

    /// Record a communication failure
    pub fn record_comm_failure(&self) {
        self.state.write().comm_failures += 1;
    }

    /// Current operation status
    pub fn status(&self) -> String {
        self.status.read().clone()
    }

    /// Set operation status
    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.write() = status.into();
    }

    /// Most recent fault description
    pub fn fault(&self) -> Option<String> {
        self.fault.read().clone()
    }

    /// Set fault description
    pub fn set_fault(&self, fault: impl Into<String>) {
        *self.fault.write() = Some(fault.into());
    }

    /// Mark the device removed; queued work for it gets cancelled
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Check if the device was removed
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

/// Notification pushed to collaborators
#[derive(Debug, Clone)]
pub enum CommEvent {
    /// Device state changed
    Updated {
        /// Device name
        device: String,
        /// Decoded update
        update: DeviceUpdate,
    },
    /// Transaction completed successfully
    Completed {
        /// Device name
        device: String,
        /// Operation name
        operation: String,
    },
    /// Transaction failed after exhausting retries
    CommError {
        /// Device name
        device: String,
        /// Operation name
        operation: String,
        /// Fault description
        message: String,
    },
    /// Transaction failed on a framing disagreement
    ProtocolError {
        /// Device name
        device: String,
        /// Operation name
        operation: String,
        /// Fault description
        message: String,
    },
    /// Transaction rejected by configuration checks
    ConfigError {
        /// Device name
        device: String,
        /// Operation name
        operation: String,
        /// Fault description
        message: String,
    },
    /// Transaction cancelled before completing
    Cancelled {
        /// Device name
        device: String,
        /// Operation name
        operation: String,
    },
}

impl CommEvent {
    /// Device the event refers to
    pub fn device(&self) -> &str {
        match self {
            Self::Updated { device, .. }
            | Self::Completed { device, .. }
            | Self::CommError { device, .. }
            | Self::ProtocolError { device, .. }
            | Self::ConfigError { device, .. }
            | Self::Cancelled { device, .. } => device,
        }
    }
}
