//! Device action routing
//!
//! The dispatcher owns the link workers and the device table. Each device
//! action becomes a transaction on the worker of the device's link; requests
//! that cannot be valid for the device are rejected before anything is
//! queued.

use super::device::{CommEvent, Device, DeviceKind, MeterSettings};
use super::error::CommError;
use super::message_id::RecentIds;
use super::operation::{Completion, Operation, Step};
use super::poller::{LinkStatus, Poller, PollerConfig, PollerHandle};
use super::priority::PriorityClass;
use crate::core::protocol::cohu::{Command, CohuStep};
use crate::core::protocol::http::{HttpRequest, HttpStep, LastFetch};
use crate::core::protocol::natch::NatchStep;
use crate::core::transport::TransportTrait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Protocol spoken on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkProtocol {
    /// Text-line ramp meter protocol
    Natch,
    /// Multi-drop binary PTZ protocol
    Cohu,
    /// SOAP camera services over HTTP
    Onvif,
    /// Alert feed over HTTP
    Cap,
}

impl LinkProtocol {
    /// Minimum spacing between exchanges this protocol needs by default
    pub fn default_min_interval(self) -> Duration {
        match self {
            Self::Cohu => Duration::from_millis(crate::core::protocol::cohu::DEFAULT_MIN_INTERVAL_MS),
            Self::Natch | Self::Onvif | Self::Cap => Duration::ZERO,
        }
    }

    /// Whether devices of `kind` can be reached over this protocol
    pub fn supports(self, kind: &DeviceKind) -> bool {
        matches!(
            (self, kind),
            (Self::Natch, DeviceKind::RampMeter(_))
                | (Self::Cohu, DeviceKind::Camera { .. })
                | (Self::Onvif, DeviceKind::OnvifCamera { .. })
                | (Self::Cap, DeviceKind::AlertFeed { .. })
        )
    }
}

impl fmt::Display for LinkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Natch => write!(f, "natch"),
            Self::Cohu => write!(f, "cohu"),
            Self::Onvif => write!(f, "onvif"),
            Self::Cap => write!(f, "cap"),
        }
    }
}

enum LinkHandle {
    Natch(PollerHandle<NatchStep>),
    Cohu(PollerHandle<CohuStep>),
    Http(PollerHandle<HttpStep>),
}

impl LinkHandle {
    fn status(&self) -> LinkStatus {
        match self {
            Self::Natch(h) => h.status(),
            Self::Cohu(h) => h.status(),
            Self::Http(h) => h.status(),
        }
    }

    fn cancel_device(&self, device: &str) {
        match self {
            Self::Natch(h) => h.cancel_device(device),
            Self::Cohu(h) => h.cancel_device(device),
            Self::Http(h) => h.cancel_device(device),
        }
    }

    async fn shutdown(self) {
        match self {
            Self::Natch(h) => h.shutdown().await,
            Self::Cohu(h) => h.shutdown().await,
            Self::Http(h) => h.shutdown().await,
        }
    }
}

struct Link {
    protocol: LinkProtocol,
    recent_ids: usize,
    handle: LinkHandle,
}

/// Routes device actions to link workers
pub struct Dispatcher {
    links: RwLock<HashMap<String, Link>>,
    devices: RwLock<HashMap<String, Arc<Device>>>,
    events: broadcast::Sender<CommEvent>,
    last_fetch: Arc<LastFetch>,
}

impl Dispatcher {
    /// Create a dispatcher with an event channel of `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            links: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            events,
            last_fetch: Arc::new(LastFetch::new()),
        }
    }

    /// Subscribe to device notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CommEvent> {
        self.events.subscribe()
    }

    /// Start a worker for a link
    pub fn add_link(
        &self,
        protocol: LinkProtocol,
        config: PollerConfig,
        recent_ids: usize,
        transport: Box<dyn TransportTrait>,
    ) -> Result<(), CommError> {
        let name = config.name.clone();
        if self.links.read().contains_key(&name) {
            return Err(CommError::config(format!("duplicate link {}", name)));
        }
        let events = self.events.clone();
        let handle = match protocol {
            LinkProtocol::Natch => LinkHandle::Natch(Poller::spawn(config, transport, events)),
            LinkProtocol::Cohu => LinkHandle::Cohu(Poller::spawn(config, transport, events)),
            LinkProtocol::Onvif | LinkProtocol::Cap => {
                LinkHandle::Http(Poller::spawn(config, transport, events))
            }
        };
        tracing::info!("link {} ({}) started", name, protocol);
        self.links.write().insert(
            name,
            Link {
                protocol,
                recent_ids: recent_ids.max(1),
                handle,
            },
        );
        Ok(())
    }

    /// Register a device
    pub fn add_device(&self, device: Device) -> Arc<Device> {
        let device = Arc::new(device);
        self.devices
            .write()
            .insert(device.name().to_string(), Arc::clone(&device));
        device
    }

    /// Remove a device, cancelling whatever it still has queued
    pub fn remove_device(&self, name: &str) -> Option<Arc<Device>> {
        let device = self.devices.write().remove(name)?;
        device.mark_removed();
        if let Some(link) = self.links.read().get(device.link()) {
            link.handle.cancel_device(name);
        }
        tracing::info!("device {} removed", name);
        Some(device)
    }

    /// Look up a device
    pub fn device(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.read().get(name).cloned()
    }

    /// Names of all registered devices
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of a link worker
    pub fn link_status(&self, link: &str) -> Option<LinkStatus> {
        self.links.read().get(link).map(|l| l.handle.status())
    }

    /// Time of the most recent successful feed fetch on any link
    pub fn last_fetch(&self) -> Option<DateTime<Utc>> {
        self.last_fetch.get()
    }

    /// Push cabinet settings to a ramp meter
    pub fn send_settings(&self, device: &str) -> Result<Completion, CommError> {
        let (dev, settings) = self.meter(device, "send settings")?;
        let step = NatchStep::send_settings(settings);
        self.submit_natch(Operation::new("send settings", dev, PriorityClass::Settings, step))
    }

    /// Push the detector table to a ramp meter
    pub fn configure_detectors(&self, device: &str) -> Result<Completion, CommError> {
        let (dev, settings) = self.meter(device, "configure detectors")?;
        let step = NatchStep::configure_detectors(settings);
        self.submit_natch(Operation::new(
            "configure detectors",
            dev,
            PriorityClass::Settings,
            step,
        ))
    }

    /// Poll ramp meter status; skipped if an identical poll is still queued
    pub fn query_status(
        &self,
        device: &str,
        priority: PriorityClass,
    ) -> Result<Completion, CommError> {
        let (dev, settings) = self.meter(device, "query status")?;
        let step = NatchStep::query_status(settings);
        self.submit_natch(Operation::new("query status", dev, priority, step).coalescing())
    }

    /// Query controller firmware version
    pub fn query_firmware(
        &self,
        device: &str,
        priority: PriorityClass,
    ) -> Result<Completion, CommError> {
        let (dev, _) = self.meter(device, "query firmware")?;
        let step = NatchStep::query_firmware();
        self.submit_natch(Operation::new("query firmware", dev, priority, step).coalescing())
    }

    /// Command a release rate (vehicles per hour)
    pub fn set_release_rate(&self, device: &str, rate: u32) -> Result<Completion, CommError> {
        let (dev, settings) = self.meter(device, "set release rate")?;
        let step = NatchStep::set_release_rate(settings.meter, rate);
        self.submit_natch(Operation::new("set release rate", dev, PriorityClass::Command, step))
    }

    /// Turn the advance warning beacon on or off
    pub fn set_flashing(&self, device: &str, on: bool) -> Result<Completion, CommError> {
        let (dev, settings) = self.meter(device, "set flashing")?;
        let Some(pin) = settings.beacon_pin else {
            return Err(self.reject(&dev, "set flashing", "no beacon pin configured"));
        };
        let step = NatchStep::set_flashing(pin, on);
        self.submit_natch(Operation::new("set flashing", dev, PriorityClass::Command, step))
    }

    /// Install the background detector listener for a ramp meter
    pub fn listen_detectors(&self, device: &str) -> Result<Completion, CommError> {
        let (dev, _) = self.meter(device, "listen detectors")?;
        let capacity = self
            .links
            .read()
            .get(dev.link())
            .map_or(RecentIds::<u16>::DEFAULT_CAPACITY, |l| l.recent_ids);
        let step = NatchStep::listen(capacity);
        self.submit_natch(Operation::new("listen detectors", dev, PriorityClass::Idle, step))
    }

    /// Move a camera; values are in `[-1, 1]`, near zero stops the axis
    pub fn move_camera(
        &self,
        device: &str,
        pan: f32,
        tilt: f32,
        zoom: f32,
    ) -> Result<Completion, CommError> {
        let (dev, drop) = self.camera(device, "move camera")?;
        let step = CohuStep::ptz(drop, pan, tilt, zoom);
        self.submit_cohu(Operation::new("move camera", dev, PriorityClass::Command, step))
    }

    /// Move a camera to a stored preset
    pub fn recall_preset(&self, device: &str, preset: u8) -> Result<Completion, CommError> {
        let (dev, drop) = self.camera(device, "recall preset")?;
        let step = CohuStep::single(drop, Command::RecallPreset(preset));
        self.submit_cohu(Operation::new("recall preset", dev, PriorityClass::Command, step))
    }

    /// Store the camera's current position as a preset
    pub fn store_preset(&self, device: &str, preset: u8) -> Result<Completion, CommError> {
        let (dev, drop) = self.camera(device, "store preset")?;
        let step = CohuStep::single(drop, Command::StorePreset(preset));
        self.submit_cohu(Operation::new("store preset", dev, PriorityClass::Command, step))
    }

    /// Post a SOAP envelope to a camera service
    pub fn send_soap(
        &self,
        device: &str,
        action: &str,
        envelope: &str,
    ) -> Result<Completion, CommError> {
        let dev = self.lookup(device, "send soap")?;
        let DeviceKind::OnvifCamera { host, path } = dev.kind().clone() else {
            return Err(self.reject(&dev, "send soap", "not an onvif camera"));
        };
        self.check_link(&dev, "send soap")?;
        let step = HttpStep::new(HttpRequest::soap(&host, &path, action, envelope));
        self.submit_http(Operation::new("send soap", dev, PriorityClass::Command, step))
    }

    /// Fetch an alert feed; skipped if a fetch is still queued
    pub fn fetch_feed(
        &self,
        device: &str,
        priority: PriorityClass,
    ) -> Result<Completion, CommError> {
        let dev = self.lookup(device, "fetch feed")?;
        let DeviceKind::AlertFeed { host, path } = dev.kind().clone() else {
            return Err(self.reject(&dev, "fetch feed", "not an alert feed"));
        };
        self.check_link(&dev, "fetch feed")?;
        let step = HttpStep::new(HttpRequest::get(&host, &path))
            .record_fetch(Arc::clone(&self.last_fetch));
        self.submit_http(Operation::new("fetch feed", dev, priority, step).coalescing())
    }

    /// Stop every link worker
    pub async fn shutdown(&self) {
        let links: Vec<(String, Link)> = self.links.write().drain().collect();
        join_all(links.into_iter().map(|(name, link)| async move {
            link.handle.shutdown().await;
            tracing::info!("link {} stopped", name);
        }))
        .await;
    }

    fn lookup(&self, device: &str, operation: &str) -> Result<Arc<Device>, CommError> {
        self.device(device).ok_or_else(|| {
            tracing::warn!("{}: unknown device {}", operation, device);
            CommError::config(format!("unknown device {}", device))
        })
    }

    fn meter(
        &self,
        device: &str,
        operation: &str,
    ) -> Result<(Arc<Device>, Arc<MeterSettings>), CommError> {
        let dev = self.lookup(device, operation)?;
        let Some(settings) = dev.meter_settings().cloned() else {
            return Err(self.reject(&dev, operation, "not a ramp meter"));
        };
        self.check_link(&dev, operation)?;
        Ok((dev, Arc::new(settings)))
    }

    fn camera(&self, device: &str, operation: &str) -> Result<(Arc<Device>, u16), CommError> {
        let dev = self.lookup(device, operation)?;
        let DeviceKind::Camera { drop } = *dev.kind() else {
            return Err(self.reject(&dev, operation, "not a camera"));
        };
        self.check_link(&dev, operation)?;
        Ok((dev, drop))
    }

    fn check_link(&self, dev: &Device, operation: &str) -> Result<(), CommError> {
        let protocol = self.links.read().get(dev.link()).map(|l| l.protocol);
        match protocol {
            Some(p) if p.supports(dev.kind()) => Ok(()),
            Some(p) => Err(self.reject(
                dev,
                operation,
                &format!("{} link {} cannot reach a {}", p, dev.link(), dev.kind().name()),
            )),
            None => Err(self.reject(dev, operation, &format!("unknown link {}", dev.link()))),
        }
    }

    /// Record a configuration failure detected before queueing
    fn reject(&self, dev: &Device, operation: &str, message: &str) -> CommError {
        tracing::warn!("{}: {} rejected: {}", dev.name(), operation, message);
        dev.set_fault(message);
        let _ = self.events.send(CommEvent::ConfigError {
            device: dev.name().to_string(),
            operation: operation.to_string(),
            message: message.to_string(),
        });
        CommError::config(message)
    }

    fn submit_natch(&self, op: Operation<NatchStep>) -> Result<Completion, CommError> {
        let links = self.links.read();
        match links.get(op.device().link()).map(|l| &l.handle) {
            Some(LinkHandle::Natch(h)) => submit(h, op),
            _ => Err(CommError::config(format!("no natch link {}", op.device().link()))),
        }
    }

    fn submit_cohu(&self, op: Operation<CohuStep>) -> Result<Completion, CommError> {
        let links = self.links.read();
        match links.get(op.device().link()).map(|l| &l.handle) {
            Some(LinkHandle::Cohu(h)) => submit(h, op),
            _ => Err(CommError::config(format!("no cohu link {}", op.device().link()))),
        }
    }

    fn submit_http(&self, op: Operation<HttpStep>) -> Result<Completion, CommError> {
        let links = self.links.read();
        match links.get(op.device().link()).map(|l| &l.handle) {
            Some(LinkHandle::Http(h)) => submit(h, op),
            _ => Err(CommError::config(format!("no http link {}", op.device().link()))),
        }
    }
}

fn submit<S: Step>(handle: &PollerHandle<S>, mut op: Operation<S>) -> Result<Completion, CommError> {
    let completion = op.completion();
    handle.enqueue(op)?;
    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comm::operation::OperationState;
    use crate::core::transport::MockTransportTrait;

    fn idle_transport() -> Box<dyn TransportTrait> {
        let mut transport = MockTransportTrait::new();
        transport.expect_is_connected().return_const(false);
        transport.expect_connect().never();
        transport.expect_send().never();
        transport.expect_disconnect().returning(|| Ok(()));
        Box::new(transport)
    }

    fn meter(beacon_pin: Option<u8>) -> Device {
        Device::new(
            "M1",
            "natch1",
            DeviceKind::RampMeter(MeterSettings {
                meter: 0,
                red_pin: 3,
                beacon_pin,
                max_rate: 1714,
                detector_pins: vec![],
            }),
        )
    }

    #[test]
    fn test_protocol_supports_kind() {
        assert!(LinkProtocol::Cohu.supports(&DeviceKind::Camera { drop: 3 }));
        assert!(!LinkProtocol::Natch.supports(&DeviceKind::Camera { drop: 3 }));
        assert_eq!(
            LinkProtocol::Cohu.default_min_interval(),
            Duration::from_millis(20)
        );
        assert_eq!(LinkProtocol::Cap.default_min_interval(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_flashing_without_beacon_is_config_error() {
        let dispatcher = Dispatcher::new(16);
        dispatcher
            .add_link(LinkProtocol::Natch, PollerConfig::new("natch1"), 16, idle_transport())
            .unwrap();
        let dev = dispatcher.add_device(meter(None));
        let mut events = dispatcher.subscribe();

        let err = dispatcher.set_flashing("M1", true).unwrap_err();
        assert!(matches!(err, CommError::Configuration(_)));
        assert_eq!(dev.fault().as_deref(), Some("no beacon pin configured"));
        assert!(matches!(
            events.try_recv().unwrap(),
            CommEvent::ConfigError { .. }
        ));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_link_protocol_is_rejected() {
        let dispatcher = Dispatcher::new(16);
        dispatcher
            .add_link(LinkProtocol::Cohu, PollerConfig::new("natch1"), 16, idle_transport())
            .unwrap();
        dispatcher.add_device(meter(Some(5)));
        assert!(dispatcher.query_status("M1", PriorityClass::PollHigh).is_err());
        assert!(dispatcher.move_camera("M1", 0.5, 0.0, 0.0).is_err());
        assert!(dispatcher.set_release_rate("nope", 900).is_err());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_device_is_forgotten() {
        let dispatcher = Dispatcher::new(16);
        dispatcher
            .add_link(LinkProtocol::Natch, PollerConfig::new("natch1"), 16, idle_transport())
            .unwrap();
        dispatcher.add_device(meter(Some(5)));
        dispatcher.remove_device("M1").unwrap();
        assert!(dispatcher.device("M1").is_none());
        assert!(dispatcher.set_release_rate("M1", 900).is_err());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_failure_resolves_completion() {
        let mut transport = MockTransportTrait::new();
        transport.expect_is_connected().return_const(false);
        transport.expect_connect().returning(|| {
            Err(crate::core::transport::TransportError::ConnectionFailed(
                "refused".into(),
            ))
        });
        transport.expect_disconnect().returning(|| Ok(()));

        let dispatcher = Dispatcher::new(16);
        dispatcher
            .add_link(
                LinkProtocol::Natch,
                PollerConfig::new("natch1").retries(1),
                16,
                Box::new(transport),
            )
            .unwrap();
        dispatcher.add_device(meter(Some(5)));
        let completion = dispatcher.set_release_rate("M1", 900).unwrap();
        let result = completion.wait().await;
        assert!(matches!(result.state, OperationState::Failed(_)));
        dispatcher.shutdown().await;
        assert!(dispatcher.link_status("natch1").is_none());
    }
}
