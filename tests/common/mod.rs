//! Shared setup for link-level tests

#![allow(dead_code)]

use fieldpoll_core::core::comm::{
    CommEvent, Device, DeviceKind, Dispatcher, LinkProtocol, MeterSettings, PollerConfig,
};
use fieldpoll_core::core::simulator::{SimHandle, SimulatedTransport, VirtualDevice};
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn meter_settings() -> MeterSettings {
    MeterSettings {
        meter: 0,
        red_pin: 3,
        beacon_pin: Some(7),
        max_rate: 1714,
        detector_pins: (39..71).collect(),
    }
}

pub fn fast_config(name: &str) -> PollerConfig {
    PollerConfig::new(name)
        .timeout(Duration::from_millis(100))
        .retries(3)
        .listen_interval(Duration::from_millis(20))
}

/// Dispatcher with one link of `protocol` backed by `device`
pub fn link(protocol: LinkProtocol, config: PollerConfig, device: VirtualDevice) -> (Dispatcher, SimHandle) {
    let dispatcher = Dispatcher::new(1024);
    let (transport, sim) = SimulatedTransport::new(device);
    dispatcher
        .add_link(protocol, config, 16, Box::new(transport))
        .expect("add link");
    (dispatcher, sim)
}

pub fn add_meter(dispatcher: &Dispatcher, name: &str, link: &str) {
    dispatcher.add_device(Device::new(name, link, DeviceKind::RampMeter(meter_settings())));
}

pub fn add_camera(dispatcher: &Dispatcher, name: &str, link: &str, drop: u16) {
    dispatcher.add_device(Device::new(name, link, DeviceKind::Camera { drop }));
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Await with a generous upper bound
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// Drain events received so far
pub fn drain(rx: &mut broadcast::Receiver<CommEvent>) -> Vec<CommEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
