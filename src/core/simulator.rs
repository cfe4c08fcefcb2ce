//! Virtual Device Simulator
//!
//! Scriptable field devices for tests and demos. A [`VirtualDevice`] answers
//! each frame it receives using the first matching [`ResponseRule`];
//! [`SimulatedTransport`] puts one behind the transport trait so a link
//! worker can drive it like real hardware.

use crate::core::transport::{TransportError, TransportStats, TransportTrait, TransportType};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Response rule condition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatchCondition {
    /// Match exact bytes
    Exact { bytes: Vec<u8> },
    /// Match hex pattern (wildcards with *)
    HexPattern { pattern: String },
    /// Match text (substring)
    Text { text: String, case_sensitive: bool },
    /// Match regex
    Regex { pattern: String },
    /// Match any input
    Any,
}

impl MatchCondition {
    /// Check if data matches this condition
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            Self::Exact { bytes } => data == bytes.as_slice(),
            Self::HexPattern { pattern } => match_hex_pattern(data, pattern),
            Self::Text {
                text,
                case_sensitive,
            } => {
                let data_str = String::from_utf8_lossy(data);
                if *case_sensitive {
                    data_str.contains(text)
                } else {
                    data_str.to_lowercase().contains(&text.to_lowercase())
                }
            }
            Self::Regex { pattern } => match Regex::new(pattern) {
                Ok(re) => re.is_match(&String::from_utf8_lossy(data)),
                Err(_) => false,
            },
            Self::Any => true,
        }
    }
}

fn match_hex_pattern(data: &[u8], pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split_whitespace().collect();
    if data.len() < parts.len() {
        return false;
    }
    parts.iter().enumerate().all(|(i, part)| {
        if *part == "*" || *part == "??" {
            return true;
        }
        match u8::from_str_radix(part, 16) {
            Ok(expected) => data.get(i) == Some(&expected),
            Err(_) => true,
        }
    })
}

/// Response action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseAction {
    /// Send fixed bytes
    Send { data: Vec<u8> },
    /// Send text
    SendText { text: String },
    /// Reply built from regex captures of the input (`$1`, `${name}`)
    Template { pattern: String, template: String },
    /// Echo input back
    Echo,
    /// No response
    None,
    /// Several replies in order
    Sequence(Vec<ResponseAction>),
    /// Close the connection once earlier replies have been read
    Close,
}

impl ResponseAction {
    /// Replies produced for `input`
    fn respond(&self, input: &[u8], out: &mut Vec<Vec<u8>>) {
        match self {
            Self::Send { data } => out.push(data.clone()),
            Self::SendText { text } => out.push(text.as_bytes().to_vec()),
            Self::Template { pattern, template } => {
                let Ok(re) = Regex::new(pattern) else {
                    return;
                };
                let text = String::from_utf8_lossy(input);
                if let Some(caps) = re.captures(&text) {
                    let mut reply = String::new();
                    caps.expand(template, &mut reply);
                    out.push(reply.into_bytes());
                }
            }
            Self::Echo => out.push(input.to_vec()),
            Self::None => {}
            Self::Close => out.push(Vec::new()),
            Self::Sequence(actions) => {
                for action in actions {
                    action.respond(input, out);
                }
            }
        }
    }
}

/// Response rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Rule name
    pub name: String,
    /// Match condition
    pub condition: MatchCondition,
    /// Response action
    pub action: ResponseAction,
    /// Enabled
    pub enabled: bool,
    /// One-shot (disable after first match)
    pub one_shot: bool,
    /// Match count
    #[serde(default)]
    pub match_count: u64,
}

impl ResponseRule {
    /// Create a rule
    pub fn new(name: &str, condition: MatchCondition, action: ResponseAction) -> Self {
        Self {
            name: name.to_string(),
            condition,
            action,
            enabled: true,
            one_shot: false,
            match_count: 0,
        }
    }

    /// Create a simple echo rule
    pub fn echo(name: &str) -> Self {
        Self::new(name, MatchCondition::Any, ResponseAction::Echo)
    }

    /// Answer lines matching `pattern` with `template` expanded from its
    /// captures
    pub fn template(name: &str, pattern: &str, template: &str) -> Self {
        Self::new(
            name,
            MatchCondition::Regex {
                pattern: pattern.to_string(),
            },
            ResponseAction::Template {
                pattern: pattern.to_string(),
                template: template.to_string(),
            },
        )
    }

    /// Swallow input matching `pattern`
    pub fn silent(name: &str, pattern: &str) -> Self {
        Self::new(
            name,
            MatchCondition::Regex {
                pattern: pattern.to_string(),
            },
            ResponseAction::None,
        )
    }

    /// Disable after the first match
    #[must_use]
    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }
}

/// Virtual device simulator
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    name: String,
    rules: Vec<ResponseRule>,
}

impl VirtualDevice {
    /// Create new virtual device
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
        }
    }

    /// Add a response rule; rules are tried in insertion order
    pub fn add_rule(&mut self, rule: ResponseRule) {
        self.rules.push(rule);
    }

    /// Add a rule ahead of all others
    pub fn add_rule_first(&mut self, rule: ResponseRule) {
        self.rules.insert(0, rule);
    }

    /// Remove rule by name
    pub fn remove_rule(&mut self, name: &str) {
        self.rules.retain(|r| r.name != name);
    }

    /// Get all rules
    pub fn rules(&self) -> &[ResponseRule] {
        &self.rules
    }

    /// Get device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process input and generate responses from the first matching rule
    pub fn process(&mut self, input: &[u8]) -> Vec<Vec<u8>> {
        let mut responses = Vec::new();
        if let Some(rule) = self
            .rules
            .iter_mut()
            .find(|r| r.enabled && r.condition.matches(input))
        {
            rule.match_count += 1;
            rule.action.respond(input, &mut responses);
            if rule.one_shot {
                rule.enabled = false;
            }
        }
        responses
    }
}

/// Preset device templates
pub struct DeviceTemplates;

impl DeviceTemplates {
    /// Simple echo device
    pub fn echo() -> VirtualDevice {
        let mut device = VirtualDevice::new("Echo Device");
        device.add_rule(ResponseRule::echo("echo_all"));
        device
    }

    /// Ramp meter controller acknowledging every request.
    ///
    /// Stores are echoed back in lowercase with the same id and fields;
    /// queries are answered with plausible values.
    pub fn ramp_meter() -> VirtualDevice {
        let mut device = VirtualDevice::new("Ramp Meter");
        device.add_rule(ResponseRule::template(
            "clock query",
            r"^CS,([0-9A-F]{4})\n$",
            "cs,${1},2024-05-01T06:00:00Z\n",
        ));
        device.add_rule(ResponseRule::template(
            "firmware",
            r"^FV,([0-9A-F]{4})\n$",
            "fv,${1},natch-1.4\n",
        ));
        device.add_rule(ResponseRule::template(
            "detector query",
            r"^DC,([0-9A-F]{4}),(\d+)\n$",
            "dc,${1},${2},0\n",
        ));
        device.add_rule(ResponseRule::template(
            "meter config query",
            r"^MC,([0-9A-F]{4}),(\d+)\n$",
            "mc,${1},${2},3,0,1714\n",
        ));
        device.add_rule(ResponseRule::template(
            "meter status query",
            r"^MS,([0-9A-F]{4}),(\d+)\n$",
            "ms,${1},${2},900\n",
        ));
        device.add_rule(ResponseRule::template(
            "pin query",
            r"^PS,([0-9A-F]{4}),(\d+)\n$",
            "ps,${1},${2},0\n",
        ));
        device.add_rule(ResponseRule::silent("event ack", r"^ds,"));
        for code in ["CS", "DC", "MC", "MS", "PS", "WD"] {
            device.add_rule(ResponseRule::template(
                &format!("store {}", code),
                &format!(r"^{}(,.*)\n$", code),
                &format!("{}${{1}}\n", code.to_lowercase()),
            ));
        }
        device
    }
}

/// Test-side view of a simulated link
#[derive(Clone)]
pub struct SimHandle {
    device: Arc<Mutex<VirtualDevice>>,
    inject: mpsc::UnboundedSender<Bytes>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    online: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl SimHandle {
    /// Deliver device-originated bytes to the link
    pub fn inject(&self, data: impl Into<Bytes>) {
        let _ = self.inject.send(data.into());
    }

    /// Everything sent to the device so far
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Sent frames as text
    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect()
    }

    /// Forget recorded traffic
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Make connection attempts fail or succeed
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Successful connection count
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Edit the device script while the link runs
    pub fn with_device<R>(&self, f: impl FnOnce(&mut VirtualDevice) -> R) -> R {
        f(&mut self.device.lock())
    }
}

/// Transport backed by a [`VirtualDevice`]
pub struct SimulatedTransport {
    device: Arc<Mutex<VirtualDevice>>,
    replies: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    online: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    connected: bool,
    stats: TransportStats,
}

impl SimulatedTransport {
    /// Create a transport and the handle used to observe it
    pub fn new(device: VirtualDevice) -> (Self, SimHandle) {
        let device = Arc::new(Mutex::new(device));
        let (replies, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let online = Arc::new(AtomicBool::new(true));
        let connects = Arc::new(AtomicUsize::new(0));
        let handle = SimHandle {
            device: device.clone(),
            inject: replies.clone(),
            sent: sent.clone(),
            online: online.clone(),
            connects: connects.clone(),
        };
        let transport = Self {
            device,
            replies,
            rx,
            sent,
            online,
            connects,
            connected: false,
            stats: TransportStats::default(),
        };
        (transport, handle)
    }
}

#[async_trait]
impl TransportTrait for SimulatedTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            self.stats.errors += 1;
            return Err(TransportError::ConnectionFailed(format!(
                "{}: offline",
                self.device.lock().name()
            )));
        }
        self.connected = true;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.sent.lock().push(Bytes::copy_from_slice(data));
        self.stats.bytes_sent += data.len() as u64;
        self.stats.packets_sent += 1;
        let responses = self.device.lock().process(data);
        for response in responses {
            let _ = self.replies.send(Bytes::from(response));
        }
        Ok(data.len())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(None) => Err(TransportError::Disconnected),
            Ok(Some(data)) if data.is_empty() => {
                self.connected = false;
                Err(TransportError::Disconnected)
            }
            Ok(Some(data)) => {
                self.stats.bytes_received += data.len() as u64;
                self.stats.packets_received += 1;
                Ok(data)
            }
        }
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Simulated
    }

    fn connection_info(&self) -> String {
        format!("sim:{}", self.device.lock().name())
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_device() {
        let mut device = DeviceTemplates::echo();
        let responses = device.process(b"Hello");
        assert_eq!(responses, vec![b"Hello".to_vec()]);
    }

    #[test]
    fn test_match_conditions() {
        let exact = MatchCondition::Exact {
            bytes: vec![0x01, 0x02, 0x03],
        };
        assert!(exact.matches(&[0x01, 0x02, 0x03]));
        assert!(!exact.matches(&[0x01, 0x02]));

        let text = MatchCondition::Text {
            text: "hello".to_string(),
            case_sensitive: false,
        };
        assert!(text.matches(b"Hello World"));

        let hex = MatchCondition::HexPattern {
            pattern: "F8 * 50".to_string(),
        };
        assert!(hex.matches(&[0xF8, 0x05, 0x50, 0x53]));
        assert!(!hex.matches(&[0xF8, 0x05, 0x51]));
    }

    #[test]
    fn test_template_echoes_message_id() {
        let mut device = DeviceTemplates::ramp_meter();
        let replies = device.process(b"MS,002A,0,2000\n");
        assert_eq!(replies, vec![b"ms,002A,0,2000\n".to_vec()]);
        let replies = device.process(b"MS,002B,0\n");
        assert_eq!(replies, vec![b"ms,002B,0,900\n".to_vec()]);
        assert!(device.process(b"ds,0003\n").is_empty());
    }

    #[test]
    fn test_one_shot_rule() {
        let mut device = DeviceTemplates::echo();
        device.add_rule_first(ResponseRule::silent("drop first", "^X").once());
        assert!(device.process(b"X1").is_empty());
        assert_eq!(device.process(b"X2"), vec![b"X2".to_vec()]);
        assert_eq!(device.rules()[0].match_count, 1);
    }

    #[test]
    fn test_offline_device_refuses_connection() {
        let (mut transport, handle) = SimulatedTransport::new(DeviceTemplates::ramp_meter());
        handle.set_online(false);
        assert!(tokio_test::block_on(transport.connect()).is_err());
        assert!(!transport.is_connected());
        assert!(matches!(
            tokio_test::block_on(transport.send(b"FV,0000\n")),
            Err(TransportError::Disconnected)
        ));
        assert_eq!(transport.stats().errors, 1);
        assert_eq!(handle.connects(), 0);
    }

    #[tokio::test]
    async fn test_close_action_ends_connection() {
        let mut device = VirtualDevice::new("feed");
        device.add_rule(ResponseRule::new(
            "reply and hang up",
            MatchCondition::Any,
            ResponseAction::Sequence(vec![
                ResponseAction::SendText {
                    text: "bye".to_string(),
                },
                ResponseAction::Close,
            ]),
        ));
        let (mut transport, _handle) = SimulatedTransport::new(device);
        transport.connect().await.unwrap();
        transport.send(b"GET").await.unwrap();

        let data = transport.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(&data[..], b"bye");
        assert!(matches!(
            transport.receive(Duration::from_millis(50)).await,
            Err(TransportError::Disconnected)
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_transport_round_trip() {
        let (mut transport, handle) = SimulatedTransport::new(DeviceTemplates::echo());
        handle.set_online(false);
        assert!(transport.connect().await.is_err());
        handle.set_online(true);
        transport.connect().await.unwrap();

        transport.send(b"ping").await.unwrap();
        let data = transport.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(&data[..], b"ping");

        handle.inject(Bytes::from_static(b"event"));
        let data = transport.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(&data[..], b"event");

        assert!(matches!(
            transport.receive(Duration::from_millis(5)).await,
            Err(TransportError::Timeout(_))
        ));
        assert_eq!(handle.sent_text(), vec!["ping".to_string()]);
        assert_eq!(handle.connects(), 1);
    }
}
