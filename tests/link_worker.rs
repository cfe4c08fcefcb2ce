//! Link worker scheduling, retry and cancellation behavior

mod common;

use bytes::BytesMut;
use common::{add_meter, drain, eventually, fast_config, link, within};
use fieldpoll_core::core::comm::{
    CommError, CommEvent, Device, DeviceKind, FailureKind, LinkProtocol, Operation,
    OperationState, Poller, PriorityClass, Step, StepContext, StepKind, StepOutcome,
};
use fieldpoll_core::core::simulator::{
    DeviceTemplates, MatchCondition, ResponseAction, ResponseRule, SimulatedTransport,
    VirtualDevice,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Writes its label and finishes
#[derive(Debug)]
struct Tag(&'static str);

impl Step for Tag {
    fn kind(&self) -> StepKind {
        StepKind::Send
    }

    fn describe(&self) -> String {
        self.0.to_string()
    }

    fn poll(&mut self, _ctx: &mut StepContext<'_>, tx: &mut BytesMut) -> Result<(), CommError> {
        tx.extend_from_slice(self.0.as_bytes());
        tx.extend_from_slice(b"\n");
        Ok(())
    }

    fn next(self) -> StepOutcome<Self> {
        StepOutcome::Done
    }
}

#[tokio::test]
async fn test_queue_runs_highest_priority_first() {
    let (transport, sim) = SimulatedTransport::new(VirtualDevice::new("sink"));
    let (events, _rx) = broadcast::channel(64);
    let handle = Poller::spawn(fast_config("tags"), Box::new(transport), events);
    let device = Arc::new(Device::new("C1", "tags", DeviceKind::Camera { drop: 1 }));

    let order = [
        ("idle", PriorityClass::Idle),
        ("low", PriorityClass::PollLow),
        ("command", PriorityClass::Command),
        ("high", PriorityClass::PollHigh),
        ("settings", PriorityClass::Settings),
        ("command2", PriorityClass::Command),
    ];
    // all queued before the worker gets to run
    let mut completions = Vec::new();
    for (label, priority) in order {
        let mut op = Operation::new(label, Arc::clone(&device), priority, Tag(label));
        completions.push(op.completion());
        handle.enqueue(op).unwrap();
    }
    for completion in completions {
        assert_eq!(within(completion.wait()).await.state, OperationState::Done);
    }

    assert_eq!(
        sim.sent_text(),
        vec!["command\n", "command2\n", "settings\n", "high\n", "low\n", "idle\n"]
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn test_silent_device_fails_once_after_retries() {
    let (dispatcher, sim) = link(
        LinkProtocol::Natch,
        fast_config("natch1"),
        VirtualDevice::new("mute"),
    );
    add_meter(&dispatcher, "M1", "natch1");
    let mut rx = dispatcher.subscribe();

    let completion = dispatcher
        .query_firmware("M1", PriorityClass::Command)
        .unwrap();
    let result = within(completion.wait()).await;

    assert!(matches!(result.state, OperationState::Failed(_)));
    assert_eq!(result.failure, Some(FailureKind::Comm));
    // each attempt gets a fresh id
    assert_eq!(sim.sent_text(), vec!["FV,0000\n", "FV,0001\n", "FV,0002\n"]);

    let device = dispatcher.device("M1").unwrap();
    assert_eq!(device.state().comm_failures, 3);
    assert!(device.fault().is_some());

    let comm_errors = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, CommEvent::CommError { .. }))
        .count();
    assert_eq!(comm_errors, 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_identical_poll_is_skipped() {
    let (dispatcher, sim) = link(
        LinkProtocol::Natch,
        fast_config("natch1"),
        DeviceTemplates::ramp_meter(),
    );
    add_meter(&dispatcher, "M1", "natch1");

    let first = dispatcher
        .query_status("M1", PriorityClass::PollHigh)
        .unwrap();
    let second = dispatcher
        .query_status("M1", PriorityClass::PollHigh)
        .unwrap();

    assert_eq!(within(first.wait()).await.state, OperationState::Done);
    assert_eq!(
        within(second.wait()).await.state,
        OperationState::Cancelled("SKIPPED".to_string())
    );
    // config, rate and beacon once
    assert_eq!(sim.sent().len(), 3);
    assert_eq!(dispatcher.device("M1").unwrap().state().release_rate, Some(900));
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_removed_device_work_is_cancelled() {
    let (dispatcher, sim) = link(
        LinkProtocol::Natch,
        fast_config("natch1"),
        DeviceTemplates::ramp_meter(),
    );
    add_meter(&dispatcher, "M1", "natch1");
    let mut rx = dispatcher.subscribe();

    let status = dispatcher
        .query_status("M1", PriorityClass::PollHigh)
        .unwrap();
    let rate = dispatcher.set_release_rate("M1", 1200).unwrap();
    dispatcher.remove_device("M1").unwrap();

    for completion in [status, rate] {
        let result = within(completion.wait()).await;
        assert!(matches!(result.state, OperationState::Cancelled(_)));
        assert_eq!(result.failure, None);
    }
    assert!(sim.sent().is_empty());

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .all(|e| matches!(e, CommEvent::Cancelled { .. })));
    assert!(dispatcher.set_release_rate("M1", 900).is_err());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_queue() {
    let (dispatcher, sim) = link(
        LinkProtocol::Natch,
        fast_config("natch1"),
        DeviceTemplates::ramp_meter(),
    );
    add_meter(&dispatcher, "M1", "natch1");

    let completion = dispatcher.send_settings("M1").unwrap();
    dispatcher.shutdown().await;

    assert_eq!(
        within(completion.wait()).await.state,
        OperationState::Cancelled("QUEUE DRAINED".to_string())
    );
    assert!(sim.sent().is_empty());
}

#[tokio::test]
async fn test_link_recovers_after_outage() {
    let (dispatcher, sim) = link(
        LinkProtocol::Natch,
        fast_config("natch1"),
        DeviceTemplates::ramp_meter(),
    );
    add_meter(&dispatcher, "M1", "natch1");

    sim.set_online(false);
    let result = within(
        dispatcher
            .query_firmware("M1", PriorityClass::Command)
            .unwrap()
            .wait(),
    )
    .await;
    assert_eq!(result.failure, Some(FailureKind::Comm));
    assert!(eventually(|| {
        dispatcher.link_status("natch1").unwrap().consecutive_failures == 3
    })
    .await);

    sim.set_online(true);
    let result = within(
        dispatcher
            .query_firmware("M1", PriorityClass::Command)
            .unwrap()
            .wait(),
    )
    .await;
    assert_eq!(result.state, OperationState::Done);
    assert_eq!(sim.connects(), 1);
    assert_eq!(
        dispatcher.device("M1").unwrap().state().firmware.as_deref(),
        Some("natch-1.4")
    );
    assert!(eventually(|| {
        dispatcher.link_status("natch1").unwrap().consecutive_failures == 0
    })
    .await);
    dispatcher.shutdown().await;
}

fn stale_firmware_reply() -> ResponseRule {
    ResponseRule::new(
        "stale firmware",
        MatchCondition::Regex {
            pattern: "^FV,".to_string(),
        },
        ResponseAction::SendText {
            text: "fv,0FFF,0.1\n".to_string(),
        },
    )
}

#[tokio::test]
async fn test_stale_reply_is_retried_with_fresh_id() {
    let mut device = DeviceTemplates::ramp_meter();
    device.add_rule_first(stale_firmware_reply().once());
    let (dispatcher, sim) = link(LinkProtocol::Natch, fast_config("natch1"), device);
    add_meter(&dispatcher, "M1", "natch1");

    let completion = dispatcher
        .query_firmware("M1", PriorityClass::Command)
        .unwrap();
    assert_eq!(within(completion.wait()).await.state, OperationState::Done);

    assert_eq!(sim.sent_text(), vec!["FV,0000\n", "FV,0001\n"]);
    let state = dispatcher.device("M1").unwrap().state();
    assert_eq!(state.firmware.as_deref(), Some("natch-1.4"));
    assert_eq!(state.comm_failures, 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_stale_replies_are_never_accepted() {
    let mut device = DeviceTemplates::ramp_meter();
    device.add_rule_first(stale_firmware_reply());
    let (dispatcher, sim) = link(LinkProtocol::Natch, fast_config("natch1"), device);
    add_meter(&dispatcher, "M1", "natch1");

    let result = within(
        dispatcher
            .query_firmware("M1", PriorityClass::Command)
            .unwrap()
            .wait(),
    )
    .await;
    assert_eq!(result.failure, Some(FailureKind::Comm));
    assert_eq!(sim.sent_text(), vec!["FV,0000\n", "FV,0001\n", "FV,0002\n"]);
    assert_eq!(dispatcher.device("M1").unwrap().state().firmware, None);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_poll_during_redirect_is_skipped() {
    let mut device = DeviceTemplates::ramp_meter();
    device.add_rule_first(
        ResponseRule::template(
            "lost config",
            r"^MC,([0-9A-F]{4}),(\d+)\n$",
            "mc,${1},${2},0,0,0\n",
        )
        .once(),
    );
    let config = fast_config("natch1").min_interval(Duration::from_millis(10));
    let (dispatcher, sim) = link(LinkProtocol::Natch, config, device);
    add_meter(&dispatcher, "M1", "natch1");

    let first = dispatcher
        .query_status("M1", PriorityClass::PollHigh)
        .unwrap();
    // part way through the settings push
    assert!(eventually(|| sim.sent().len() >= 5).await);
    let second = dispatcher
        .query_status("M1", PriorityClass::PollHigh)
        .unwrap();

    assert_eq!(
        within(second.wait()).await.state,
        OperationState::Cancelled("SKIPPED".to_string())
    );
    assert_eq!(within(first.wait()).await.state, OperationState::Done);
    assert_eq!(sim.sent().len(), 36);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_listener_outage_does_not_delay_commands() {
    let config = fast_config("natch1").listen_interval(Duration::from_millis(500));
    let (dispatcher, sim) = link(LinkProtocol::Natch, config, DeviceTemplates::ramp_meter());
    add_meter(&dispatcher, "M1", "natch1");
    let meter = dispatcher.device("M1").unwrap();

    sim.set_online(false);
    let _listener = dispatcher.listen_detectors("M1").unwrap();
    assert!(eventually(|| meter.state().comm_failures == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // one failed turn, then the listener waits out its interval
    assert_eq!(meter.state().comm_failures, 1);

    sim.set_online(true);
    let start = Instant::now();
    let completion = dispatcher.set_release_rate("M1", 600).unwrap();
    assert_eq!(within(completion.wait()).await.state, OperationState::Done);
    assert!(start.elapsed() < Duration::from_millis(300));
    dispatcher.shutdown().await;
}
