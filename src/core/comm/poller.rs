//! Link worker
//!
//! One task per communication link. The worker owns the transport, the
//! message id counter and the queue of pending transactions, and performs
//! one step at a time. The queue is re-evaluated between steps, so a
//! transaction in progress always reaches its next step boundary before
//! more urgent work is picked up.

use super::device::{CommEvent, Device, DeviceUpdate};
use super::error::{CommError, ErrorClass};
use super::message_id::MessageIdCounter;
use super::operation::{
    FailureKind, Operation, RecvStatus, Step, StepContext, StepKind, StepOutcome,
};
use super::priority::PriorityClass;
use super::queue::OpQueue;
use crate::core::transport::{TransportError, TransportTrait};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Link worker settings
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Link name
    pub name: String,
    /// Receive timeout for polling steps
    pub timeout: Duration,
    /// Failed attempts allowed before a transaction fails
    pub retries: u32,
    /// Minimum idle time between consecutive exchanges
    pub min_interval: Duration,
    /// How long a listening step waits for input per turn
    pub listen_interval: Duration,
    /// Device-originated lines kept for a listener; older ones are dropped
    pub stash_limit: usize,
}

impl PollerConfig {
    /// Create a configuration with default timing
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            timeout: Duration::from_millis(750),
            retries: 3,
            min_interval: Duration::ZERO,
            listen_interval: Duration::from_millis(250),
            stash_limit: 64,
        }
    }

    /// Set receive timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry bound
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// Set minimum inter-command spacing
    #[must_use]
    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set listen interval
    #[must_use]
    pub fn listen_interval(mut self, interval: Duration) -> Self {
        self.listen_interval = interval;
        self
    }

    /// Set how many device-originated lines are kept between listener turns
    #[must_use]
    pub fn stash_limit(mut self, limit: usize) -> Self {
        self.stash_limit = limit;
        self
    }
}

/// Link status as seen from outside the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    /// `INIT`, `OPEN`, `CLOSED` or the last connection error
    pub status: String,
    /// Consecutive failed attempts on the link
    pub consecutive_failures: u32,
    /// Transactions currently queued
    pub queued: usize,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            status: "INIT".to_string(),
            consecutive_failures: 0,
            queued: 0,
        }
    }
}

/// Commands processed by the worker between steps
enum PollerCommand<S: Step> {
    Enqueue(Operation<S>),
    Cancel(Uuid),
    CancelDevice(String),
    Shutdown,
}

/// Handle to a running link worker
pub struct PollerHandle<S: Step> {
    name: String,
    cmd_tx: mpsc::UnboundedSender<PollerCommand<S>>,
    status: Arc<RwLock<LinkStatus>>,
    task: JoinHandle<()>,
}

impl<S: Step> PollerHandle<S> {
    /// Link name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current link status
    pub fn status(&self) -> LinkStatus {
        self.status.read().clone()
    }

    /// Hand a transaction to the worker
    pub fn enqueue(&self, op: Operation<S>) -> Result<(), CommError> {
        self.cmd_tx
            .send(PollerCommand::Enqueue(op))
            .map_err(|_| CommError::Transport(TransportError::Disconnected))
    }

    /// Cancel a queued transaction
    pub fn cancel(&self, id: Uuid) {
        let _ = self.cmd_tx.send(PollerCommand::Cancel(id));
    }

    /// Cancel every queued transaction for a device
    pub fn cancel_device(&self, device: &str) {
        let _ = self.cmd_tx.send(PollerCommand::CancelDevice(device.to_string()));
    }

    /// Stop the worker, cancelling whatever is still queued
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(PollerCommand::Shutdown);
        if let Err(e) = self.task.await {
            tracing::warn!("{} worker ended abnormally: {}", self.name, e);
        }
    }
}

/// Link worker state
pub struct Poller<S: Step> {
    config: PollerConfig,
    transport: Box<dyn TransportTrait>,
    queue: OpQueue<S>,
    cmd_rx: mpsc::UnboundedReceiver<PollerCommand<S>>,
    events: broadcast::Sender<CommEvent>,
    status: Arc<RwLock<LinkStatus>>,
    message_ids: MessageIdCounter,
    unsolicited: VecDeque<Bytes>,
    tx_buf: BytesMut,
    rx_buf: BytesMut,
    last_exchange: Option<Instant>,
    listen_resume: Option<Instant>,
    consecutive_failures: u32,
}

impl<S: Step> Poller<S> {
    /// Start a worker task for a link
    pub fn spawn(
        config: PollerConfig,
        transport: Box<dyn TransportTrait>,
        events: broadcast::Sender<CommEvent>,
    ) -> PollerHandle<S> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(LinkStatus::default()));
        let name = config.name.clone();
        let poller = Self {
            config,
            transport,
            queue: OpQueue::new(),
            cmd_rx,
            events,
            status: status.clone(),
            message_ids: MessageIdCounter::new(),
            unsolicited: VecDeque::new(),
            tx_buf: BytesMut::with_capacity(1 << 12),
            rx_buf: BytesMut::with_capacity(1 << 12),
            last_exchange: None,
            listen_resume: None,
            consecutive_failures: 0,
        };
        tracing::info!("{} CREATED", name);
        let task = tokio::spawn(poller.run());
        PollerHandle {
            name,
            cmd_tx,
            status,
            task,
        }
    }

    async fn run(mut self) {
        loop {
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(cmd) => {
                        if !self.handle_command(cmd) {
                            return self.destroy().await;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return self.destroy().await;
                    }
                }
            }
            self.publish_status();
            if let Some(resume) = self.listen_backoff() {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd) {
                                return self.destroy().await;
                            }
                        }
                        None => return self.destroy().await,
                    },
                    _ = tokio::time::sleep_until(resume) => self.listen_resume = None,
                }
                continue;
            }
            match self.queue.pop() {
                Some(op) => self.perform(op).await,
                None => match self.cmd_rx.recv().await {
                    Some(cmd) => {
                        if !self.handle_command(cmd) {
                            return self.destroy().await;
                        }
                    }
                    None => return self.destroy().await,
                },
            }
        }
    }

    /// Deadline to wait for when only listeners are due and the link is down
    fn listen_backoff(&self) -> Option<Instant> {
        let resume = self.listen_resume?;
        if resume <= Instant::now() {
            return None;
        }
        match self.queue.peek().and_then(Operation::step) {
            Some(step) if step.kind() == StepKind::Listen => Some(resume),
            _ => None,
        }
    }

    /// Apply a command; returns `false` on shutdown
    fn handle_command(&mut self, cmd: PollerCommand<S>) -> bool {
        match cmd {
            PollerCommand::Enqueue(op) => self.add_op(op),
            PollerCommand::Cancel(id) => {
                if let Some(op) = self.queue.remove(id) {
                    self.cancel_op(op, "CANCELLED");
                }
            }
            PollerCommand::CancelDevice(device) => {
                for op in self.queue.remove_device(&device) {
                    self.cancel_op(op, "DEVICE REMOVED");
                }
            }
            PollerCommand::Shutdown => return false,
        }
        true
    }

    fn add_op(&mut self, mut op: Operation<S>) {
        if op.is_done() || op.device().is_removed() {
            tracing::debug!("{} DROPPING {}", self.config.name, op);
            op.cancel("DROPPED");
        } else if op.is_coalescing() && self.queue.contains_equivalent(&op) {
            tracing::debug!("{} SKIPPING {}", self.config.name, op);
            op.cancel("SKIPPED");
        } else {
            tracing::debug!("{} ADDING {}", self.config.name, op);
            self.queue.push(op);
        }
    }

    async fn destroy(mut self) {
        for op in self.queue.drain() {
            self.cancel_op(op, "QUEUE DRAINED");
        }
        self.close().await;
        self.publish_status();
        tracing::info!("{} DESTROYED", self.config.name);
    }

    async fn perform(&mut self, mut op: Operation<S>) {
        if op.device().is_removed() {
            self.cancel_op(op, "DEVICE REMOVED");
            return;
        }
        let Some(kind) = op.step().map(Step::kind) else {
            self.complete(op);
            return;
        };
        match self.perform_step(&mut op, kind).await {
            Ok(()) => self.advance(op, kind),
            Err(e) => self.handle_error(op, kind, e).await,
        }
    }

    async fn perform_step(&mut self, op: &mut Operation<S>, kind: StepKind) -> Result<(), CommError> {
        let device = Arc::clone(op.device());
        let Some(step) = op.step_mut() else {
            return Ok(());
        };
        device.set_status(step.describe());

        self.tx_buf.clear();
        let updates = {
            let mut ctx =
                StepContext::new(&device, &mut self.message_ids, &mut self.unsolicited);
            step.poll(&mut ctx, &mut self.tx_buf)?;
            ctx.take_updates()
        };
        self.publish(&device, updates);

        self.ensure_open().await?;
        if !self.tx_buf.is_empty() {
            self.pace().await;
            tracing::debug!("{} SEND {}", self.config.name, hex::encode(&self.tx_buf));
            self.transport.send(&self.tx_buf).await?;
            self.last_exchange = Some(Instant::now());
        }

        match kind {
            StepKind::Send => Ok(()),
            StepKind::Poll => self.poll_response(&device, step).await,
            StepKind::Listen => self.listen(&device, step).await,
        }
    }

    /// Read until the step is satisfied or the link timeout expires
    async fn poll_response(&mut self, device: &Device, step: &mut S) -> Result<(), CommError> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CommError::Timeout);
            }
            match self.transport.receive(remaining).await {
                Ok(data) => self.record_received(&data),
                Err(TransportError::Timeout(_)) => return Err(CommError::Timeout),
                Err(TransportError::Disconnected) => {
                    if self.feed_closed(device, step)? == RecvStatus::Complete {
                        self.close().await;
                        self.last_exchange = Some(Instant::now());
                        return Ok(());
                    }
                    return Err(TransportError::Disconnected.into());
                }
                Err(e) => return Err(e.into()),
            }
            if self.feed(device, step)? == RecvStatus::Complete {
                self.last_exchange = Some(Instant::now());
                return Ok(());
            }
        }
    }

    /// Wait up to the listen interval for device-originated input
    async fn listen(&mut self, device: &Device, step: &mut S) -> Result<(), CommError> {
        let deadline = Instant::now() + self.config.listen_interval;
        loop {
            if self.feed(device, step)? == RecvStatus::Complete {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match self.transport.receive(remaining).await {
                Ok(data) => self.record_received(&data),
                Err(TransportError::Timeout(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn record_received(&mut self, data: &[u8]) {
        tracing::debug!("{} RECV {}", self.config.name, hex::encode(data));
        self.rx_buf.extend_from_slice(data);
    }

    /// Hand buffered input to the step
    fn feed(&mut self, device: &Device, step: &mut S) -> Result<RecvStatus, CommError> {
        let (status, updates) = {
            let mut ctx = StepContext::new(device, &mut self.message_ids, &mut self.unsolicited);
            let status = step.recv(&mut ctx, &mut self.rx_buf);
            (status, ctx.take_updates())
        };
        self.publish(device, updates);
        self.trim_unsolicited();
        status
    }

    /// Hand buffered input to a step after the peer closed the connection
    fn feed_closed(&mut self, device: &Device, step: &mut S) -> Result<RecvStatus, CommError> {
        let (status, updates) = {
            let mut ctx = StepContext::new(device, &mut self.message_ids, &mut self.unsolicited);
            let status = step.recv_closed(&mut ctx, &mut self.rx_buf);
            (status, ctx.take_updates())
        };
        self.publish(device, updates);
        status
    }

    fn trim_unsolicited(&mut self) {
        let excess = self.unsolicited.len().saturating_sub(self.config.stash_limit);
        if excess > 0 {
            tracing::debug!(
                "{} dropping {} stashed lines",
                self.config.name,
                excess
            );
            self.unsolicited.drain(..excess);
        }
    }

    /// Sleep off the remainder of the minimum inter-command spacing
    async fn pace(&mut self) {
        if self.config.min_interval.is_zero() {
            return;
        }
        if let Some(last) = self.last_exchange {
            let ready = last + self.config.min_interval;
            if ready > Instant::now() {
                tokio::time::sleep_until(ready).await;
            }
        }
    }

    async fn ensure_open(&mut self) -> Result<(), CommError> {
        if self.transport.is_connected() {
            return Ok(());
        }
        match self.transport.connect().await {
            Ok(()) => {
                self.rx_buf.clear();
                self.listen_resume = None;
                self.set_status("OPEN");
                tracing::info!(
                    "{} OPEN {}",
                    self.config.name,
                    self.transport.connection_info()
                );
                Ok(())
            }
            Err(e) => {
                self.set_status(&e.to_string());
                Err(e.into())
            }
        }
    }

    async fn close(&mut self) {
        if self.transport.is_connected() {
            if let Err(e) = self.transport.disconnect().await {
                tracing::debug!("{} close: {}", self.config.name, e);
            }
        }
        self.rx_buf.clear();
        self.set_status("CLOSED");
    }

    fn advance(&mut self, mut op: Operation<S>, kind: StepKind) {
        if kind != StepKind::Listen {
            op.device().record_success();
            self.consecutive_failures = 0;
        }
        let Some(step) = op.take_step() else {
            self.complete(op);
            return;
        };
        match step.next() {
            StepOutcome::Continue(step) => {
                op.set_step(step);
                if kind == StepKind::Listen {
                    self.requeue_idle(op);
                } else {
                    let attempts = op.record_failure();
                    if attempts >= self.config.retries {
                        self.fail(op, FailureKind::Comm, "NOT RECEIVED");
                    } else {
                        self.queue.push(op);
                    }
                }
            }
            StepOutcome::Advance(step) => {
                op.reset_failures();
                let listening = step.kind() == StepKind::Listen;
                op.set_step(step);
                if listening {
                    self.requeue_idle(op);
                } else {
                    self.queue.push(op);
                }
            }
            StepOutcome::Done => self.complete(op),
            StepOutcome::Failed(msg) => self.fail(op, FailureKind::Protocol, msg),
        }
    }

    fn requeue_idle(&mut self, mut op: Operation<S>) {
        op.set_priority(PriorityClass::Idle);
        self.queue.push_back(op);
    }

    async fn handle_error(&mut self, mut op: Operation<S>, kind: StepKind, e: CommError) {
        match e.class() {
            ErrorClass::Transient => {
                tracing::warn!("{} {} {}", self.config.name, op, e);
                op.device().record_comm_failure();
                self.consecutive_failures += 1;
                if e.needs_reconnect() {
                    self.close().await;
                } else {
                    self.rx_buf.clear();
                }
                if kind == StepKind::Listen {
                    // listeners outlive link outages
                    op.device().set_fault(e.to_string());
                    self.listen_resume = Some(Instant::now() + self.config.listen_interval);
                    self.requeue_idle(op);
                    return;
                }
                let attempts = op.record_failure();
                if attempts >= self.config.retries {
                    self.fail(op, FailureKind::Comm, e.to_string());
                } else {
                    op.device()
                        .set_status(format!("{} (RETRY {})", e, attempts));
                    self.queue.push(op);
                }
            }
            ErrorClass::Protocol => {
                self.rx_buf.clear();
                if self.transport.is_connected() {
                    if let Err(e) = self.transport.drain().await {
                        tracing::debug!("{} drain: {}", self.config.name, e);
                    }
                }
                self.fail(op, FailureKind::Protocol, e.to_string());
            }
            ErrorClass::Configuration => {
                self.fail(op, FailureKind::Configuration, e.to_string());
            }
        }
    }

    fn publish(&self, device: &Device, updates: Vec<DeviceUpdate>) {
        for update in updates {
            device.apply(&update);
            self.emit(CommEvent::Updated {
                device: device.name().to_string(),
                update,
            });
        }
    }

    fn complete(&mut self, mut op: Operation<S>) {
        tracing::info!("{} DONE {}", self.config.name, op);
        op.device().set_status("");
        self.emit(CommEvent::Completed {
            device: op.device().name().to_string(),
            operation: op.name().to_string(),
        });
        op.finish();
    }

    fn fail(&mut self, mut op: Operation<S>, kind: FailureKind, msg: impl Into<String>) {
        let message = msg.into();
        tracing::warn!("{} FAILED {}: {}", self.config.name, op, message);
        let device = op.device().name().to_string();
        let operation = op.name().to_string();
        op.device().set_fault(message.clone());
        op.device().set_status("");
        let event = match kind {
            FailureKind::Comm => CommEvent::CommError {
                device,
                operation,
                message: message.clone(),
            },
            FailureKind::Protocol => CommEvent::ProtocolError {
                device,
                operation,
                message: message.clone(),
            },
            FailureKind::Configuration => CommEvent::ConfigError {
                device,
                operation,
                message: message.clone(),
            },
        };
        self.emit(event);
        op.fail(kind, message);
    }

    fn cancel_op(&mut self, mut op: Operation<S>, reason: &str) {
        tracing::info!("{} CANCELLED {}: {}", self.config.name, op, reason);
        op.device().set_status("");
        self.emit(CommEvent::Cancelled {
            device: op.device().name().to_string(),
            operation: op.name().to_string(),
        });
        op.cancel(reason);
    }

    fn emit(&self, event: CommEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: &str) {
        self.status.write().status = status.to_string();
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.consecutive_failures = self.consecutive_failures;
        status.queued = self.queue.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comm::device::DeviceKind;
    use crate::core::comm::operation::OperationState;
    use crate::core::transport::MockTransportTrait;

    #[derive(Debug)]
    struct Ping;

    impl Step for Ping {
        fn kind(&self) -> StepKind {
            StepKind::Poll
        }

        fn describe(&self) -> String {
            "PING".into()
        }

        fn poll(&mut self, _ctx: &mut StepContext<'_>, tx: &mut BytesMut) -> Result<(), CommError> {
            tx.extend_from_slice(b"PING\n");
            Ok(())
        }

        fn recv(
            &mut self,
            _ctx: &mut StepContext<'_>,
            rx: &mut BytesMut,
        ) -> Result<RecvStatus, CommError> {
            rx.clear();
            Ok(RecvStatus::Complete)
        }

        fn next(self) -> StepOutcome<Self> {
            StepOutcome::Done
        }
    }

    #[derive(Debug)]
    struct BadDrop;

    impl Step for BadDrop {
        fn kind(&self) -> StepKind {
            StepKind::Send
        }

        fn describe(&self) -> String {
            "BAD DROP".into()
        }

        fn poll(&mut self, _ctx: &mut StepContext<'_>, _tx: &mut BytesMut) -> Result<(), CommError> {
            Err(CommError::config("drop 0"))
        }

        fn next(self) -> StepOutcome<Self> {
            StepOutcome::Done
        }
    }

    fn device() -> Arc<Device> {
        Arc::new(Device::new("D1", "link1", DeviceKind::Camera { drop: 1 }))
    }

    #[tokio::test]
    async fn test_connection_refused_fails_after_retries() {
        let mut transport = MockTransportTrait::new();
        transport.expect_is_connected().return_const(false);
        transport
            .expect_connect()
            .times(2)
            .returning(|| Err(TransportError::ConnectionFailed("refused".into())));
        transport.expect_disconnect().returning(|| Ok(()));

        let (events, mut rx) = broadcast::channel(16);
        let handle = Poller::spawn(PollerConfig::new("link1").retries(2), Box::new(transport), events);

        let dev = device();
        let mut op = Operation::new("ping", dev.clone(), PriorityClass::Command, Ping);
        let completion = op.completion();
        handle.enqueue(op).unwrap();

        let result = completion.wait().await;
        assert!(matches!(result.state, OperationState::Failed(_)));
        assert_eq!(result.failure, Some(FailureKind::Comm));
        assert_eq!(dev.state().comm_failures, 2);

        let mut comm_errors = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CommEvent::CommError { .. }) {
                comm_errors += 1;
            }
        }
        assert_eq!(comm_errors, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_error_sends_nothing() {
        let mut transport = MockTransportTrait::new();
        transport.expect_is_connected().return_const(false);
        transport.expect_connect().never();
        transport.expect_send().never();

        let (events, _rx) = broadcast::channel(16);
        let handle = Poller::spawn(PollerConfig::new("link1"), Box::new(transport), events);

        let dev = device();
        let mut op = Operation::new("bad", dev.clone(), PriorityClass::Command, BadDrop);
        let completion = op.completion();
        handle.enqueue(op).unwrap();

        let result = completion.wait().await;
        assert_eq!(result.failure, Some(FailureKind::Configuration));
        assert!(dev.fault().unwrap().contains("drop 0"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_request_after_connect_is_sent() {
        let mut transport = MockTransportTrait::new();
        transport.expect_is_connected().return_const(false);
        transport.expect_connect().times(1).returning(|| Ok(()));
        transport
            .expect_connection_info()
            .return_const("mock".to_string());
        transport
            .expect_send()
            .withf(|data: &[u8]| data == b"PING\n")
            .times(1)
            .returning(|data| Ok(data.len()));
        transport
            .expect_receive()
            .returning(|_| Ok(Bytes::from_static(b"ping\n")));

        let (events, _rx) = broadcast::channel(16);
        let handle = Poller::spawn(PollerConfig::new("link1"), Box::new(transport), events);

        let mut op = Operation::new("ping", device(), PriorityClass::Command, Ping);
        let completion = op.completion();
        handle.enqueue(op).unwrap();

        assert_eq!(completion.wait().await.state, OperationState::Done);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_round_trip_completes() {
        let mut transport = MockTransportTrait::new();
        transport.expect_is_connected().return_const(true);
        transport.expect_disconnect().returning(|| Ok(()));
        transport.expect_send().returning(|data| Ok(data.len()));
        transport
            .expect_receive()
            .returning(|_| Ok(Bytes::from_static(b"ping\n")));

        let (events, _rx) = broadcast::channel(16);
        let handle = Poller::spawn(PollerConfig::new("link1"), Box::new(transport), events);

        let dev = device();
        let mut op = Operation::new("ping", dev.clone(), PriorityClass::Command, Ping);
        let completion = op.completion();
        handle.enqueue(op).unwrap();

        assert_eq!(completion.wait().await.state, OperationState::Done);
        assert!(dev.state().last_success.is_some());
        handle.shutdown().await;
    }
}
