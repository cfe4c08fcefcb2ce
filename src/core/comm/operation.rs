//! Transactions and their step chains
//!
//! A transaction ([`Operation`]) is bound to one device and owns the step it
//! is currently performing. Steps are protocol-specific enums implementing
//! [`Step`]; the only way a chain advances or ends is [`Step::next`].

use super::device::{Device, DeviceUpdate};
use super::error::CommError;
use super::message_id::{MessageId, MessageIdCounter};
use super::priority::PriorityClass;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

/// How the link worker drives a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Transmit, then wait for the reply within the link timeout
    Poll,
    /// Transmit only; no reply is expected
    Send,
    /// Wait for unsolicited input; a timeout is not a failure
    Listen,
}

/// Result of feeding received bytes to a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// The step has what it needs
    Complete,
    /// Keep reading
    Incomplete,
}

/// Where a step chain goes after a step was performed
#[derive(Debug)]
pub enum StepOutcome<S> {
    /// Perform the same step again
    Continue(S),
    /// Move on to a new step
    Advance(S),
    /// Transaction finished successfully
    Done,
    /// Transaction failed with a reason
    Failed(String),
}

/// Per-step access to link-scoped state
pub struct StepContext<'a> {
    device: &'a Device,
    message_ids: &'a mut MessageIdCounter,
    unsolicited: &'a mut VecDeque<Bytes>,
    updates: Vec<DeviceUpdate>,
}

impl<'a> StepContext<'a> {
    /// Create a context for one step invocation
    pub fn new(
        device: &'a Device,
        message_ids: &'a mut MessageIdCounter,
        unsolicited: &'a mut VecDeque<Bytes>,
    ) -> Self {
        Self {
            device,
            message_ids,
            unsolicited,
            updates: Vec::new(),
        }
    }

    /// Device the transaction is bound to
    pub fn device(&self) -> &Device {
        self.device
    }

    /// Take a fresh message id for an outbound request
    pub fn next_message_id(&mut self) -> MessageId {
        self.message_ids.advance()
    }

    /// Queue a device update for the worker to apply and broadcast
    pub fn notify(&mut self, update: DeviceUpdate) {
        self.updates.push(update);
    }

    /// Keep device-originated input for a listener on the same link
    pub fn stash_unsolicited(&mut self, data: Bytes) {
        self.unsolicited.push_back(data);
    }

    /// Take all stashed device-originated input
    pub fn take_unsolicited(&mut self) -> Vec<Bytes> {
        self.unsolicited.drain(..).collect()
    }

    /// Take updates queued by the step
    pub fn take_updates(&mut self) -> Vec<DeviceUpdate> {
        std::mem::take(&mut self.updates)
    }
}

/// One unit of device interaction
pub trait Step: Sized + Send + fmt::Debug + 'static {
    /// How the worker drives this step
    fn kind(&self) -> StepKind;

    /// Short text for the device status display
    fn describe(&self) -> String;

    /// Encode the outbound request into `tx`.
    ///
    /// Errors raised here happen before any bytes are sent.
    fn poll(&mut self, ctx: &mut StepContext<'_>, tx: &mut BytesMut) -> Result<(), CommError>;

    /// Consume received bytes from `rx`
    fn recv(
        &mut self,
        _ctx: &mut StepContext<'_>,
        _rx: &mut BytesMut,
    ) -> Result<RecvStatus, CommError> {
        Ok(RecvStatus::Complete)
    }

    /// Consume what is left in `rx` after the peer closed the connection.
    ///
    /// Replies delimited by connection close complete here; anything else
    /// stays incomplete and the exchange counts as a lost connection.
    fn recv_closed(
        &mut self,
        _ctx: &mut StepContext<'_>,
        _rx: &mut BytesMut,
    ) -> Result<RecvStatus, CommError> {
        Ok(RecvStatus::Incomplete)
    }

    /// Decide what follows this step
    fn next(self) -> StepOutcome<Self>;
}

/// Lifecycle state of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    /// Queued or in progress
    Pending,
    /// Completed successfully
    Done,
    /// Failed with a fault description
    Failed(String),
    /// Cancelled with a reason
    Cancelled(String),
}

impl OperationState {
    /// Check if the state is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Done => write!(f, "DONE"),
            Self::Failed(msg) => write!(f, "FAILED: {}", msg),
            Self::Cancelled(msg) => write!(f, "CANCELLED: {}", msg),
        }
    }
}

/// Failure class recorded when a transaction fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retries exhausted on a transient error
    Comm,
    /// Framing or decode disagreement
    Protocol,
    /// Rejected by configuration checks
    Configuration,
}

/// Terminal status delivered through a [`Completion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// Transaction id
    pub id: Uuid,
    /// Terminal state
    pub state: OperationState,
    /// Failure class, when failed
    pub failure: Option<FailureKind>,
}

/// A device transaction
pub struct Operation<S: Step> {
    id: Uuid,
    name: String,
    device: Arc<Device>,
    priority: PriorityClass,
    step: Option<S>,
    state: OperationState,
    failures: u32,
    seq: Option<u64>,
    coalesce: bool,
    completion: Option<oneshot::Sender<OperationResult>>,
}

impl<S: Step> Operation<S> {
    /// Create a transaction starting at `step`
    pub fn new(name: &str, device: Arc<Device>, priority: PriorityClass, step: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            device,
            priority,
            step: Some(step),
            state: OperationState::Pending,
            failures: 0,
            seq: None,
            coalesce: false,
            completion: None,
        }
    }

    /// Skip this transaction if an equal one is already queued
    #[must_use]
    pub fn coalescing(mut self) -> Self {
        self.coalesce = true;
        self
    }

    /// Get a handle resolving when the transaction finishes
    pub fn completion(&mut self) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        Completion { id: self.id, rx }
    }

    /// Transaction id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Transaction name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device handle
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Priority class
    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    /// Change the priority class
    pub fn set_priority(&mut self, priority: PriorityClass) {
        self.priority = priority;
    }

    /// Current step
    pub fn step(&self) -> Option<&S> {
        self.step.as_ref()
    }

    /// Current step, mutably
    pub fn step_mut(&mut self) -> Option<&mut S> {
        self.step.as_mut()
    }

    /// Take the current step out to compute its successor
    pub fn take_step(&mut self) -> Option<S> {
        self.step.take()
    }

    /// Install the next step
    pub fn set_step(&mut self, step: S) {
        self.step = Some(step);
    }

    /// Lifecycle state
    pub fn state(&self) -> &OperationState {
        &self.state
    }

    /// Check if the transaction reached a terminal state
    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether duplicate submissions are skipped
    pub fn is_coalescing(&self) -> bool {
        self.coalesce
    }

    /// Queue sequence number, assigned on first enqueue
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    /// Assign the queue sequence number
    pub fn set_seq(&mut self, seq: u64) {
        self.seq = Some(seq);
    }

    /// Consecutive failed attempts of the current step
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Count a failed attempt, returning the new total
    pub fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    /// Reset the failed-attempt count
    pub fn reset_failures(&mut self) {
        self.failures = 0;
    }

    /// Check if `other` would duplicate this transaction
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.name == other.name && self.device.name() == other.device.name()
    }

    /// Finish successfully
    pub fn finish(&mut self) {
        self.step = None;
        self.complete(OperationState::Done, None);
    }

    /// Finish with a failure
    pub fn fail(&mut self, kind: FailureKind, msg: impl Into<String>) {
        self.step = None;
        self.complete(OperationState::Failed(msg.into()), Some(kind));
    }

    /// Finish by cancellation
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.step = None;
        self.complete(OperationState::Cancelled(reason.into()), None);
    }

    fn complete(&mut self, state: OperationState, failure: Option<FailureKind>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state.clone();
        if let Some(tx) = self.completion.take() {
            // Receiver may have been dropped; nobody is waiting then
            let _ = tx.send(OperationResult {
                id: self.id,
                state,
                failure,
            });
        }
    }
}

impl<S: Step> fmt::Display for Operation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.device.name(), self.name, self.priority)
    }
}

impl<S: Step> fmt::Debug for Operation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("device", &self.device.name())
            .field("priority", &self.priority)
            .field("step", &self.step)
            .field("state", &self.state)
            .finish()
    }
}

impl<S: Step> Drop for Operation<S> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.cancel("DROPPED");
        }
    }
}

/// Handle resolving to a transaction's terminal status
#[derive(Debug)]
pub struct Completion {
    id: Uuid,
    rx: oneshot::Receiver<OperationResult>,
}

impl Completion {
    /// Transaction id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the transaction to finish
    pub async fn wait(self) -> OperationResult {
        let id = self.id;
        self.rx.await.unwrap_or(OperationResult {
            id,
            state: OperationState::Cancelled("WORKER STOPPED".to_string()),
            failure: None,
        })
    }
}
