//! Device communication core
//!
//! Transactions ([`Operation`]) made of protocol steps are queued per link
//! by priority and performed one step at a time by a dedicated link worker
//! ([`Poller`]). The [`Dispatcher`] turns device actions into transactions
//! and routes them to the right link.

mod device;
mod dispatcher;
mod error;
mod message_id;
mod operation;
mod poller;
mod priority;
mod queue;

pub use device::{
    CommEvent, Device, DeviceKind, DeviceState, DeviceUpdate, MeterSettings, VehicleEvent,
    DETECTOR_SLOTS,
};
pub use dispatcher::{Dispatcher, LinkProtocol};
pub use error::{CommError, ErrorClass};
pub use message_id::{MessageId, MessageIdCounter, RecentIds};
pub use operation::{
    Completion, FailureKind, Operation, OperationResult, OperationState, RecvStatus, Step,
    StepContext, StepKind, StepOutcome,
};
pub use poller::{LinkStatus, Poller, PollerConfig, PollerHandle};
pub use priority::PriorityClass;
pub use queue::OpQueue;
