//! Detector event listener

use super::message::{DetectorStatus, RawLine};
use crate::core::comm::{CommError, DeviceUpdate, MessageId, RecentIds, RecvStatus, StepContext};
use crate::core::protocol::framing;
use bytes::BytesMut;
use std::collections::VecDeque;

/// Collects `DS` lines, acknowledges each one and suppresses duplicates.
///
/// Never finishes on its own; the link worker re-queues it at idle priority
/// after every turn.
#[derive(Debug)]
pub struct Listener {
    recent: RecentIds<MessageId>,
    pending_acks: VecDeque<MessageId>,
}

impl Listener {
    /// Create a listener remembering the last `capacity` event ids
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: RecentIds::new(capacity),
            pending_acks: VecDeque::new(),
        }
    }

    /// Acknowledgements waiting to be sent
    pub fn pending_acks(&self) -> usize {
        self.pending_acks.len()
    }

    /// Encode pending acknowledgements
    pub fn poll(&mut self, tx: &mut BytesMut) {
        for id in self.pending_acks.drain(..) {
            DetectorStatus::encode_ack(id, tx);
        }
    }

    /// Process stashed and buffered lines
    pub fn recv(
        &mut self,
        ctx: &mut StepContext<'_>,
        rx: &mut BytesMut,
    ) -> Result<RecvStatus, CommError> {
        for data in ctx.take_unsolicited() {
            let mut buf = BytesMut::from(&data[..]);
            self.drain_lines(ctx, &mut buf);
        }
        self.drain_lines(ctx, rx);
        if self.pending_acks.is_empty() {
            Ok(RecvStatus::Incomplete)
        } else {
            Ok(RecvStatus::Complete)
        }
    }

    fn drain_lines(&mut self, ctx: &mut StepContext<'_>, buf: &mut BytesMut) {
        while let Some(bytes) = framing::take_line(buf) {
            let text = String::from_utf8_lossy(&bytes);
            let Some(line) = RawLine::parse(&text) else {
                continue;
            };
            if line.code != DetectorStatus::CODE {
                tracing::debug!("{} ignoring {}", ctx.device().name(), text);
                continue;
            }
            match DetectorStatus::parse(&line) {
                Ok(status) => {
                    // retransmits get acknowledged again
                    self.pending_acks.push_back(status.id);
                    if self.recent.insert(status.id) {
                        ctx.notify(DeviceUpdate::Vehicle(status.event));
                    } else {
                        tracing::debug!("{} duplicate DS {}", ctx.device().name(), status.id);
                    }
                }
                Err(e) => {
                    tracing::warn!("{} skipping DS line: {}", ctx.device().name(), e);
                }
            }
        }
    }
}
